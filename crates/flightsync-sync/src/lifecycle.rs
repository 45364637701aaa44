//! Administrative config lifecycle: submit a new version, activate a
//! validated one, deactivate the active one.

use std::collections::BTreeSet;
use std::sync::Arc;

use flightsync_core::{ErrorCode, ProviderType, TenantProviderConfig, ValidationStatus};
use flightsync_storage::{StoreError, SyncStore};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("tenant {tenant_id} has no {provider_type} config version {version}")]
    ConfigNotFound {
        tenant_id: Uuid,
        provider_type: ProviderType,
        version: i32,
    },
    #[error("config version {version} is not validated (status {status})")]
    NotValidated {
        version: i32,
        status: ValidationStatus,
    },
    #[error("tenant {tenant_id} has no active {provider_type} config")]
    NotActive {
        tenant_id: Uuid,
        provider_type: ProviderType,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LifecycleError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ConfigNotFound { .. } | Self::Store(StoreError::ConfigNotFound(_)) => {
                ErrorCode::ConfigNotFound
            }
            Self::NotValidated { .. } | Self::Store(StoreError::NotValidated { .. }) => {
                ErrorCode::ConfigNotValidated
            }
            Self::NotActive { .. } => ErrorCode::ConfigNotActive,
            Self::Store(_) => ErrorCode::Unknown,
        }
    }
}

#[derive(Clone)]
pub struct ConfigService {
    store: Arc<dyn SyncStore>,
}

impl ConfigService {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }

    /// Store `document` as the next version in `pending`. Older versions are kept.
    pub async fn submit(
        &self,
        tenant_id: Uuid,
        provider_type: ProviderType,
        document: JsonValue,
        enabled_features: BTreeSet<String>,
    ) -> Result<TenantProviderConfig, LifecycleError> {
        let version = self
            .store
            .latest_config_version(tenant_id, provider_type)
            .await?
            .unwrap_or(0)
            + 1;
        let config = TenantProviderConfig::new_version(
            tenant_id,
            provider_type,
            version,
            document,
            enabled_features,
        );
        self.store.insert_config(&config).await?;
        info!(tenant_id = %tenant_id, provider = %provider_type, version, "config version submitted");
        Ok(config)
    }

    /// Make `version` the tenant's active config. Requires a `valid` status
    /// backed by a passing latest validation record.
    pub async fn activate(
        &self,
        tenant_id: Uuid,
        provider_type: ProviderType,
        version: i32,
    ) -> Result<TenantProviderConfig, LifecycleError> {
        let config = self
            .store
            .find_config(tenant_id, provider_type, version)
            .await?
            .ok_or(LifecycleError::ConfigNotFound {
                tenant_id,
                provider_type,
                version,
            })?;

        let latest_passed = self
            .store
            .validation_history(config.id, 1)
            .await?
            .first()
            .is_some_and(|record| record.status == ValidationStatus::Valid);
        if config.validation_status != ValidationStatus::Valid || !latest_passed {
            return Err(LifecycleError::NotValidated {
                version,
                status: config.validation_status,
            });
        }

        let active = self.store.activate_config(config.id).await?;
        info!(tenant_id = %tenant_id, provider = %provider_type, version, "config version activated");
        Ok(active)
    }

    pub async fn deactivate(
        &self,
        tenant_id: Uuid,
        provider_type: ProviderType,
    ) -> Result<TenantProviderConfig, LifecycleError> {
        let active = self
            .store
            .active_config(tenant_id, provider_type)
            .await?
            .ok_or(LifecycleError::NotActive {
                tenant_id,
                provider_type,
            })?;
        let config = self.store.deactivate_config(active.id).await?;
        info!(tenant_id = %tenant_id, provider = %provider_type, version = config.version, "config deactivated");
        Ok(config)
    }
}
