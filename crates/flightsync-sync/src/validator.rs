//! Five-phase validation of a tenant config version.
//!
//! Phases run in order and stop at the first phase that records a hard
//! error, so the history record always names exactly one failing phase. Each
//! phase still checks every schema it covers, which keeps the error list
//! complete for that phase.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use flightsync_core::{
    EntitySchema, ErrorCode, ProviderConfigDocument, ProviderType, SyncError,
    TenantProviderConfig, ValidationHistoryRecord, ValidationPhase, ValidationStatus,
    ValidationTrigger,
};
use flightsync_provider::{ProviderClient, ProviderRecord, TableMeta, TransportFactory};
use flightsync_storage::{StoreError, SyncStore};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::mapping::{coerce, find_renamed, is_empty_value, type_compatible};

/// Share of sampled rows a required field may be empty in before phase 5 fails.
pub const MOSTLY_EMPTY_THRESHOLD: f64 = 0.10;

/// Slack past the run deadline before a `validating` config counts as abandoned.
const ABANDONED_GRACE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub config: TenantProviderConfig,
    pub record: ValidationHistoryRecord,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.record.status == ValidationStatus::Valid
    }
}

#[derive(Debug, Error)]
pub enum ValidateError {
    #[error("tenant {tenant_id} has no {provider_type} config version {version}")]
    ConfigNotFound {
        tenant_id: Uuid,
        provider_type: ProviderType,
        version: i32,
    },
    #[error("validation run aborted: {0}")]
    Aborted(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ValidateError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ConfigNotFound { .. } | Self::Store(StoreError::ConfigNotFound(_)) => {
                ErrorCode::ConfigNotFound
            }
            Self::Aborted(_) | Self::Store(_) => ErrorCode::Unknown,
        }
    }
}

#[derive(Debug, Default)]
struct PhaseReport {
    errors: Vec<SyncError>,
    warnings: Vec<SyncError>,
    completed: Vec<ValidationPhase>,
}

impl PhaseReport {
    fn push(&mut self, err: SyncError) {
        if err.is_warning() {
            self.warnings.push(err);
        } else {
            self.errors.push(err);
        }
    }

    fn failed(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Close `phase`: `Some(phase)` if it recorded a hard error.
    fn close(&mut self, phase: ValidationPhase) -> Option<ValidationPhase> {
        if self.failed() {
            Some(phase)
        } else {
            self.completed.push(phase);
            None
        }
    }

    fn next_phase(&self) -> ValidationPhase {
        ValidationPhase::ORDERED
            .into_iter()
            .find(|p| !self.completed.contains(p))
            .unwrap_or(ValidationPhase::DataQuality)
    }
}

#[derive(Clone)]
pub struct ConfigValidator {
    store: Arc<dyn SyncStore>,
    transports: Arc<dyn TransportFactory>,
    sample_size: u32,
    timeout: Duration,
    cancel: CancellationToken,
}

impl ConfigValidator {
    pub fn new(store: Arc<dyn SyncStore>, transports: Arc<dyn TransportFactory>) -> Self {
        Self {
            store,
            transports,
            sample_size: 100,
            timeout: Duration::from_secs(120),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_sample_size(mut self, sample_size: u32) -> Self {
        self.sample_size = sample_size.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Validate one config version and append its history record. The config
    /// is never activated here.
    pub async fn validate(
        &self,
        tenant_id: Uuid,
        provider_type: ProviderType,
        version: i32,
        trigger: ValidationTrigger,
    ) -> Result<ValidationResult, ValidateError> {
        let config = self
            .store
            .find_config(tenant_id, provider_type, version)
            .await?
            .ok_or(ValidateError::ConfigNotFound {
                tenant_id,
                provider_type,
                version,
            })?;
        self.validate_config(&config, trigger).await
    }

    /// The run itself is spawned: once the config is in `validating`, it
    /// always reaches a recorded outcome even if the caller stops waiting.
    pub async fn validate_config(
        &self,
        config: &TenantProviderConfig,
        trigger: ValidationTrigger,
    ) -> Result<ValidationResult, ValidateError> {
        let abandoned_after = chrono::Duration::from_std(self.timeout + ABANDONED_GRACE)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        self.store
            .begin_validation(config.id, Utc::now() - abandoned_after)
            .await?;

        let validator = self.clone();
        let config = config.clone();
        tokio::spawn(async move { validator.run_and_record(&config, trigger).await })
            .await
            .map_err(|err| ValidateError::Aborted(err.to_string()))?
    }

    async fn run_and_record(
        &self,
        config: &TenantProviderConfig,
        trigger: ValidationTrigger,
    ) -> Result<ValidationResult, ValidateError> {
        let started = Instant::now();

        let mut report = PhaseReport::default();
        let phase_failed = self.run_phases(config, &mut report).await;
        let status = if report.failed() {
            ValidationStatus::Invalid
        } else {
            ValidationStatus::Valid
        };

        let record = ValidationHistoryRecord {
            id: Uuid::new_v4(),
            config_id: config.id,
            tenant_id: config.tenant_id,
            config_version: config.version,
            status,
            errors: report.errors,
            warnings: report.warnings,
            phases_completed: report.completed,
            phase_failed,
            duration_ms: started.elapsed().as_millis() as u64,
            triggered_by: trigger,
            created_at: Utc::now(),
        };
        let config = self.store.complete_validation(&record).await?;

        match record.phase_failed {
            Some(phase) => warn!(
                tenant_id = %config.tenant_id,
                version = config.version,
                phase = phase.as_str(),
                errors = record.errors.len(),
                code = record.errors.first().map(|e| e.code.as_str()).unwrap_or_default(),
                "config validation failed"
            ),
            None => info!(
                tenant_id = %config.tenant_id,
                version = config.version,
                warnings = record.warnings.len(),
                duration_ms = record.duration_ms,
                "config validation passed"
            ),
        }
        Ok(ValidationResult { config, record })
    }

    async fn run_phases(
        &self,
        config: &TenantProviderConfig,
        report: &mut PhaseReport,
    ) -> Option<ValidationPhase> {
        let document = match config.parsed_document() {
            Ok(document) => document,
            Err(err) => {
                for problem in err.to_sync_errors() {
                    report.push(problem.in_phase(ValidationPhase::SchemaParse));
                }
                return Some(ValidationPhase::SchemaParse);
            }
        };
        if document.enabled_schemas().next().is_none() {
            report.push(
                SyncError::new(ErrorCode::ConfigMalformed, "no entity schema is enabled")
                    .in_phase(ValidationPhase::SchemaParse),
            );
        }
        if let Some(failed) = report.close(ValidationPhase::SchemaParse) {
            return Some(failed);
        }

        let deadline = self.timeout;
        match tokio::time::timeout(deadline, self.remote_phases(&document, report)).await {
            Ok(failed) => failed,
            Err(_) => {
                let phase = report.next_phase();
                report.push(
                    SyncError::new(
                        ErrorCode::ValidationTimeout,
                        format!("validation did not finish within {}s", deadline.as_secs()),
                    )
                    .in_phase(phase)
                    .with_detail("timeout_secs", deadline.as_secs()),
                );
                Some(phase)
            }
        }
    }

    async fn remote_phases(
        &self,
        document: &ProviderConfigDocument,
        report: &mut PhaseReport,
    ) -> Option<ValidationPhase> {
        let client = match self
            .transports
            .transport(&document.credentials, &document.sync)
        {
            Ok(transport) => {
                ProviderClient::new(transport, &document.sync, self.cancel.child_token())
                    .with_label(document.credentials.base_id.clone())
            }
            Err(err) => {
                report.push(err.to_sync_error().in_phase(ValidationPhase::Credentials));
                return Some(ValidationPhase::Credentials);
            }
        };

        let tables = match client.list_tables().await {
            Ok(tables) => tables,
            Err(err) => {
                report.push(err.to_sync_error().in_phase(ValidationPhase::Credentials));
                return Some(ValidationPhase::Credentials);
            }
        };
        report.close(ValidationPhase::Credentials);

        let mut reachable: Vec<(&EntitySchema, &TableMeta)> = Vec::new();
        for schema in document.enabled_schemas() {
            if let Some(meta) = check_table(&client, &tables, schema, report).await {
                reachable.push((schema, meta));
            }
        }
        if let Some(failed) = report.close(ValidationPhase::TableAccess) {
            return Some(failed);
        }

        for (schema, meta) in &reachable {
            check_fields(schema, meta, report);
        }
        if let Some(failed) = report.close(ValidationPhase::FieldPresence) {
            return Some(failed);
        }

        for (schema, _) in &reachable {
            let fields = schema.provider_fields();
            match client.sample(&schema.table, &fields, self.sample_size).await {
                Ok(rows) => check_sample(schema, &rows, report),
                Err(err) => report.push(
                    err.to_sync_error()
                        .in_phase(ValidationPhase::DataQuality)
                        .for_entity(schema.entity_type)
                        .for_table(&schema.table),
                ),
            }
        }
        report.close(ValidationPhase::DataQuality)
    }
}

async fn check_table<'t>(
    client: &ProviderClient,
    tables: &'t [TableMeta],
    schema: &EntitySchema,
    report: &mut PhaseReport,
) -> Option<&'t TableMeta> {
    let scoped = |err: SyncError| {
        err.in_phase(ValidationPhase::TableAccess)
            .for_entity(schema.entity_type)
            .for_table(&schema.table)
    };
    let Some(meta) = tables.iter().find(|t| t.matches(&schema.table)) else {
        report.push(scoped(SyncError::new(
            ErrorCode::TableNotFound,
            format!("table {} does not exist in the base", schema.table),
        )));
        return None;
    };
    match client.probe(&schema.table).await {
        Ok(()) => Some(meta),
        Err(err) => {
            report.push(scoped(err.to_sync_error()));
            None
        }
    }
}

fn check_fields(schema: &EntitySchema, meta: &TableMeta, report: &mut PhaseReport) {
    let available: Vec<&str> = meta.fields.iter().map(|f| f.name.as_str()).collect();
    let scoped = |err: SyncError, field: &str| {
        err.in_phase(ValidationPhase::FieldPresence)
            .for_entity(schema.entity_type)
            .for_table(&schema.table)
            .for_field(field)
    };
    let missing = |field: &str| match find_renamed(field, available.iter().copied()) {
        Some(suggested) => SyncError::new(
            ErrorCode::FieldRenamed,
            format!("field {field} not found; did you mean {suggested}?"),
        )
        .with_detail("suggested", suggested),
        None => SyncError::new(ErrorCode::FieldNotFound, format!("field {field} not found")),
    };

    for mapping in &schema.fields {
        match meta.field(&mapping.provider) {
            Some(field) if !type_compatible(mapping.data_type, &field.field_type) => {
                report.push(scoped(
                    SyncError::new(
                        ErrorCode::FieldTypeMismatch,
                        format!(
                            "field {} is {} but is mapped as {}",
                            mapping.provider,
                            field.field_type,
                            mapping.data_type.as_str()
                        ),
                    )
                    .with_detail("expected", mapping.data_type.as_str())
                    .with_detail("actual", field.field_type.as_str()),
                    &mapping.provider,
                ));
            }
            Some(_) => {}
            None => report.push(scoped(missing(&mapping.provider), &mapping.provider)),
        }
    }

    if let Some(field) = &schema.last_modified_field {
        if meta.field(field).is_none() {
            report.push(scoped(missing(field).with_detail("role", "last_modified"), field));
        }
    }
}

fn check_sample(schema: &EntitySchema, rows: &[ProviderRecord], report: &mut PhaseReport) {
    if rows.is_empty() {
        return;
    }
    let total = rows.len();
    let bot_field = schema.bot_metadata_field().map(|m| m.provider.as_str());

    for mapping in &schema.fields {
        if Some(mapping.provider.as_str()) == bot_field {
            continue;
        }
        let scoped = |err: SyncError| {
            err.in_phase(ValidationPhase::DataQuality)
                .for_entity(schema.entity_type)
                .for_table(&schema.table)
                .for_field(&mapping.provider)
                .with_detail("sample_size", total)
        };
        let values: Vec<Option<&serde_json::Value>> =
            rows.iter().map(|r| r.fields.get(&mapping.provider)).collect();

        let empty = values.iter().filter(|v| is_empty_value(**v)).count();
        if mapping.required && empty > 0 {
            let ratio = empty as f64 / total as f64;
            let err = if ratio > MOSTLY_EMPTY_THRESHOLD {
                SyncError::new(
                    ErrorCode::RequiredFieldMostlyEmpty,
                    format!(
                        "required field {} is empty in {empty} of {total} sampled rows",
                        mapping.provider
                    ),
                )
            } else {
                SyncError::new(
                    ErrorCode::RequiredFieldEmpty,
                    format!(
                        "required field {} is empty in {empty} of {total} sampled rows",
                        mapping.provider
                    ),
                )
                .warning()
            };
            report.push(
                scoped(err)
                    .with_detail("empty_count", empty)
                    .with_detail("empty_ratio", ratio),
            );
        }

        let unconvertible = values
            .iter()
            .flatten()
            .filter(|v| !is_empty_value(Some(**v)))
            .filter(|v| coerce(v, mapping.data_type).is_err())
            .count();
        if unconvertible > 0 {
            report.push(
                scoped(
                    SyncError::new(
                        ErrorCode::TypeConversionFailed,
                        format!(
                            "{unconvertible} sampled values of {} cannot be read as {}",
                            mapping.provider,
                            mapping.data_type.as_str()
                        ),
                    )
                    .warning(),
                )
                .with_detail("failed_count", unconvertible),
            );
        }
    }
}
