//! Persistence for tenant configs, validation history, sync cursors, mirror
//! rows and sync history.
//!
//! [`SyncStore`] is the only seam the sync engine and the admin surface talk
//! to. [`PgSyncStore`] is the production backend; [`MemoryStore`] keeps the
//! same semantics in process for tests and dry runs.

mod memory;
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flightsync_core::{
    EntityType, FlightReportLinks, MirrorRow, ProviderType, SyncCursor, SyncHistoryEvent,
    TenantProviderConfig, ValidationHistoryRecord, ValidationStatus,
};
use serde_json::{Map as JsonMap, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::{PgSyncStore, PoolSettings};

pub const CRATE_NAME: &str = "flightsync-storage";

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("config {0} not found")]
    ConfigNotFound(Uuid),
    #[error("tenant {tenant_id} already has {provider_type} config version {version}")]
    VersionConflict {
        tenant_id: Uuid,
        provider_type: ProviderType,
        version: i32,
    },
    #[error("config {config_id} cannot move from {from} to {to}")]
    InvalidTransition {
        config_id: Uuid,
        from: ValidationStatus,
        to: ValidationStatus,
    },
    #[error("config {config_id} is {status}; only valid configs can be activated")]
    NotValidated {
        config_id: Uuid,
        status: ValidationStatus,
    },
    #[error("{0} records are not mirrored")]
    NotMirrored(EntityType),
    #[error("corrupt {column} value {value:?}")]
    Corrupt { column: &'static str, value: String },
}

/// One mapped provider record ready to be written to a mirror table.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorUpsert {
    pub provider_record_id: String,
    pub fields: JsonMap<String, JsonValue>,
    pub content_hash: String,
    pub provider_modified_at: Option<DateTime<Utc>>,
    /// Flight reports only: inline resolution result, applied on insert and
    /// whenever the row content changes.
    pub links: Option<FlightReportLinks>,
}

/// Rows and cursor of one tenant's sync run, written in a single transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncBatch {
    pub tenant_id: Uuid,
    pub entity_type: EntityType,
    pub rows: Vec<MirrorUpsert>,
    /// Highest last-modified time seen in the fetch; `None` leaves the cursor as is.
    pub cursor: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpsertOutcome {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    /// Cursor value after the batch committed.
    pub cursor: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncEventFilter {
    pub tenant_id: Option<Uuid>,
    pub entity_type: Option<EntityType>,
    pub limit: i64,
}

#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn insert_config(&self, config: &TenantProviderConfig) -> StoreResult<()>;

    async fn get_config(&self, config_id: Uuid) -> StoreResult<Option<TenantProviderConfig>>;

    async fn find_config(
        &self,
        tenant_id: Uuid,
        provider_type: ProviderType,
        version: i32,
    ) -> StoreResult<Option<TenantProviderConfig>>;

    async fn latest_config_version(
        &self,
        tenant_id: Uuid,
        provider_type: ProviderType,
    ) -> StoreResult<Option<i32>>;

    /// All versions for a tenant, newest first.
    async fn list_configs(
        &self,
        tenant_id: Uuid,
        provider_type: ProviderType,
    ) -> StoreResult<Vec<TenantProviderConfig>>;

    async fn active_config(
        &self,
        tenant_id: Uuid,
        provider_type: ProviderType,
    ) -> StoreResult<Option<TenantProviderConfig>>;

    /// Active and valid configs across all tenants, ordered by tenant.
    async fn syncable_configs(
        &self,
        provider_type: ProviderType,
    ) -> StoreResult<Vec<TenantProviderConfig>>;

    /// Move a config into `validating`. Fails if a run is already in flight,
    /// unless that run last touched the config before `stale_before`, in which
    /// case it is presumed dead and the new run takes over.
    async fn begin_validation(
        &self,
        config_id: Uuid,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<TenantProviderConfig>;

    /// Record the outcome of a validation run and append its history record
    /// atomically. An `invalid` outcome also clears `is_active`.
    async fn complete_validation(
        &self,
        record: &ValidationHistoryRecord,
    ) -> StoreResult<TenantProviderConfig>;

    /// Activate a valid config and deactivate every other version of the same
    /// (tenant, provider type) in one write.
    async fn activate_config(&self, config_id: Uuid) -> StoreResult<TenantProviderConfig>;

    async fn deactivate_config(&self, config_id: Uuid) -> StoreResult<TenantProviderConfig>;

    /// Validation history for one config, newest first.
    async fn validation_history(
        &self,
        config_id: Uuid,
        limit: i64,
    ) -> StoreResult<Vec<ValidationHistoryRecord>>;

    async fn get_cursor(
        &self,
        tenant_id: Uuid,
        entity_type: EntityType,
    ) -> StoreResult<Option<SyncCursor>>;

    async fn list_cursors(&self, entity_type: EntityType) -> StoreResult<Vec<SyncCursor>>;

    /// Upsert every row (skipping unchanged content hashes) and advance the
    /// cursor to `GREATEST(old, new)`, all or nothing.
    async fn apply_sync_batch(&self, batch: &SyncBatch) -> StoreResult<UpsertOutcome>;

    async fn get_mirror_row(
        &self,
        tenant_id: Uuid,
        entity_type: EntityType,
        provider_record_id: &str,
    ) -> StoreResult<Option<MirrorRow>>;

    async fn count_mirror_rows(&self, tenant_id: Uuid, entity_type: EntityType)
        -> StoreResult<u64>;

    /// Case-insensitive match on the pilot `callsign` field.
    async fn find_pilot_by_callsign(
        &self,
        tenant_id: Uuid,
        callsign: &str,
    ) -> StoreResult<Option<Uuid>>;

    /// Case-insensitive match on the route `origin` and `destination` fields.
    async fn find_route(
        &self,
        tenant_id: Uuid,
        origin: &str,
        destination: &str,
    ) -> StoreResult<Option<Uuid>>;

    /// Flight reports with `backfill_status = 0`, grouped by tenant.
    async fn unresolved_flight_reports(&self, limit: i64) -> StoreResult<Vec<MirrorRow>>;

    /// Sets the cross-references and backfill bookkeeping of one flight report;
    /// no other column is touched.
    async fn update_flight_report_links(
        &self,
        row_id: Uuid,
        links: FlightReportLinks,
    ) -> StoreResult<()>;

    async fn append_sync_event(&self, event: &SyncHistoryEvent) -> StoreResult<()>;

    /// Sync history, newest first.
    async fn recent_sync_events(&self, filter: SyncEventFilter)
        -> StoreResult<Vec<SyncHistoryEvent>>;
}

pub(crate) fn mirror_table(entity_type: EntityType) -> StoreResult<&'static str> {
    match entity_type {
        EntityType::Pilot => Ok("synced_pilots"),
        EntityType::Route => Ok("synced_routes"),
        EntityType::FlightReport => Ok("synced_flight_reports"),
        EntityType::Custom => Err(StoreError::NotMirrored(entity_type)),
    }
}

/// Decode a snake_case enum stored as text.
pub(crate) fn decode_enum<T: serde::de::DeserializeOwned>(
    column: &'static str,
    value: String,
) -> StoreResult<T> {
    serde_json::from_value(JsonValue::String(value.clone()))
        .map_err(|_| StoreError::Corrupt { column, value })
}
