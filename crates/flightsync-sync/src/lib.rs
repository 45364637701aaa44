//! Sync engine: config validation and lifecycle, per-entity incremental sync
//! jobs, the flight-report backfill and the interval scheduler that drives
//! them.

mod backfill;
mod config;
mod jobs;
mod lifecycle;
mod linkage;
mod mapping;
mod registry;
mod scheduler;
mod validator;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use flightsync_provider::TransportFactory;
use flightsync_storage::SyncStore;
use tokio_util::sync::CancellationToken;

pub use backfill::{next_links, BackfillJob};
pub use config::SyncConfig;
pub use jobs::{EntitySyncJob, Job, JobKind, JobRunSummary, RunContext};
pub use lifecycle::{ConfigService, LifecycleError};
pub use linkage::{parse_route, pilot_candidates, ReportLinker, Resolution};
pub use mapping::{
    content_hash, find_renamed, map_record, type_compatible, MappedRecord,
    RENAME_SIMILARITY_THRESHOLD,
};
pub use registry::{JobRegistry, TriggerError};
pub use scheduler::{JobHandle, JobStatus, Scheduler};
pub use validator::{ConfigValidator, ValidateError, ValidationResult, MOSTLY_EMPTY_THRESHOLD};

pub const CRATE_NAME: &str = "flightsync-sync";

/// The job for `kind`, configured from `config`.
pub fn build_job(
    kind: JobKind,
    config: &SyncConfig,
    store: Arc<dyn SyncStore>,
    transports: Arc<dyn TransportFactory>,
) -> Arc<dyn Job> {
    match kind.entity_type() {
        Some(entity_type) => Arc::new(
            EntitySyncJob::new(entity_type, store, transports)
                .with_tenant_concurrency(config.tenant_concurrency),
        ),
        None => Arc::new(BackfillJob::new(
            store,
            config.backfill_batch_size,
            config.backfill_max_attempts,
        )),
    }
}

/// Schedule the three entity sync jobs and the backfill at their configured intervals.
pub fn build_scheduler(
    config: &SyncConfig,
    store: Arc<dyn SyncStore>,
    transports: Arc<dyn TransportFactory>,
    cancel: CancellationToken,
) -> Scheduler {
    let mut scheduler = Scheduler::new(store.clone(), cancel);
    for kind in JobKind::ALL {
        let job = build_job(kind, config, store.clone(), transports.clone());
        scheduler.schedule(job, config.interval(kind));
    }
    scheduler
}

/// Validator configured from `config`, sharing the caller's shutdown token.
pub fn build_validator(
    config: &SyncConfig,
    store: Arc<dyn SyncStore>,
    transports: Arc<dyn TransportFactory>,
    cancel: CancellationToken,
) -> ConfigValidator {
    ConfigValidator::new(store, transports)
        .with_sample_size(config.validation_sample_size)
        .with_timeout(config.validation_timeout())
        .with_cancellation(cancel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use flightsync_core::EntityType;
    use flightsync_storage::MemoryStore;
    use serde_json::json;
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test(start_paused = true)]
    async fn scheduled_jobs_mirror_every_entity() {
        let store = Arc::new(MemoryStore::new());
        let provider = FakeProvider::new();
        provider.set_tables("appA", healthy_tables());
        let tenant = Uuid::new_v4();
        seed_active_config(store.as_ref(), tenant, document("appA")).await;

        let config = SyncConfig::default();
        let scheduler = build_scheduler(
            &config,
            store.clone(),
            Arc::new(provider.clone()),
            CancellationToken::new(),
        );
        let registry = scheduler.registry();
        tokio::time::sleep(Duration::from_secs(5)).await;

        for entity in EntityType::MIRRORED {
            assert_eq!(store.count_mirror_rows(tenant, entity).await.unwrap(), 1);
        }
        let status = registry.status().await;
        assert_eq!(status.len(), 4);
        assert!(status.iter().all(|s| s.runs_completed >= 1 && s.last_error.is_none()));

        provider.upsert_record(
            "appA",
            "Pilots",
            record("p2", json!({"Callsign": "VAX002"}), at(9)),
        );
        registry.trigger(JobKind::PilotSync).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.count_mirror_rows(tenant, EntityType::Pilot).await.unwrap(), 2);
        scheduler.shutdown().await;
    }
}
