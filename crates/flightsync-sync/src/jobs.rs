//! Scheduled jobs: the per-entity sync job and its run summary.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flightsync_core::{
    EntitySchema, EntityType, ErrorCode, FlightReportLinks, ProviderConfigDocument,
    ProviderType, SyncError, SyncEventStatus, SyncHistoryEvent,
};
use flightsync_provider::{ModifiedSince, ProviderClient, ProviderError, TransportFactory};
use flightsync_storage::{MirrorUpsert, StoreError, SyncBatch, SyncStore, UpsertOutcome};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::linkage::ReportLinker;
use crate::mapping::{map_record, record_modified_at};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    PilotSync,
    RouteSync,
    FlightReportSync,
    Backfill,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        Self::PilotSync,
        Self::RouteSync,
        Self::FlightReportSync,
        Self::Backfill,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PilotSync => "pilot_sync",
            Self::RouteSync => "route_sync",
            Self::FlightReportSync => "flight_report_sync",
            Self::Backfill => "backfill",
        }
    }

    /// Accepts job names and entity names ("pilot", "pireps", ...).
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_ascii_lowercase().replace('-', "_");
        match value.as_str() {
            "pilot_sync" => Some(Self::PilotSync),
            "route_sync" => Some(Self::RouteSync),
            "flight_report_sync" => Some(Self::FlightReportSync),
            "backfill" | "flight_report_backfill" => Some(Self::Backfill),
            other => EntityType::parse(other).and_then(Self::for_entity),
        }
    }

    pub fn for_entity(entity_type: EntityType) -> Option<Self> {
        match entity_type {
            EntityType::Pilot => Some(Self::PilotSync),
            EntityType::Route => Some(Self::RouteSync),
            EntityType::FlightReport => Some(Self::FlightReportSync),
            EntityType::Custom => None,
        }
    }

    /// Entity mirrored by this job; `None` for the backfill.
    pub fn entity_type(&self) -> Option<EntityType> {
        match self {
            Self::PilotSync => Some(EntityType::Pilot),
            Self::RouteSync => Some(EntityType::Route),
            Self::FlightReportSync => Some(EntityType::FlightReport),
            Self::Backfill => None,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-run identity and shutdown signal handed to [`Job::run`].
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub cancel: CancellationToken,
}

impl RunContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            cancel,
        }
    }
}

#[async_trait]
pub trait Job: Send + Sync {
    fn kind(&self) -> JobKind;

    /// One full pass over every eligible tenant. Per-tenant failures are
    /// counted in the summary; only failures that stop the whole pass are
    /// returned as errors.
    async fn run(&self, ctx: &RunContext) -> Result<JobRunSummary>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRunSummary {
    pub run_id: Uuid,
    pub job: JobKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tenants_processed: u32,
    pub tenants_failed: u32,
    pub records_fetched: u64,
    pub records_inserted: u64,
    pub records_updated: u64,
    pub records_unchanged: u64,
    pub records_rejected: u64,
    pub reports_resolved: u64,
    pub reports_unresolvable: u64,
    pub reports_pending: u64,
}

impl JobRunSummary {
    pub fn start(job: JobKind, run_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            job,
            started_at: now,
            finished_at: now,
            tenants_processed: 0,
            tenants_failed: 0,
            records_fetched: 0,
            records_inserted: 0,
            records_updated: 0,
            records_unchanged: 0,
            records_rejected: 0,
            reports_resolved: 0,
            reports_unresolvable: 0,
            reports_pending: 0,
        }
    }

    pub fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }

    fn absorb(&mut self, tally: &TenantTally) {
        self.tenants_processed += 1;
        self.records_fetched += tally.fetched;
        self.records_inserted += tally.outcome.inserted;
        self.records_updated += tally.outcome.updated;
        self.records_unchanged += tally.outcome.unchanged;
        self.records_rejected += tally.rejected;
        self.reports_resolved += tally.reports_resolved;
        self.reports_pending += tally.reports_pending;
    }
}

#[derive(Debug, Error)]
enum TenantSyncError {
    #[error("config document unreadable: {0}")]
    Document(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TenantSyncError {
    fn to_sync_error(&self) -> SyncError {
        match self {
            Self::Provider(err) => err.to_sync_error(),
            Self::Document(message) => {
                SyncError::new(ErrorCode::ConfigMalformed, message.clone())
            }
            Self::Store(err) => {
                SyncError::new(ErrorCode::Unknown, err.to_string())
                    .with_detail("source", "store")
            }
        }
    }
}

#[derive(Debug, Default)]
struct TenantTally {
    fetched: u64,
    rejected: u64,
    reports_resolved: u64,
    reports_pending: u64,
    outcome: UpsertOutcome,
    warnings: Vec<SyncError>,
}

/// Mirrors one entity type for every tenant with a syncable config.
pub struct EntitySyncJob {
    entity_type: EntityType,
    provider_type: ProviderType,
    store: Arc<dyn SyncStore>,
    transports: Arc<dyn TransportFactory>,
    tenant_concurrency: usize,
}

impl EntitySyncJob {
    pub fn new(
        entity_type: EntityType,
        store: Arc<dyn SyncStore>,
        transports: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            entity_type,
            provider_type: ProviderType::Airtable,
            store,
            transports,
            tenant_concurrency: 4,
        }
    }

    pub fn with_tenant_concurrency(mut self, tenant_concurrency: usize) -> Self {
        self.tenant_concurrency = tenant_concurrency.max(1);
        self
    }

    pub fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    async fn sync_schema(
        &self,
        ctx: &RunContext,
        tenant_id: Uuid,
        document: &ProviderConfigDocument,
        schema: &EntitySchema,
        previous: Option<DateTime<Utc>>,
    ) -> Result<TenantTally, TenantSyncError> {
        let transport = self
            .transports
            .transport(&document.credentials, &document.sync)?;
        let client = ProviderClient::new(transport, &document.sync, ctx.cancel.child_token())
            .with_label(tenant_id.to_string());

        let filter = match (&schema.last_modified_field, previous) {
            (Some(field), Some(since)) => Some(ModifiedSince {
                field: field.clone(),
                since,
            }),
            _ => None,
        };
        let records = client
            .fetch(&schema.table, filter.as_ref(), &schema.provider_fields())
            .await?;

        let mut tally = TenantTally {
            fetched: records.len() as u64,
            ..TenantTally::default()
        };
        let cursor = records
            .iter()
            .filter_map(|r| record_modified_at(schema, r))
            .max();

        let linker = ReportLinker::new(
            self.store.as_ref(),
            tenant_id,
            &document.linkage.callsign_prefix,
        );
        let mut rows = Vec::with_capacity(records.len());
        for record in &records {
            let mapped = match map_record(schema, record) {
                Ok(mapped) => mapped,
                Err(errors) => {
                    tally.rejected += 1;
                    debug!(tenant_id = %tenant_id, record_id = %record.id, errors = errors.len(), "record rejected");
                    tally.warnings.extend(errors);
                    continue;
                }
            };
            tally.warnings.extend(mapped.warnings);

            let links = if self.entity_type == EntityType::FlightReport {
                let resolution = linker.resolve(&mapped.fields).await?;
                if resolution.is_complete() {
                    tally.reports_resolved += 1;
                } else {
                    tally.reports_pending += 1;
                }
                Some(FlightReportLinks::from_resolution(
                    resolution.pilot_id,
                    resolution.route_id,
                ))
            } else {
                None
            };

            rows.push(MirrorUpsert {
                provider_record_id: mapped.provider_record_id,
                fields: mapped.fields,
                content_hash: mapped.content_hash,
                provider_modified_at: mapped.modified_at,
                links,
            });
        }

        tally.outcome = self
            .store
            .apply_sync_batch(&SyncBatch {
                tenant_id,
                entity_type: self.entity_type,
                rows,
                cursor,
            })
            .await?;
        Ok(tally)
    }

    async fn record_event(
        &self,
        ctx: &RunContext,
        tenant_id: Uuid,
        previous_cursor: Option<DateTime<Utc>>,
        started: Instant,
        result: &Result<TenantTally, TenantSyncError>,
    ) {
        let mut event = SyncHistoryEvent {
            id: Uuid::new_v4(),
            run_id: ctx.run_id,
            tenant_id,
            event_type: self.entity_type.sync_event_type().to_string(),
            entity_type: self.entity_type,
            status: SyncEventStatus::Success,
            previous_cursor,
            cursor: previous_cursor,
            records_fetched: 0,
            records_inserted: 0,
            records_updated: 0,
            records_unchanged: 0,
            records_rejected: 0,
            errors: Vec::new(),
            duration_ms: started.elapsed().as_millis() as u64,
            created_at: Utc::now(),
        };
        match result {
            Ok(tally) => {
                event.cursor = tally.outcome.cursor.or(previous_cursor);
                event.records_fetched = tally.fetched;
                event.records_inserted = tally.outcome.inserted;
                event.records_updated = tally.outcome.updated;
                event.records_unchanged = tally.outcome.unchanged;
                event.records_rejected = tally.rejected;
                event.errors = tally.warnings.clone();
                info!(
                    run_id = %ctx.run_id,
                    tenant_id = %tenant_id,
                    entity = %self.entity_type,
                    fetched = tally.fetched,
                    inserted = tally.outcome.inserted,
                    updated = tally.outcome.updated,
                    unchanged = tally.outcome.unchanged,
                    rejected = tally.rejected,
                    "tenant sync complete"
                );
            }
            Err(err) => {
                event.status = SyncEventStatus::Failed;
                event.errors = vec![err.to_sync_error().for_entity(self.entity_type)];
                warn!(
                    run_id = %ctx.run_id,
                    tenant_id = %tenant_id,
                    entity = %self.entity_type,
                    error = %err,
                    "tenant sync failed; cursor left unchanged"
                );
            }
        }
        if let Err(err) = self.store.append_sync_event(&event).await {
            warn!(tenant_id = %tenant_id, error = %err, "could not record sync event");
        }
    }
}

#[async_trait]
impl Job for EntitySyncJob {
    fn kind(&self) -> JobKind {
        JobKind::for_entity(self.entity_type).unwrap_or(JobKind::Backfill)
    }

    async fn run(&self, ctx: &RunContext) -> Result<JobRunSummary> {
        let mut summary = JobRunSummary::start(self.kind(), ctx.run_id);
        let configs = self
            .store
            .syncable_configs(self.provider_type)
            .await
            .with_context(|| format!("listing {} configs", self.provider_type))?;

        let outcomes: Vec<_> = stream::iter(configs)
            .map(|config| async move {
                let started = Instant::now();
                let tenant_id = config.tenant_id;
                let (previous, result) = match config.parsed_document() {
                    Err(err) => (None, Err(TenantSyncError::Document(err.to_string()))),
                    Ok(document) => {
                        let schema = document.schema_for(self.entity_type)?;
                        match self.store.get_cursor(tenant_id, self.entity_type).await {
                            Err(err) => (None, Err(TenantSyncError::from(err))),
                            Ok(cursor) => {
                                let previous = cursor.map(|c| c.last_synced_at);
                                let result = self
                                    .sync_schema(ctx, tenant_id, &document, schema, previous)
                                    .await;
                                (previous, result)
                            }
                        }
                    }
                };
                self.record_event(ctx, tenant_id, previous, started, &result)
                    .await;
                Some(result)
            })
            .buffer_unordered(self.tenant_concurrency.max(1))
            .filter_map(|outcome| async move { outcome })
            .collect()
            .await;

        for outcome in &outcomes {
            match outcome {
                Ok(tally) => summary.absorb(tally),
                Err(_) => {
                    summary.tenants_processed += 1;
                    summary.tenants_failed += 1;
                }
            }
        }
        Ok(summary.finish())
    }
}
