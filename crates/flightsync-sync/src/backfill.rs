//! Retries cross-reference resolution for flight reports whose pilot or
//! route was not yet mirrored when the report was synced.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use flightsync_core::{BackfillStatus, FlightReportLinks, MirrorRow, ProviderType};
use flightsync_storage::{StoreResult, SyncStore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::jobs::{Job, JobKind, JobRunSummary, RunContext};
use crate::linkage::ReportLinker;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct BackfillTally {
    resolved: u64,
    unresolvable: u64,
    pending: u64,
}

pub struct BackfillJob {
    store: Arc<dyn SyncStore>,
    provider_type: ProviderType,
    batch_size: i64,
    max_attempts: i32,
}

impl BackfillJob {
    pub fn new(store: Arc<dyn SyncStore>, batch_size: i64, max_attempts: i32) -> Self {
        Self {
            store,
            provider_type: ProviderType::Airtable,
            batch_size: batch_size.max(1),
            max_attempts: max_attempts.max(1),
        }
    }

    async fn backfill_tenant(
        &self,
        ctx: &RunContext,
        tenant_id: Uuid,
        reports: &[MirrorRow],
    ) -> StoreResult<BackfillTally> {
        let prefix = match self.store.active_config(tenant_id, self.provider_type).await? {
            Some(config) => config
                .parsed_document()
                .map(|doc| doc.linkage.callsign_prefix)
                .unwrap_or_default(),
            None => String::new(),
        };
        let linker = ReportLinker::new(self.store.as_ref(), tenant_id, &prefix);

        let mut tally = BackfillTally::default();
        for report in reports {
            if ctx.cancel.is_cancelled() {
                break;
            }
            let previous = report.links.unwrap_or_default();
            let resolution = linker.resolve(&report.fields).await?;
            let links = next_links(previous, resolution.pilot_id, resolution.route_id, self.max_attempts);
            match links.backfill_status {
                BackfillStatus::Resolved => tally.resolved += 1,
                BackfillStatus::Unresolvable => {
                    tally.unresolvable += 1;
                    debug!(
                        tenant_id = %tenant_id,
                        record_id = %report.provider_record_id,
                        attempts = links.backfill_attempts,
                        "flight report marked unresolvable"
                    );
                }
                BackfillStatus::Unresolved => tally.pending += 1,
            }
            self.store.update_flight_report_links(report.id, links).await?;
        }
        Ok(tally)
    }
}

/// Next bookkeeping state for one report. A failed attempt keeps whatever
/// half of the pair did resolve.
pub fn next_links(
    previous: FlightReportLinks,
    pilot_id: Option<Uuid>,
    route_id: Option<Uuid>,
    max_attempts: i32,
) -> FlightReportLinks {
    let pilot_id = pilot_id.or(previous.pilot_id);
    let route_id = route_id.or(previous.route_id);
    if pilot_id.is_some() && route_id.is_some() {
        return FlightReportLinks {
            pilot_id,
            route_id,
            backfill_status: BackfillStatus::Resolved,
            backfill_attempts: previous.backfill_attempts,
        };
    }
    let attempts = previous.backfill_attempts.saturating_add(1);
    FlightReportLinks {
        pilot_id,
        route_id,
        backfill_status: if attempts >= max_attempts {
            BackfillStatus::Unresolvable
        } else {
            BackfillStatus::Unresolved
        },
        backfill_attempts: attempts,
    }
}

#[async_trait]
impl Job for BackfillJob {
    fn kind(&self) -> JobKind {
        JobKind::Backfill
    }

    async fn run(&self, ctx: &RunContext) -> Result<JobRunSummary> {
        let mut summary = JobRunSummary::start(JobKind::Backfill, ctx.run_id);
        let reports = self
            .store
            .unresolved_flight_reports(self.batch_size)
            .await
            .context("loading unresolved flight reports")?;

        let mut by_tenant: BTreeMap<Uuid, Vec<MirrorRow>> = BTreeMap::new();
        for report in reports {
            by_tenant.entry(report.tenant_id).or_default().push(report);
        }

        for (tenant_id, reports) in &by_tenant {
            if ctx.cancel.is_cancelled() {
                break;
            }
            summary.tenants_processed += 1;
            match self.backfill_tenant(ctx, *tenant_id, reports).await {
                Ok(tally) => {
                    summary.reports_resolved += tally.resolved;
                    summary.reports_unresolvable += tally.unresolvable;
                    summary.reports_pending += tally.pending;
                    info!(
                        run_id = %ctx.run_id,
                        tenant_id = %tenant_id,
                        resolved = tally.resolved,
                        unresolvable = tally.unresolvable,
                        pending = tally.pending,
                        "flight report backfill complete"
                    );
                }
                Err(err) => {
                    summary.tenants_failed += 1;
                    warn!(run_id = %ctx.run_id, tenant_id = %tenant_id, error = %err, "flight report backfill failed");
                }
            }
        }
        Ok(summary.finish())
    }
}
