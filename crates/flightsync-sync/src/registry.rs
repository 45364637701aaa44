use std::collections::BTreeMap;
use std::sync::Arc;

use flightsync_core::EntityType;
use flightsync_storage::SyncStore;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::jobs::JobKind;
use crate::scheduler::{JobHandle, JobStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TriggerError {
    #[error("unknown job {0:?}")]
    UnknownJob(String),
    #[error("job {0} is not scheduled in this process")]
    NotScheduled(JobKind),
    #[error("job {0} has stopped")]
    Stopped(JobKind),
}

/// Lookup of scheduled jobs by kind, shared with the admin surface.
#[derive(Clone)]
pub struct JobRegistry {
    jobs: BTreeMap<JobKind, JobHandle>,
    store: Arc<dyn SyncStore>,
}

impl JobRegistry {
    pub fn new(jobs: BTreeMap<JobKind, JobHandle>, store: Arc<dyn SyncStore>) -> Self {
        Self { jobs, store }
    }

    pub fn kinds(&self) -> impl Iterator<Item = JobKind> + '_ {
        self.jobs.keys().copied()
    }

    pub fn handle(&self, kind: JobKind) -> Option<&JobHandle> {
        self.jobs.get(&kind)
    }

    pub async fn trigger(&self, kind: JobKind) -> Result<Uuid, TriggerError> {
        self.jobs
            .get(&kind)
            .ok_or(TriggerError::NotScheduled(kind))?
            .trigger()
            .await
    }

    /// Trigger by job or entity name, as typed by an operator.
    pub async fn trigger_named(&self, name: &str) -> Result<Uuid, TriggerError> {
        let kind = JobKind::parse(name).ok_or_else(|| TriggerError::UnknownJob(name.to_string()))?;
        self.trigger(kind).await
    }

    pub async fn trigger_entity(&self, entity_type: EntityType) -> Result<Uuid, TriggerError> {
        let kind = JobKind::for_entity(entity_type)
            .ok_or_else(|| TriggerError::UnknownJob(entity_type.to_string()))?;
        self.trigger(kind).await
    }

    /// Status of every scheduled job, with per-tenant cursors for sync jobs.
    /// A cursor lookup failure leaves that job's cursor list empty.
    pub async fn status(&self) -> Vec<JobStatus> {
        let mut out = Vec::with_capacity(self.jobs.len());
        for handle in self.jobs.values() {
            let mut status = handle.status().await;
            if let Some(entity_type) = handle.kind().entity_type() {
                match self.store.list_cursors(entity_type).await {
                    Ok(cursors) => status.cursors = cursors,
                    Err(err) => {
                        warn!(job = %handle.kind(), error = %err, "could not load cursors")
                    }
                }
            }
            out.push(status);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::{Job, JobRunSummary, RunContext};
    use crate::scheduler::Scheduler;
    use async_trait::async_trait;
    use chrono::Utc;
    use flightsync_storage::{MemoryStore, SyncBatch};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct IdleJob(JobKind);

    #[async_trait]
    impl Job for IdleJob {
        fn kind(&self) -> JobKind {
            self.0
        }

        async fn run(&self, ctx: &RunContext) -> anyhow::Result<JobRunSummary> {
            Ok(JobRunSummary::start(self.0, ctx.run_id).finish())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn triggers_by_name_and_reports_cursors() {
        let store = Arc::new(MemoryStore::new());
        let tenant = Uuid::new_v4();
        let now = Utc::now();
        store
            .apply_sync_batch(&SyncBatch {
                tenant_id: tenant,
                entity_type: EntityType::Pilot,
                rows: Vec::new(),
                cursor: Some(now),
            })
            .await
            .unwrap();

        let mut scheduler = Scheduler::new(store.clone(), CancellationToken::new());
        scheduler.schedule(Arc::new(IdleJob(JobKind::PilotSync)), Duration::from_secs(600));
        scheduler.schedule(Arc::new(IdleJob(JobKind::Backfill)), Duration::from_secs(600));
        let registry = scheduler.registry();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(registry.trigger_named("pilots").await.is_ok());
        assert_eq!(
            registry.trigger_named("weather").await,
            Err(TriggerError::UnknownJob("weather".into()))
        );
        assert_eq!(
            registry.trigger(JobKind::RouteSync).await,
            Err(TriggerError::NotScheduled(JobKind::RouteSync))
        );

        let status = registry.status().await;
        assert_eq!(status.len(), 2);
        let pilot = status.iter().find(|s| s.job == JobKind::PilotSync).unwrap();
        assert_eq!(pilot.cursors.len(), 1);
        assert_eq!(pilot.cursors[0].tenant_id, tenant);
        let backfill = status.iter().find(|s| s.job == JobKind::Backfill).unwrap();
        assert!(backfill.cursors.is_empty());
        scheduler.shutdown().await;
    }
}
