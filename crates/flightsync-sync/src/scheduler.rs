//! Interval scheduler. Every job runs on its own supervisor task: run, wait
//! for the interval (or a manual trigger), run again. A job never overlaps
//! with itself, and a failing or panicking run never stops the loop.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flightsync_core::SyncCursor;
use flightsync_storage::SyncStore;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::jobs::{Job, JobKind, JobRunSummary, RunContext};
use crate::registry::{JobRegistry, TriggerError};

#[derive(Debug, Default)]
struct JobState {
    alive: bool,
    running: bool,
    last_run_id: Option<Uuid>,
    last_started_at: Option<DateTime<Utc>>,
    last_finished_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    last_summary: Option<JobRunSummary>,
    runs_completed: u64,
    pending_run_id: Option<Uuid>,
}

/// Point-in-time view of one scheduled job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub job: JobKind,
    pub interval_secs: u64,
    pub alive: bool,
    pub running: bool,
    pub last_run_id: Option<Uuid>,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_summary: Option<JobRunSummary>,
    pub runs_completed: u64,
    pub pending_run_id: Option<Uuid>,
    /// Per-tenant cursors of the job's entity; empty for the backfill.
    pub cursors: Vec<SyncCursor>,
}

/// Shared handle to a scheduled job's state and trigger.
#[derive(Clone)]
pub struct JobHandle {
    kind: JobKind,
    interval: Duration,
    state: Arc<Mutex<JobState>>,
    wake: Arc<Notify>,
}

impl JobHandle {
    fn new(kind: JobKind, interval: Duration) -> Self {
        Self {
            kind,
            interval,
            state: Arc::new(Mutex::new(JobState {
                alive: true,
                ..JobState::default()
            })),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Queue an immediate run and return its run id. A run already queued is
    /// not queued twice; its id is returned instead. A trigger during a run
    /// starts the next run as soon as the current one finishes.
    pub async fn trigger(&self) -> Result<Uuid, TriggerError> {
        let mut state = self.state.lock().await;
        if !state.alive {
            return Err(TriggerError::Stopped(self.kind));
        }
        if let Some(pending) = state.pending_run_id {
            return Ok(pending);
        }
        let run_id = Uuid::new_v4();
        state.pending_run_id = Some(run_id);
        self.wake.notify_one();
        Ok(run_id)
    }

    pub async fn status(&self) -> JobStatus {
        let state = self.state.lock().await;
        JobStatus {
            job: self.kind,
            interval_secs: self.interval.as_secs(),
            alive: state.alive,
            running: state.running,
            last_run_id: state.last_run_id,
            last_started_at: state.last_started_at,
            last_finished_at: state.last_finished_at,
            last_error: state.last_error.clone(),
            last_summary: state.last_summary.clone(),
            runs_completed: state.runs_completed,
            pending_run_id: state.pending_run_id,
            cursors: Vec::new(),
        }
    }

    async fn has_pending_run(&self) -> bool {
        self.state.lock().await.pending_run_id.is_some()
    }

    async fn mark_started(&self) -> Uuid {
        let mut state = self.state.lock().await;
        let run_id = state.pending_run_id.take().unwrap_or_else(Uuid::new_v4);
        state.running = true;
        state.last_run_id = Some(run_id);
        state.last_started_at = Some(Utc::now());
        run_id
    }

    async fn mark_finished(&self, outcome: Result<JobRunSummary, String>) {
        let mut state = self.state.lock().await;
        state.running = false;
        state.runs_completed += 1;
        state.last_finished_at = Some(Utc::now());
        match outcome {
            Ok(summary) => {
                state.last_error = None;
                state.last_summary = Some(summary);
            }
            Err(message) => state.last_error = Some(message),
        }
    }

    async fn mark_stopped(&self) {
        let mut state = self.state.lock().await;
        state.alive = false;
        state.running = false;
        state.pending_run_id = None;
    }
}

pub struct Scheduler {
    store: Arc<dyn SyncStore>,
    cancel: CancellationToken,
    handles: BTreeMap<JobKind, JobHandle>,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn SyncStore>, cancel: CancellationToken) -> Self {
        Self {
            store,
            cancel,
            handles: BTreeMap::new(),
            tasks: Vec::new(),
        }
    }

    /// Start `job` on its own task. The first run starts immediately.
    pub fn schedule(&mut self, job: Arc<dyn Job>, interval: Duration) -> JobHandle {
        let handle = JobHandle::new(job.kind(), interval);
        let task = tokio::spawn(supervise(job, handle.clone(), self.cancel.clone()));
        self.handles.insert(handle.kind, handle.clone());
        self.tasks.push(task);
        info!(job = %handle.kind, interval_secs = interval.as_secs(), "job scheduled");
        handle
    }

    pub fn registry(&self) -> JobRegistry {
        JobRegistry::new(self.handles.clone(), self.store.clone())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signal every job to stop and wait for in-flight runs to return.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(err) = task.await {
                error!(error = %err, "job supervisor task failed");
            }
        }
        info!("scheduler stopped");
    }
}

async fn supervise(job: Arc<dyn Job>, handle: JobHandle, cancel: CancellationToken) {
    let kind = handle.kind;
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let run_id = handle.mark_started().await;
        let ctx = RunContext {
            run_id,
            cancel: cancel.clone(),
        };
        info!(job = %kind, run_id = %run_id, "job run started");

        let outcome = match AssertUnwindSafe(job.run(&ctx)).catch_unwind().await {
            Ok(Ok(summary)) => {
                info!(
                    job = %kind,
                    run_id = %run_id,
                    tenants = summary.tenants_processed,
                    failed = summary.tenants_failed,
                    "job run finished"
                );
                Ok(summary)
            }
            Ok(Err(err)) => {
                let message = format!("{err:#}");
                warn!(job = %kind, run_id = %run_id, error = %message, "job run failed");
                Err(message)
            }
            Err(_) => {
                error!(job = %kind, run_id = %run_id, "job run panicked");
                Err("job run panicked".to_string())
            }
        };
        handle.mark_finished(outcome).await;

        if !wait_for_next_run(&handle, &cancel).await {
            break;
        }
    }
    handle.mark_stopped().await;
    info!(job = %kind, "job stopped");
}

/// Wait out the interval or a trigger; `false` on cancellation. A wake-up
/// left over from a trigger the previous run already served is ignored.
async fn wait_for_next_run(handle: &JobHandle, cancel: &CancellationToken) -> bool {
    let interval = tokio::time::sleep(handle.interval);
    tokio::pin!(interval);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            _ = handle.wake.notified() => {
                if handle.has_pending_run().await {
                    return true;
                }
            }
            _ = &mut interval => return true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use flightsync_storage::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Probe {
        active: AtomicUsize,
        max_active: AtomicUsize,
        started: AtomicUsize,
    }

    struct ScriptedJob {
        kind: JobKind,
        work: Duration,
        fail: bool,
        panic_first: bool,
        probe: Arc<Probe>,
    }

    impl ScriptedJob {
        fn new(kind: JobKind, work: Duration, probe: Arc<Probe>) -> Self {
            Self {
                kind,
                work,
                fail: false,
                panic_first: false,
                probe,
            }
        }
    }

    #[async_trait]
    impl Job for ScriptedJob {
        fn kind(&self) -> JobKind {
            self.kind
        }

        async fn run(&self, ctx: &RunContext) -> anyhow::Result<JobRunSummary> {
            let nth = self.probe.started.fetch_add(1, Ordering::SeqCst);
            let active = self.probe.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.probe.max_active.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            self.probe.active.fetch_sub(1, Ordering::SeqCst);
            if self.panic_first && nth == 0 {
                panic!("scripted panic");
            }
            if self.fail {
                return Err(anyhow!("provider unreachable"));
            }
            Ok(JobRunSummary::start(self.kind, ctx.run_id).finish())
        }
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(Arc::new(MemoryStore::new()), CancellationToken::new())
    }

    #[tokio::test(start_paused = true)]
    async fn runs_never_overlap() {
        let probe = Arc::new(Probe::default());
        let mut scheduler = scheduler();
        let job = ScriptedJob::new(JobKind::PilotSync, Duration::from_secs(10), probe.clone());
        let handle = scheduler.schedule(Arc::new(job), Duration::from_secs(1));

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(3)).await;
            handle.trigger().await.unwrap();
        }
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(probe.max_active.load(Ordering::SeqCst), 1);
        assert!(handle.status().await.runs_completed >= 3);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_runs_with_the_returned_id() {
        let probe = Arc::new(Probe::default());
        let mut scheduler = scheduler();
        let job = ScriptedJob::new(JobKind::RouteSync, Duration::from_millis(10), probe.clone());
        let handle = scheduler.schedule(Arc::new(job), Duration::from_secs(3600));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(probe.started.load(Ordering::SeqCst), 1);

        let first = handle.trigger().await.unwrap();
        let second = handle.trigger().await.unwrap();
        assert_eq!(first, second);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let status = handle.status().await;
        assert_eq!(probe.started.load(Ordering::SeqCst), 2);
        assert_eq!(status.last_run_id, Some(first));
        assert_eq!(status.pending_run_id, None);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn served_trigger_does_not_start_an_extra_run() {
        let probe = Arc::new(Probe::default());
        let mut scheduler = scheduler();
        let job = ScriptedJob::new(JobKind::RouteSync, Duration::from_millis(10), probe.clone());
        let handle = scheduler.schedule(Arc::new(job), Duration::from_secs(600));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(probe.started.load(Ordering::SeqCst), 1);

        // Permit whose run id was already taken by the run that just finished.
        handle.wake.notify_one();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(probe.started.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(probe.started.load(Ordering::SeqCst), 2);
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failures_and_panics_keep_the_loop_alive() {
        let probe = Arc::new(Probe::default());
        let mut scheduler = scheduler();
        let mut job = ScriptedJob::new(JobKind::Backfill, Duration::from_millis(1), probe.clone());
        job.panic_first = true;
        job.fail = true;
        let handle = scheduler.schedule(Arc::new(job), Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let status = handle.status().await;
        assert_eq!(status.last_error.as_deref(), Some("job run panicked"));
        assert!(status.alive);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let status = handle.status().await;
        assert_eq!(status.runs_completed, 2);
        assert_eq!(status.last_error.as_deref(), Some("provider unreachable"));
        scheduler.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_the_running_job() {
        let probe = Arc::new(Probe::default());
        let mut scheduler = scheduler();
        let job = ScriptedJob::new(JobKind::PilotSync, Duration::from_secs(20), probe.clone());
        let handle = scheduler.schedule(Arc::new(job), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(handle.status().await.running);

        scheduler.shutdown().await;
        let status = handle.status().await;
        assert!(!status.alive);
        assert!(!status.running);
        assert_eq!(status.runs_completed, 1);
        assert_eq!(probe.active.load(Ordering::SeqCst), 0);
        assert!(matches!(handle.trigger().await, Err(TriggerError::Stopped(JobKind::PilotSync))));
    }
}
