//! In-process job scheduler for sync work.
//!
//! Unique work: at most one active job per name. Enqueuing again while one
//! is waiting or running either keeps the existing job (the new trigger is
//! coalesced into it) or replaces it (the old job is cancelled at its next
//! record boundary, and the replacement starts only once the old one has
//! stopped). Jobs can require network connectivity; failed runs are retried
//! with exponential backoff.

use crate::sync::cancel::CancelFlag;
use crate::sync::progress::{ProgressReporter, SyncProgress};
use crate::sync::{Result, SyncError, SYNC_WORK_NAME};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// What to do when work with the same name is already active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistingWorkPolicy {
    Keep,
    Replace,
}

/// Conditions a job waits for before each attempt
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Constraints {
    pub network_required: bool,
}

impl Constraints {
    pub fn network() -> Self {
        Self {
            network_required: true,
        }
    }
}

/// Source of the network-available signal
pub trait Connectivity: Send + Sync {
    fn is_network_available(&self) -> bool;
}

/// Connectivity for hosts without a reachability signal
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl Connectivity for AlwaysOnline {
    fn is_network_available(&self) -> bool {
        true
    }
}

/// A unit of background work
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self, progress: &ProgressReporter, cancel: &CancelFlag) -> Result<()>;
}

/// Lifecycle of a scheduled job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Enqueued,
    /// Waiting for the network constraint
    Blocked,
    Running { attempt: u32 },
    Succeeded,
    Failed(String),
    Cancelled,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed(_) | JobState::Cancelled
        )
    }
}

/// Scheduler tuning
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Delay before the first retry; doubles on each further retry
    pub backoff_base: Duration,
    /// Attempts per job, the first run included
    pub max_attempts: u32,
    /// How often a blocked job re-checks connectivity
    pub connectivity_poll: Duration,
    /// Work whose activity blocks local record edits
    pub guarded_work: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(30),
            max_attempts: 5,
            connectivity_poll: Duration::from_secs(5),
            guarded_work: SYNC_WORK_NAME.to_string(),
        }
    }
}

impl SchedulerSettings {
    fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor)
    }
}

struct WorkEntry {
    id: u64,
    cancel: CancelFlag,
    state: watch::Receiver<JobState>,
    progress: ProgressReporter,
}

impl WorkEntry {
    fn handle(&self, name: &str) -> JobHandle {
        JobHandle {
            name: name.to_string(),
            id: self.id,
            state: self.state.clone(),
            progress: self.progress.subscribe(),
            cancel: self.cancel.clone(),
        }
    }

    fn is_active(&self) -> bool {
        !self.state.borrow().is_finished()
    }
}

/// Observer/controller of one scheduled job
#[derive(Debug, Clone)]
pub struct JobHandle {
    name: String,
    id: u64,
    state: watch::Receiver<JobState>,
    progress: watch::Receiver<SyncProgress>,
    cancel: CancelFlag,
}

impl JobHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Distinguishes a kept job from its replacement
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> JobState {
        self.state.borrow().clone()
    }

    pub fn progress(&self) -> watch::Receiver<SyncProgress> {
        self.progress.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait until the job reaches a final state
    pub async fn wait(&mut self) -> JobState {
        loop {
            let state = self.state.borrow_and_update().clone();
            if state.is_finished() {
                return state;
            }
            if self.state.changed().await.is_err() {
                return self.state.borrow().clone();
            }
        }
    }
}

/// Runs unique background jobs on the tokio runtime
pub struct SyncScheduler {
    connectivity: Arc<dyn Connectivity>,
    settings: SchedulerSettings,
    work: Mutex<HashMap<String, WorkEntry>>,
    next_id: AtomicU64,
}

impl SyncScheduler {
    pub fn new(connectivity: Arc<dyn Connectivity>, settings: SchedulerSettings) -> Self {
        Self {
            connectivity,
            settings,
            work: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Enqueue `job` as the only active work named `name`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue_unique(
        &self,
        name: &str,
        policy: ExistingWorkPolicy,
        constraints: Constraints,
        job: Arc<dyn Job>,
    ) -> Result<JobHandle> {
        let mut work = self
            .work
            .lock()
            .map_err(|_| SyncError::Scheduler("work table lock poisoned".to_string()))?;

        let mut predecessor = None;
        if let Some(existing) = work.get(name).filter(|entry| entry.is_active()) {
            match policy {
                ExistingWorkPolicy::Keep => {
                    info!(work = name, id = existing.id, "Work already active, trigger coalesced");
                    return Ok(existing.handle(name));
                }
                ExistingWorkPolicy::Replace => {
                    info!(work = name, id = existing.id, "Replacing active work");
                    existing.cancel.cancel();
                    predecessor = Some(existing.state.clone());
                }
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancelFlag::new();
        let (state_tx, state_rx) = watch::channel(JobState::Enqueued);
        let progress = ProgressReporter::detached();

        let entry = WorkEntry {
            id,
            cancel: cancel.clone(),
            state: state_rx,
            progress: progress.clone(),
        };
        let handle = entry.handle(name);
        work.insert(name.to_string(), entry);
        drop(work);

        info!(work = name, id, network_required = constraints.network_required, "Work enqueued");
        tokio::spawn(drive(
            name.to_string(),
            job,
            constraints,
            self.connectivity.clone(),
            self.settings.clone(),
            state_tx,
            progress,
            cancel,
            predecessor,
        ));
        Ok(handle)
    }

    /// Enqueue `job` under `name` with the keep policy every `interval`
    pub fn spawn_periodic(
        self: &Arc<Self>,
        name: &str,
        interval: Duration,
        constraints: Constraints,
        job: Arc<dyn Job>,
    ) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let name = name.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(e) =
                    scheduler.enqueue_unique(&name, ExistingWorkPolicy::Keep, constraints, job.clone())
                {
                    error!(work = %name, error = %e, "Periodic enqueue failed");
                }
            }
        })
    }

    /// Handle of the latest job enqueued under `name`
    pub fn handle(&self, name: &str) -> Option<JobHandle> {
        let work = self.work.lock().ok()?;
        work.get(name).map(|entry| entry.handle(name))
    }

    /// Whether work named `name` is enqueued, blocked or running
    pub fn is_active(&self, name: &str) -> bool {
        self.work
            .lock()
            .map(|work| work.get(name).map(WorkEntry::is_active).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Local record edits are allowed only while no sync is pending or running
    pub fn editing_allowed(&self) -> bool {
        !self.is_active(&self.settings.guarded_work)
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    name: String,
    job: Arc<dyn Job>,
    constraints: Constraints,
    connectivity: Arc<dyn Connectivity>,
    settings: SchedulerSettings,
    state: watch::Sender<JobState>,
    progress: ProgressReporter,
    cancel: CancelFlag,
    predecessor: Option<watch::Receiver<JobState>>,
) {
    // A replaced job may still be mid-record; never overlap with it
    if let Some(previous) = predecessor {
        debug!(work = %name, "Waiting for replaced work to stop");
        tokio::select! {
            _ = wait_finished(previous) => {}
            _ = cancel.cancelled() => {}
        }
    }

    let mut attempt = 0;
    loop {
        if constraints.network_required {
            while !connectivity.is_network_available() {
                if state.borrow().clone() != JobState::Blocked {
                    debug!(work = %name, "Waiting for network");
                    state.send_replace(JobState::Blocked);
                }
                tokio::select! {
                    _ = tokio::time::sleep(settings.connectivity_poll) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
        if cancel.is_cancelled() {
            info!(work = %name, "Work cancelled");
            state.send_replace(JobState::Cancelled);
            return;
        }

        attempt += 1;
        state.send_replace(JobState::Running { attempt });
        debug!(work = %name, attempt, "Work started");

        let err = match job.run(&progress, &cancel).await {
            Ok(()) if cancel.is_cancelled() => {
                info!(work = %name, attempt, "Work cancelled after its last record");
                state.send_replace(JobState::Cancelled);
                return;
            }
            Ok(()) => {
                info!(work = %name, attempt, "Work succeeded");
                state.send_replace(JobState::Succeeded);
                return;
            }
            Err(SyncError::Cancelled) => {
                info!(work = %name, "Work cancelled");
                state.send_replace(JobState::Cancelled);
                return;
            }
            Err(e) => e,
        };

        if !err.is_retryable() || attempt >= settings.max_attempts {
            error!(work = %name, attempt, error = %err, "Work failed");
            state.send_replace(JobState::Failed(err.to_string()));
            return;
        }

        let delay = settings.backoff(attempt);
        warn!(
            work = %name,
            attempt,
            error = %err,
            delay_secs = delay.as_secs(),
            "Work failed, retrying with backoff"
        );
        state.send_replace(JobState::Enqueued);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => {}
        }
    }
}

async fn wait_finished(mut state: watch::Receiver<JobState>) {
    while !state.borrow_and_update().is_finished() {
        if state.changed().await.is_err() {
            return;
        }
    }
}
