//! Dual-cadence polling scheduler.
//!
//! Two loops poll the store independently: a fast one for the `critical` tier
//! and a slow one for everything else. Each tick drains its tiers one job at a
//! time until nothing eligible is left. A tick that fires while the previous
//! drain of the same loop is still running is skipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use clinicflow_core::{JobPriority, JobRequestId};

use super::executor::{ExecuteError, ExecutionOutcome, ExecutorConfig, JobExecutor};
use super::registry::HandlerRegistry;
use super::store::{JobRequestStore, JobStoreError};

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Poll interval of the critical loop
    pub critical_interval: Duration,
    /// Poll interval of the standard loop
    pub standard_interval: Duration,
    pub executor: ExecutorConfig,
    /// Fire the handlers' cancellation token on shutdown
    pub cancel_handlers_on_shutdown: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            critical_interval: Duration::from_secs(5),
            standard_interval: Duration::from_secs(30),
            executor: ExecutorConfig::default(),
            cancel_handlers_on_shutdown: false,
        }
    }
}

impl SchedulerConfig {
    pub fn with_critical_interval(mut self, interval: Duration) -> Self {
        self.critical_interval = interval;
        self
    }

    pub fn with_standard_interval(mut self, interval: Duration) -> Self {
        self.standard_interval = interval;
        self
    }

    pub fn with_executor(mut self, executor: ExecutorConfig) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_cancel_handlers_on_shutdown(mut self, enabled: bool) -> Self {
        self.cancel_handlers_on_shutdown = enabled;
        self
    }
}

/// One of the two polling loops.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollLoop {
    Critical,
    Standard,
}

impl PollLoop {
    /// Priority tiers this loop drains.
    pub fn tiers(self) -> &'static [JobPriority] {
        match self {
            PollLoop::Critical => &JobPriority::CRITICAL_TIER,
            PollLoop::Standard => &JobPriority::STANDARD_TIER,
        }
    }

    pub fn interval(self, config: &SchedulerConfig) -> Duration {
        match self {
            PollLoop::Critical => config.critical_interval,
            PollLoop::Standard => config.standard_interval,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PollLoop::Critical => "critical",
            PollLoop::Standard => "standard",
        }
    }

    fn tick_request(self) -> DispatchRequest {
        match self {
            PollLoop::Critical => DispatchRequest::CriticalTick,
            PollLoop::Standard => DispatchRequest::StandardTick,
        }
    }
}

/// Work handed to an external dispatcher instead of running in-process.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DispatchRequest {
    CriticalTick,
    StandardTick,
    /// Run one specific job now.
    Immediate(JobRequestId),
}

/// Hook that replaces the built-in drain and trigger logic, e.g. to forward
/// work to a separate worker process.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    async fn dispatch(&self, request: DispatchRequest) -> anyhow::Result<()>;
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub last_critical_tick: Option<DateTime<Utc>>,
    pub last_standard_tick: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub in_flight: usize,
    pub critical_draining: bool,
    pub standard_draining: bool,
    pub external_dispatch: bool,
    pub job_types: Vec<String>,
}

/// Scheduler error.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler is already running")]
    AlreadyRunning,
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

#[derive(Debug, Default)]
struct TickState {
    last_critical_tick: Option<DateTime<Utc>>,
    last_standard_tick: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

struct Inner<S> {
    executor: JobExecutor<S>,
    config: SchedulerConfig,
    dispatcher: RwLock<Option<Arc<dyn JobDispatcher>>>,
    running: Arc<AtomicBool>,
    critical_draining: AtomicBool,
    standard_draining: AtomicBool,
    stop: Mutex<CancellationToken>,
    state: Mutex<TickState>,
}

/// Resets a loop's draining flag when the drain ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl<'a> DrainGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Polling scheduler over a job request store.
///
/// Cheap to clone; clones share loops, guards and status.
pub struct JobScheduler<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for JobScheduler<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: JobRequestStore + Clone + 'static> JobScheduler<S> {
    pub fn new(store: S, registry: Arc<HandlerRegistry>, config: SchedulerConfig) -> Self {
        let executor = JobExecutor::new(store, registry, config.executor.clone());
        Self {
            inner: Arc::new(Inner {
                executor,
                config,
                dispatcher: RwLock::new(None),
                running: Arc::new(AtomicBool::new(false)),
                critical_draining: AtomicBool::new(false),
                standard_draining: AtomicBool::new(false),
                stop: Mutex::new(CancellationToken::new()),
                state: Mutex::new(TickState::default()),
            }),
        }
    }

    /// Route ticks and triggers to `dispatcher` instead of running them here.
    pub fn with_dispatcher(self, dispatcher: Arc<dyn JobDispatcher>) -> Self {
        *self
            .inner
            .dispatcher
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(dispatcher);
        self
    }

    pub fn store(&self) -> &S {
        self.inner.executor.store()
    }

    pub fn executor(&self) -> &JobExecutor<S> {
        &self.inner.executor
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    fn dispatcher(&self) -> Option<Arc<dyn JobDispatcher>> {
        self.inner
            .dispatcher
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Recover orphaned `running` jobs, then spawn both polling loops.
    ///
    /// Each loop ticks immediately on start.
    pub async fn start(&self) -> Result<SchedulerHandle, SchedulerError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        match self.store().reset_orphaned_running().await {
            Ok(0) => {}
            Ok(recovered) => {
                warn!(recovered, "rescheduled jobs left running by a previous process");
            }
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        }

        let stop = CancellationToken::new();
        *lock(&self.inner.stop) = stop.clone();
        let handler_cancel = self.inner.executor.renew_cancellation_token();

        let tasks = [PollLoop::Critical, PollLoop::Standard]
            .into_iter()
            .map(|poll_loop| {
                let scheduler = self.clone();
                let stop = stop.clone();
                tokio::spawn(async move { scheduler.run_loop(poll_loop, stop).await })
            })
            .collect();

        info!(
            critical_interval_ms = self.inner.config.critical_interval.as_millis() as u64,
            standard_interval_ms = self.inner.config.standard_interval.as_millis() as u64,
            external_dispatch = self.dispatcher().is_some(),
            "job scheduler started"
        );

        Ok(SchedulerHandle {
            stop,
            tasks,
            running: self.inner.running.clone(),
            handler_cancel: self
                .inner
                .config
                .cancel_handlers_on_shutdown
                .then_some(handler_cancel),
        })
    }

    async fn run_loop(&self, poll_loop: PollLoop, stop: CancellationToken) {
        let mut interval = tokio::time::interval(poll_loop.interval(&self.inner.config));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = interval.tick() => {
                    let scheduler = self.clone();
                    tokio::spawn(async move { scheduler.on_tick(poll_loop).await });
                }
            }
        }

        debug!(poll_loop = poll_loop.as_str(), "poll loop stopped");
    }

    async fn on_tick(&self, poll_loop: PollLoop) {
        match self.dispatcher() {
            Some(dispatcher) => {
                self.record_tick(poll_loop);
                if let Err(e) = dispatcher.dispatch(poll_loop.tick_request()).await {
                    error!(poll_loop = poll_loop.as_str(), error = %format!("{e:#}"), "dispatch failed");
                    self.record_error(format!("dispatch failed: {e:#}"));
                }
            }
            None => {
                self.tick(poll_loop).await;
            }
        }
    }

    /// Run one drain of `poll_loop`'s tiers in the caller's task.
    ///
    /// Returns the number of jobs executed, or `None` if a drain of the same
    /// loop was already in progress.
    pub async fn tick(&self, poll_loop: PollLoop) -> Option<usize> {
        let flag = match poll_loop {
            PollLoop::Critical => &self.inner.critical_draining,
            PollLoop::Standard => &self.inner.standard_draining,
        };
        let Some(_guard) = DrainGuard::try_acquire(flag) else {
            debug!(poll_loop = poll_loop.as_str(), "previous drain still running; tick skipped");
            return None;
        };

        self.record_tick(poll_loop);
        let stop = lock(&self.inner.stop).clone();
        let mut executed = 0;
        // Jobs this drain parked as waiting; they are left for a later tick
        // even if their resume time has already passed.
        let mut parked: Vec<JobRequestId> = Vec::new();

        while !stop.is_cancelled() {
            let claimed = self
                .store()
                .claim_next_excluding(Some(poll_loop.tiers()), &parked)
                .await;
            let job = match claimed {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(e) => {
                    error!(poll_loop = poll_loop.as_str(), error = %e, "failed to claim job");
                    self.record_error(e.to_string());
                    break;
                }
            };

            debug!(poll_loop = poll_loop.as_str(), job_id = %job.id, job_type = %job.job_type, "claimed job");
            executed += 1;

            match self.inner.executor.execute(job).await {
                Ok(report) => {
                    if matches!(report.outcome, ExecutionOutcome::Waiting { .. } | ExecutionOutcome::TimedOut { .. }) {
                        parked.push(report.job_id);
                    }
                }
                Err(e) => {
                    error!(poll_loop = poll_loop.as_str(), error = %e, "failed to record job outcome");
                    self.record_error(e.to_string());
                    break;
                }
            }
        }

        if executed > 0 {
            debug!(poll_loop = poll_loop.as_str(), executed, "drain finished");
        }
        Some(executed)
    }

    /// Run one job now, outside the polling cadence.
    ///
    /// Returns `Ok(false)` if the job exists but is not currently eligible
    /// (someone else claimed it, or it is waiting/terminal).
    pub async fn trigger(&self, id: JobRequestId) -> Result<bool, ExecuteError> {
        if let Some(dispatcher) = self.dispatcher() {
            dispatcher
                .dispatch(DispatchRequest::Immediate(id))
                .await
                .map_err(|e| ExecuteError::Dispatch(format!("{e:#}")))?;
            return Ok(true);
        }

        let job = self
            .store()
            .find_by_id(id)
            .await?
            .ok_or(JobStoreError::NotFound(id))?;
        if !self.inner.executor.registry().contains(&job.job_type) {
            return Err(ExecuteError::UnknownJobType(job.job_type));
        }

        let Some(claimed) = self.store().claim_by_id(id).await? else {
            debug!(job_id = %id, status = %job.status, "trigger skipped; job not eligible");
            return Ok(false);
        };

        info!(job_id = %id, job_type = %claimed.job_type, "job triggered");
        self.inner.executor.execute(claimed).await?;
        Ok(true)
    }

    pub fn status(&self) -> SchedulerStatus {
        let state = lock(&self.inner.state);
        SchedulerStatus {
            running: self.inner.running.load(Ordering::SeqCst),
            last_critical_tick: state.last_critical_tick,
            last_standard_tick: state.last_standard_tick,
            last_error: state.last_error.clone(),
            in_flight: self.inner.executor.in_flight(),
            critical_draining: self.inner.critical_draining.load(Ordering::SeqCst),
            standard_draining: self.inner.standard_draining.load(Ordering::SeqCst),
            external_dispatch: self.dispatcher().is_some(),
            job_types: self.inner.executor.registry().job_types(),
        }
    }

    fn record_tick(&self, poll_loop: PollLoop) {
        let mut state = lock(&self.inner.state);
        let now = Some(Utc::now());
        match poll_loop {
            PollLoop::Critical => state.last_critical_tick = now,
            PollLoop::Standard => state.last_standard_tick = now,
        }
    }

    fn record_error(&self, message: String) {
        lock(&self.inner.state).last_error = Some(message);
    }
}

/// Handle to stop a running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    stop: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    handler_cancel: Option<CancellationToken>,
}

impl SchedulerHandle {
    /// Stop both loops. A drain in progress finishes its current job and
    /// claims nothing more; handler tasks are left to run to completion.
    pub async fn shutdown(self) {
        self.stop.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        if let Some(token) = self.handler_cancel {
            token.cancel();
        }
        self.running.store(false, Ordering::SeqCst);
        info!("job scheduler stopped");
    }
}
