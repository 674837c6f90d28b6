//! Job executor: runs one claimed job under a timeout and persists the outcome.

use std::any::Any;
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use clinicflow_core::JobRequestId;

use super::registry::{HandlerRegistry, JobContext, JobHandler};
use super::store::{JobRequestStore, JobStoreError};
use super::types::{JobOutcome, JobRequest};

/// Job executor configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Wall-clock budget for a single handler invocation
    pub job_timeout: Duration,
    /// Delay applied when a handler asks to wait without saying how long
    pub waiting_backoff: Duration,
    /// Delay applied after a timeout
    pub timeout_backoff: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(5 * 60),
            waiting_backoff: Duration::from_secs(5 * 60),
            timeout_backoff: Duration::from_secs(60),
        }
    }
}

impl ExecutorConfig {
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_waiting_backoff(mut self, backoff: Duration) -> Self {
        self.waiting_backoff = backoff;
        self
    }

    pub fn with_timeout_backoff(mut self, backoff: Duration) -> Self {
        self.timeout_backoff = backoff;
        self
    }
}

/// Execution error.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("no handler registered for job type '{0}'")]
    UnknownJobType(String),
    #[error(transparent)]
    Store(#[from] JobStoreError),
    #[error("dispatch failed: {0}")]
    Dispatch(String),
}

/// How one execution was classified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Completed,
    Waiting { next_run_at: DateTime<Utc> },
    Failed { error: String },
    TimedOut { next_run_at: DateTime<Utc> },
}

/// Result of running one claimed job.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub job_id: JobRequestId,
    pub job_type: String,
    pub outcome: ExecutionOutcome,
    /// False when the outcome write found the job no longer `running`
    /// (an operator touched it meanwhile) and nothing was stored.
    pub persisted: bool,
    #[serde(with = "duration_millis")]
    pub elapsed: Duration,
}

mod duration_millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().min(u128::from(u64::MAX)) as u64)
    }
}

/// Pick the next eligibility time for a job that asked to wait.
///
/// An explicit time wins, then a relative backoff, then `default_backoff`.
pub fn resolve_next_run(
    next_run_at: Option<DateTime<Utc>>,
    backoff: Option<Duration>,
    default_backoff: Duration,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    match (next_run_at, backoff) {
        (Some(at), _) => at,
        (None, Some(backoff)) => after(now, backoff),
        (None, None) => after(now, default_backoff),
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or_else(|| now + chrono::Duration::days(365))
}

/// Decrements the in-flight counter when the handler task finishes.
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

enum HandlerResult {
    Finished(anyhow::Result<JobOutcome>),
    Panicked(String),
    TimedOut,
}

/// Runs claimed jobs through their registered handler.
///
/// Each handler runs on its own tokio task, raced against `job_timeout`. On
/// timeout the task is detached, not aborted: it keeps running and whatever
/// it returns is discarded.
pub struct JobExecutor<S> {
    store: S,
    registry: Arc<HandlerRegistry>,
    config: ExecutorConfig,
    in_flight: Arc<AtomicUsize>,
    handler_cancel: Arc<Mutex<CancellationToken>>,
}

impl<S: Clone> Clone for JobExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
            in_flight: self.in_flight.clone(),
            handler_cancel: self.handler_cancel.clone(),
        }
    }
}

impl<S: JobRequestStore> JobExecutor<S> {
    pub fn new(store: S, registry: Arc<HandlerRegistry>, config: ExecutorConfig) -> Self {
        Self {
            store,
            registry,
            config,
            in_flight: Arc::new(AtomicUsize::new(0)),
            handler_cancel: Arc::new(Mutex::new(CancellationToken::new())),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Handler tasks currently running, including detached timed-out ones.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Parent of every handler context's cancellation token.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.handler_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace a cancelled parent token with a fresh one, so handlers started
    /// after a restart are not born cancelled. Returns the current parent.
    pub fn renew_cancellation_token(&self) -> CancellationToken {
        let mut token = self
            .handler_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
        token.clone()
    }

    /// Execute a job the caller has already claimed (status `running`).
    pub async fn execute(&self, job: JobRequest) -> Result<ExecutionReport, ExecuteError> {
        let started = Instant::now();
        let job_id = job.id;
        let job_type = job.job_type.clone();

        let Some(handler) = self.registry.get(&job.job_type) else {
            let error = ExecuteError::UnknownJobType(job.job_type.clone()).to_string();
            warn!(job_id = %job_id, job_type = %job_type, "no handler for job type");
            let persisted = self
                .store
                .mark_failed(job_id, error.clone(), None, None)
                .await?
                .is_some();
            return Ok(ExecutionReport {
                job_id,
                job_type,
                outcome: ExecutionOutcome::Failed { error },
                persisted,
                elapsed: started.elapsed(),
            });
        };

        debug!(
            job_id = %job_id,
            job_type = %job_type,
            priority = %job.priority,
            attempts = job.attempts,
            "running job"
        );

        let result = self.run_handler(handler, job).await;
        let now = Utc::now();

        let (outcome, persisted) = match result {
            HandlerResult::Finished(Ok(JobOutcome::Completed {
                result,
                sync_log_id,
            })) => {
                let stored = self
                    .store
                    .mark_completed(job_id, sync_log_id, result)
                    .await?;
                (ExecutionOutcome::Completed, stored.is_some())
            }
            HandlerResult::Finished(Ok(JobOutcome::Waiting {
                next_run_at,
                backoff,
                result,
                reason,
            })) => {
                let next_run_at =
                    resolve_next_run(next_run_at, backoff, self.config.waiting_backoff, now);
                let stored = self
                    .store
                    .mark_waiting(job_id, next_run_at, reason, result)
                    .await?;
                (ExecutionOutcome::Waiting { next_run_at }, stored.is_some())
            }
            HandlerResult::Finished(Err(err)) => {
                let error = format!("{err:#}");
                let stored = self
                    .store
                    .mark_failed(job_id, error.clone(), None, None)
                    .await?;
                (ExecutionOutcome::Failed { error }, stored.is_some())
            }
            HandlerResult::Panicked(message) => {
                let error = format!("handler panicked: {message}");
                let stored = self
                    .store
                    .mark_failed(job_id, error.clone(), None, None)
                    .await?;
                (ExecutionOutcome::Failed { error }, stored.is_some())
            }
            HandlerResult::TimedOut => {
                let next_run_at = after(now, self.config.timeout_backoff);
                let error = format!(
                    "job timed out after {}ms",
                    self.config.job_timeout.as_millis()
                );
                let stored = self
                    .store
                    .mark_waiting(job_id, next_run_at, Some(error), None)
                    .await?;
                (ExecutionOutcome::TimedOut { next_run_at }, stored.is_some())
            }
        };

        let elapsed = started.elapsed();
        match &outcome {
            ExecutionOutcome::Completed => {
                info!(job_id = %job_id, job_type = %job_type, elapsed_ms = elapsed.as_millis() as u64, "job completed");
            }
            ExecutionOutcome::Waiting { next_run_at } => {
                info!(job_id = %job_id, job_type = %job_type, next_run_at = %next_run_at, "job waiting");
            }
            ExecutionOutcome::Failed { error } => {
                warn!(job_id = %job_id, job_type = %job_type, error = %error, "job failed");
            }
            ExecutionOutcome::TimedOut { next_run_at } => {
                warn!(job_id = %job_id, job_type = %job_type, next_run_at = %next_run_at, "job timed out");
            }
        }
        if !persisted {
            warn!(job_id = %job_id, "job left running state before its outcome was stored; outcome dropped");
        }

        Ok(ExecutionReport {
            job_id,
            job_type,
            outcome,
            persisted,
            elapsed,
        })
    }

    async fn run_handler(
        &self,
        handler: Arc<dyn JobHandler>,
        job: JobRequest,
    ) -> HandlerResult {
        let guard = InFlightGuard::acquire(&self.in_flight);
        let payload = job.payload.clone();
        let ctx = JobContext::new(job, self.cancellation_token().child_token());

        let task = tokio::spawn(async move {
            let _guard = guard;
            handler.run(payload, ctx).await
        });

        match tokio::time::timeout(self.config.job_timeout, task).await {
            Ok(Ok(result)) => HandlerResult::Finished(result),
            Ok(Err(join_err)) if join_err.is_panic() => {
                HandlerResult::Panicked(panic_message(join_err.into_panic()))
            }
            Ok(Err(join_err)) => HandlerResult::Finished(Err(anyhow::Error::new(join_err))),
            Err(_elapsed) => HandlerResult::TimedOut,
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobRequestStore;
    use crate::jobs::types::NewJobRequest;
    use clinicflow_core::JobStatus;
    use serde_json::json;

    fn executor(
        store: Arc<InMemoryJobRequestStore>,
        registry: HandlerRegistry,
    ) -> JobExecutor<Arc<InMemoryJobRequestStore>> {
        JobExecutor::new(store, Arc::new(registry), ExecutorConfig::default())
    }

    async fn enqueue_and_claim(store: &InMemoryJobRequestStore, job_type: &str) -> JobRequest {
        let job = store.enqueue(NewJobRequest::new(job_type, json!({}))).await.unwrap();
        store.claim_by_id(job.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn completed_outcome_is_stored() {
        let store = InMemoryJobRequestStore::arc();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("meta_ads.sync", |_payload, _ctx| async {
            Ok::<_, anyhow::Error>(JobOutcome::completed_with(json!({"ok": true})))
        });
        let executor = executor(store.clone(), registry);

        let job = enqueue_and_claim(&store, "meta_ads.sync").await;
        let report = executor.execute(job.clone()).await.unwrap();
        assert_eq!(report.outcome, ExecutionOutcome::Completed);
        assert!(report.persisted);

        let stored = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.result_summary, Some(json!({"ok": true})));
        assert!(stored.completed_at.is_some());
        assert_eq!(stored.attempts, 1);
        assert_eq!(executor.in_flight(), 0);
    }

    #[tokio::test]
    async fn handler_error_marks_failed() {
        let store = InMemoryJobRequestStore::arc();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("ga.sync", |_payload, _ctx| async {
            Err::<JobOutcome, _>(anyhow::anyhow!("boom"))
        });
        let executor = executor(store.clone(), registry);

        let job = enqueue_and_claim(&store, "ga.sync").await;
        let report = executor.execute(job.clone()).await.unwrap();
        assert_eq!(
            report.outcome,
            ExecutionOutcome::Failed {
                error: "boom".into()
            }
        );

        let stored = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("boom"));
        assert_eq!(stored.attempts, 1);
        assert!(store.claim_next(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn explicit_resume_time_is_kept() {
        let store = InMemoryJobRequestStore::arc();
        let resume_at = Utc::now() + chrono::Duration::seconds(60);
        let mut registry = HandlerRegistry::new();
        registry.register_fn("gsc.sync", move |_payload, _ctx| async move {
            Ok::<_, anyhow::Error>(JobOutcome::waiting_until(resume_at).with_reason("rate limited"))
        });
        let executor = executor(store.clone(), registry);

        let job = enqueue_and_claim(&store, "gsc.sync").await;
        let report = executor.execute(job.clone()).await.unwrap();
        assert_eq!(
            report.outcome,
            ExecutionOutcome::Waiting {
                next_run_at: resume_at
            }
        );

        let stored = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Waiting);
        assert_eq!(stored.next_run_at, Some(resume_at));
        assert_eq!(stored.error_message.as_deref(), Some("rate limited"));
        assert!(store.claim_next(None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn relative_and_default_backoff() {
        let store = InMemoryJobRequestStore::arc();
        let mut registry = HandlerRegistry::new();
        registry
            .register_fn("relative", |_payload, _ctx| async {
                Ok::<_, anyhow::Error>(JobOutcome::waiting_for(Duration::from_secs(30)))
            })
            .register_fn("default", |_payload, _ctx| async {
                Ok::<_, anyhow::Error>(JobOutcome::waiting())
            });
        let executor = executor(store.clone(), registry);

        let before = Utc::now();
        let job = enqueue_and_claim(&store, "relative").await;
        executor.execute(job.clone()).await.unwrap();
        let next = store.find_by_id(job.id).await.unwrap().unwrap().next_run_at.unwrap();
        assert!(next >= before + chrono::Duration::seconds(30));
        assert!(next <= Utc::now() + chrono::Duration::seconds(30));

        let job = enqueue_and_claim(&store, "default").await;
        executor.execute(job.clone()).await.unwrap();
        let next = store.find_by_id(job.id).await.unwrap().unwrap().next_run_at.unwrap();
        assert!(next >= before + chrono::Duration::minutes(5));
    }

    #[tokio::test]
    async fn timeout_moves_job_to_waiting() {
        let store = InMemoryJobRequestStore::arc();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("slow", |_payload, _ctx| async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok::<_, anyhow::Error>(JobOutcome::completed())
        });
        let config = ExecutorConfig::default()
            .with_job_timeout(Duration::from_millis(20))
            .with_timeout_backoff(Duration::from_secs(60));
        let executor = JobExecutor::new(store.clone(), Arc::new(registry), config);

        let job = enqueue_and_claim(&store, "slow").await;
        let report = executor.execute(job.clone()).await.unwrap();
        assert!(matches!(report.outcome, ExecutionOutcome::TimedOut { .. }));
        assert_eq!(executor.in_flight(), 1);

        let stored = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Waiting);
        assert!(stored.next_run_at.unwrap() > Utc::now());

        // The detached handler finishes later; its result is discarded.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(executor.in_flight(), 0);
        let stored = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Waiting);
    }

    #[tokio::test]
    async fn unknown_job_type_fails_job() {
        let store = InMemoryJobRequestStore::arc();
        let executor = executor(store.clone(), HandlerRegistry::new());

        let job = enqueue_and_claim(&store, "mystery").await;
        let report = executor.execute(job.clone()).await.unwrap();
        assert!(matches!(report.outcome, ExecutionOutcome::Failed { .. }));

        let stored = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(
            stored.error_message.as_deref(),
            Some("no handler registered for job type 'mystery'")
        );
    }

    #[tokio::test]
    async fn panic_is_recorded_as_failure() {
        let store = InMemoryJobRequestStore::arc();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("explode", |_payload, _ctx| async {
            if true {
                panic!("kaboom");
            }
            Ok::<_, anyhow::Error>(JobOutcome::completed())
        });
        let executor = executor(store.clone(), registry);

        let job = enqueue_and_claim(&store, "explode").await;
        executor.execute(job.clone()).await.unwrap();

        let stored = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("handler panicked: kaboom"));
        assert_eq!(executor.in_flight(), 0);
    }

    #[tokio::test]
    async fn operator_change_wins_over_late_outcome() {
        let store = InMemoryJobRequestStore::arc();
        let job = enqueue_and_claim(&store, "noop").await;

        let mut registry = HandlerRegistry::new();
        let requeue_store = store.clone();
        registry.register_fn("noop", move |_payload, ctx| {
            let store = requeue_store.clone();
            async move {
                store.set_pending(ctx.job().id, None, None).await?;
                Ok::<_, anyhow::Error>(JobOutcome::completed())
            }
        });
        let executor = executor(store.clone(), registry);

        let report = executor.execute(job.clone()).await.unwrap();
        assert!(!report.persisted);
        let stored = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
    }

    #[test]
    fn resolve_next_run_precedence() {
        let now = Utc::now();
        let at = now + chrono::Duration::seconds(5);
        let default = Duration::from_secs(300);

        assert_eq!(resolve_next_run(Some(at), Some(Duration::from_secs(9)), default, now), at);
        assert_eq!(
            resolve_next_run(None, Some(Duration::from_secs(9)), default, now),
            now + chrono::Duration::seconds(9)
        );
        assert_eq!(
            resolve_next_run(None, None, default, now),
            now + chrono::Duration::seconds(300)
        );
    }
}
