//! Handler registry: maps job types to the code that runs them.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::types::{JobOutcome, JobRequest};

/// A unit of work bound to one job type.
///
/// Returning `Err` (or panicking) marks the job failed; the error chain is
/// stored as the job's `error_message`.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, payload: Value, ctx: JobContext) -> anyhow::Result<JobOutcome>;
}

/// Per-invocation context handed to a handler.
#[derive(Debug, Clone)]
pub struct JobContext {
    job: JobRequest,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(job: JobRequest, cancel: CancellationToken) -> Self {
        Self { job, cancel }
    }

    /// Snapshot of the claimed job (status `running`, attempts already bumped).
    pub fn job(&self) -> &JobRequest {
        &self.job
    }

    /// Cooperative cancellation signal. Only fires on scheduler shutdown when
    /// handler cancellation is enabled; handlers are free to ignore it.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Deserialize the job payload into a handler-specific type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_value(self.job.payload.clone()).with_context(|| {
            format!("invalid payload for job type '{}'", self.job.job_type)
        })
    }
}

/// Adapter that turns an async closure into a [`JobHandler`].
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Value, JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<JobOutcome>> + Send + 'static,
{
    async fn run(&self, payload: Value, ctx: JobContext) -> anyhow::Result<JobOutcome> {
        (self.f)(payload, ctx).await
    }
}

/// Explicit map of job type to handler.
///
/// Built once at startup and shared read-only (behind an `Arc`) by the
/// executor and the scheduler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a job type, replacing any previous one.
    pub fn register(&mut self, job_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> &mut Self {
        self.handlers.insert(job_type.into(), handler);
        self
    }

    /// Register an async closure as the handler for a job type.
    pub fn register_fn<F, Fut>(&mut self, job_type: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Value, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<JobOutcome>> + Send + 'static,
    {
        self.register(job_type, Arc::new(FnHandler::new(f)))
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::NewJobRequest;
    use chrono::Utc;
    use serde::Deserialize;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl JobHandler for Echo {
        async fn run(&self, payload: Value, _ctx: JobContext) -> anyhow::Result<JobOutcome> {
            Ok(JobOutcome::completed_with(payload))
        }
    }

    fn context(payload: Value) -> JobContext {
        let job = JobRequest::from_new(NewJobRequest::new("ga.sync", payload), Utc::now());
        JobContext::new(job, CancellationToken::new())
    }

    #[tokio::test]
    async fn registers_and_resolves_handlers() {
        let mut registry = HandlerRegistry::new();
        registry
            .register("echo", Arc::new(Echo))
            .register_fn("noop", |_payload, _ctx| async { Ok::<_, anyhow::Error>(JobOutcome::completed()) });

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.job_types(), vec!["echo".to_string(), "noop".to_string()]);
        assert!(registry.contains("noop"));
        assert!(registry.get("missing").is_none());

        let handler = registry.get("echo").unwrap();
        let outcome = handler.run(json!({"n": 1}), context(json!({}))).await.unwrap();
        assert_eq!(outcome, JobOutcome::completed_with(json!({"n": 1})));
    }

    #[tokio::test]
    async fn closure_errors_propagate() {
        let mut registry = HandlerRegistry::new();
        registry.register_fn("boom", |_payload, _ctx| async {
            Err::<JobOutcome, _>(anyhow::anyhow!("boom"))
        });

        let err = registry
            .get("boom")
            .unwrap()
            .run(json!({}), context(json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn typed_payload_access() {
        #[derive(Debug, Deserialize)]
        struct SyncPayload {
            clinic_id: u64,
        }

        let ctx = context(json!({"clinic_id": 7}));
        let payload: SyncPayload = ctx.payload_as().unwrap();
        assert_eq!(payload.clinic_id, 7);

        let err = context(json!({"clinic": "x"})).payload_as::<SyncPayload>().unwrap_err();
        assert!(format!("{err:#}").contains("invalid payload for job type 'ga.sync'"));
        assert!(!ctx.is_cancelled());
    }
}
