//! Persistent job request queue with a dual-cadence polling scheduler.
//!
//! ## Design
//!
//! - Jobs are stored rows; all concurrency control is a conditional update
//!   against the store (claim succeeds only if the row is still eligible)
//! - Handlers are looked up by `job_type` in an explicit registry
//! - Outcomes are tri-state: completed, waiting (retry later) or failed
//! - A hard timeout parks slow jobs as waiting without cancelling them
//! - Two polling loops: critical tier (fast) and everything else (slow)
//! - Running rows left behind by a crash are swept back to waiting at boot
//!
//! ## Components
//!
//! - `JobRequest`: the stored unit of work
//! - `JobRequestStore`: persistence (in-memory or Postgres)
//! - `HandlerRegistry` / `JobHandler`: execution contract
//! - `JobExecutor`: runs one claimed job and records its outcome
//! - `JobScheduler`: polling loops and immediate triggers

pub mod executor;
pub mod postgres;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod types;

pub use executor::{ExecuteError, ExecutionOutcome, ExecutionReport, ExecutorConfig, JobExecutor, resolve_next_run};
pub use postgres::PostgresJobRequestStore;
pub use registry::{FnHandler, HandlerRegistry, JobContext, JobHandler};
pub use scheduler::{
    DispatchRequest, JobDispatcher, JobScheduler, PollLoop, SchedulerConfig, SchedulerError,
    SchedulerHandle, SchedulerStatus,
};
pub use store::{InMemoryJobRequestStore, JobRequestStore, JobStats, JobStoreError};
pub use types::{
    JobFilter, JobOutcome, JobRequest, JobRequestPage, NewJobRequest, Pagination, Requester,
    SortOrder, parse_resume_at,
};
