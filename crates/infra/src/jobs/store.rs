//! Job request storage: the store abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use clinicflow_core::{JobPriority, JobRequestId, JobStatus};

use super::types::{JobFilter, JobRequest, JobRequestPage, NewJobRequest, Pagination, SortOrder};

/// Diagnostic stored on rows recovered by the boot-time sweep.
pub const ORPHANED_RUNNING_MESSAGE: &str =
    "job was still running when the process stopped; rescheduled by startup recovery";

/// Job request store abstraction.
///
/// Every mutating operation is either an insert or a conditional update guarded
/// by the row's current status, so concurrent callers can never both win.
///
/// The `mark_*` outcome writes only apply to a `running` job. They return
/// `Ok(None)` when the guard misses (the row moved on in the meantime) and
/// `Err(NotFound)` when the id does not exist.
#[async_trait]
pub trait JobRequestStore: Send + Sync {
    /// Insert a new job request.
    async fn enqueue(&self, new: NewJobRequest) -> Result<JobRequest, JobStoreError>;

    /// Get a job request by ID.
    async fn find_by_id(&self, id: JobRequestId) -> Result<Option<JobRequest>, JobStoreError>;

    /// Atomically claim the best eligible job, optionally restricted to some
    /// priority tiers. Returns `None` if nothing is eligible.
    async fn claim_next(
        &self,
        priorities: Option<&[JobPriority]>,
    ) -> Result<Option<JobRequest>, JobStoreError> {
        self.claim_next_excluding(priorities, &[]).await
    }

    /// Like [`claim_next`](Self::claim_next), but never picks a job in `exclude`.
    async fn claim_next_excluding(
        &self,
        priorities: Option<&[JobPriority]>,
        exclude: &[JobRequestId],
    ) -> Result<Option<JobRequest>, JobStoreError>;

    /// Atomically claim one specific job. Returns `None` if it is not eligible.
    async fn claim_by_id(&self, id: JobRequestId) -> Result<Option<JobRequest>, JobStoreError>;

    /// Park a running job until `next_run_at`.
    async fn mark_waiting(
        &self,
        id: JobRequestId,
        next_run_at: DateTime<Utc>,
        error_message: Option<String>,
        result_summary: Option<Value>,
    ) -> Result<Option<JobRequest>, JobStoreError>;

    /// Record terminal success.
    async fn mark_completed(
        &self,
        id: JobRequestId,
        sync_log_id: Option<String>,
        result_summary: Option<Value>,
    ) -> Result<Option<JobRequest>, JobStoreError>;

    /// Record a failure. No retry is scheduled automatically.
    async fn mark_failed(
        &self,
        id: JobRequestId,
        error_message: String,
        next_run_at: Option<DateTime<Utc>>,
        result_summary: Option<Value>,
    ) -> Result<Option<JobRequest>, JobStoreError>;

    /// Operator cancellation; only allowed from `pending` or `waiting`.
    async fn mark_cancelled(&self, id: JobRequestId) -> Result<JobRequest, JobStoreError>;

    /// Operator requeue from any status, optionally bumping priority.
    async fn set_pending(
        &self,
        id: JobRequestId,
        next_run_at: Option<DateTime<Utc>>,
        priority: Option<JobPriority>,
    ) -> Result<JobRequest, JobStoreError>;

    /// Move every `running` job to `waiting` (eligible now). Run once at boot.
    async fn reset_orphaned_running(&self) -> Result<u64, JobStoreError>;

    /// List job requests with filters and pagination.
    async fn list(
        &self,
        filter: JobFilter,
        pagination: Pagination,
        order: SortOrder,
    ) -> Result<JobRequestPage, JobStoreError>;

    /// Count job requests per status.
    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job request not found: {0}")]
    NotFound(JobRequestId),
    #[error("job request {id} cannot go from {from} to {to}")]
    InvalidTransition {
        id: JobRequestId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub waiting: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl JobStats {
    pub fn record(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Waiting => self.waiting += count,
            JobStatus::Running => self.running += count,
            JobStatus::Completed => self.completed += count,
            JobStatus::Failed => self.failed += count,
            JobStatus::Cancelled => self.cancelled += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.waiting + self.running + self.completed + self.failed + self.cancelled
    }
}

/// In-memory job store for tests/dev.
///
/// A single mutex around the map makes every select-then-update atomic, which
/// gives the same single-claimant guarantee as row locking.
#[derive(Debug, Default)]
pub struct InMemoryJobRequestStore {
    jobs: Mutex<HashMap<JobRequestId, JobRequest>>,
}

impl InMemoryJobRequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Overwrite a stored record as-is. Test hook for simulating crashes and
    /// clock skew; never used on the claim path.
    pub fn put(&self, job: JobRequest) -> Result<(), JobStoreError> {
        self.lock()?.insert(job.id, job);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<JobRequestId, JobRequest>>, JobStoreError> {
        self.jobs
            .lock()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    /// Apply `update` to a running job; `Ok(None)` if it is no longer running.
    fn update_running(
        &self,
        id: JobRequestId,
        update: impl FnOnce(&mut JobRequest, DateTime<Utc>),
    ) -> Result<Option<JobRequest>, JobStoreError> {
        let mut jobs = self.lock()?;
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        if job.status != JobStatus::Running {
            return Ok(None);
        }
        let now = Utc::now();
        update(job, now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }
}

fn claim(job: &mut JobRequest, now: DateTime<Utc>) -> JobRequest {
    job.status = JobStatus::Running;
    job.attempts += 1;
    job.last_attempt_at = Some(now);
    job.updated_at = now;
    job.clone()
}

#[async_trait]
impl JobRequestStore for InMemoryJobRequestStore {
    async fn enqueue(&self, new: NewJobRequest) -> Result<JobRequest, JobStoreError> {
        let job = JobRequest::from_new(new, Utc::now());
        self.lock()?.insert(job.id, job.clone());
        Ok(job)
    }

    async fn find_by_id(&self, id: JobRequestId) -> Result<Option<JobRequest>, JobStoreError> {
        Ok(self.lock()?.get(&id).cloned())
    }

    async fn claim_next_excluding(
        &self,
        priorities: Option<&[JobPriority]>,
        exclude: &[JobRequestId],
    ) -> Result<Option<JobRequest>, JobStoreError> {
        let mut jobs = self.lock()?;
        let now = Utc::now();

        let next = jobs
            .values()
            .filter(|j| j.is_eligible(now) && !exclude.contains(&j.id))
            .filter(|j| priorities.map_or(true, |tiers| tiers.contains(&j.priority)))
            .min_by_key(|j| j.claim_order_key())
            .map(|j| j.id);

        Ok(next
            .and_then(|id| jobs.get_mut(&id))
            .map(|job| claim(job, now)))
    }

    async fn claim_by_id(&self, id: JobRequestId) -> Result<Option<JobRequest>, JobStoreError> {
        let mut jobs = self.lock()?;
        let now = Utc::now();

        Ok(jobs
            .get_mut(&id)
            .filter(|job| job.is_eligible(now))
            .map(|job| claim(job, now)))
    }

    async fn mark_waiting(
        &self,
        id: JobRequestId,
        next_run_at: DateTime<Utc>,
        error_message: Option<String>,
        result_summary: Option<Value>,
    ) -> Result<Option<JobRequest>, JobStoreError> {
        self.update_running(id, |job, _| {
            job.status = JobStatus::Waiting;
            job.next_run_at = Some(next_run_at);
            job.error_message = error_message;
            if result_summary.is_some() {
                job.result_summary = result_summary;
            }
        })
    }

    async fn mark_completed(
        &self,
        id: JobRequestId,
        sync_log_id: Option<String>,
        result_summary: Option<Value>,
    ) -> Result<Option<JobRequest>, JobStoreError> {
        self.update_running(id, |job, now| {
            job.status = JobStatus::Completed;
            job.completed_at = Some(now);
            job.next_run_at = None;
            job.error_message = None;
            job.sync_log_id = sync_log_id;
            job.result_summary = result_summary;
        })
    }

    async fn mark_failed(
        &self,
        id: JobRequestId,
        error_message: String,
        next_run_at: Option<DateTime<Utc>>,
        result_summary: Option<Value>,
    ) -> Result<Option<JobRequest>, JobStoreError> {
        self.update_running(id, |job, _| {
            job.status = JobStatus::Failed;
            job.error_message = Some(error_message);
            job.next_run_at = next_run_at;
            if result_summary.is_some() {
                job.result_summary = result_summary;
            }
        })
    }

    async fn mark_cancelled(&self, id: JobRequestId) -> Result<JobRequest, JobStoreError> {
        let mut jobs = self.lock()?;
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        if !job.status.is_cancellable() {
            return Err(JobStoreError::InvalidTransition {
                id,
                from: job.status,
                to: JobStatus::Cancelled,
            });
        }
        job.status = JobStatus::Cancelled;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn set_pending(
        &self,
        id: JobRequestId,
        next_run_at: Option<DateTime<Utc>>,
        priority: Option<JobPriority>,
    ) -> Result<JobRequest, JobStoreError> {
        let mut jobs = self.lock()?;
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        job.status = JobStatus::Pending;
        job.next_run_at = next_run_at;
        job.completed_at = None;
        if let Some(priority) = priority {
            job.priority = priority;
        }
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    async fn reset_orphaned_running(&self) -> Result<u64, JobStoreError> {
        let mut jobs = self.lock()?;
        let now = Utc::now();
        let mut recovered = 0;

        for job in jobs.values_mut().filter(|j| j.status == JobStatus::Running) {
            job.status = JobStatus::Waiting;
            job.next_run_at = Some(now);
            job.error_message = Some(ORPHANED_RUNNING_MESSAGE.to_string());
            job.updated_at = now;
            recovered += 1;
        }

        Ok(recovered)
    }

    async fn list(
        &self,
        filter: JobFilter,
        pagination: Pagination,
        order: SortOrder,
    ) -> Result<JobRequestPage, JobStoreError> {
        let jobs = self.lock()?;
        let mut matching: Vec<_> = jobs.values().filter(|j| filter.matches(j)).cloned().collect();

        matching.sort_by_key(|j| (j.created_at, j.id));
        if order == SortOrder::NewestFirst {
            matching.reverse();
        }

        let total = matching.len() as u64;
        let page: Vec<_> = matching
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect();

        Ok(JobRequestPage {
            jobs: page,
            total,
            pagination,
            has_more: total > u64::from(pagination.offset) + u64::from(pagination.limit),
        })
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.lock()?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            stats.record(job.status, 1);
        }
        Ok(stats)
    }
}

#[async_trait]
impl<T: JobRequestStore + ?Sized> JobRequestStore for Arc<T> {
    async fn enqueue(&self, new: NewJobRequest) -> Result<JobRequest, JobStoreError> {
        (**self).enqueue(new).await
    }

    async fn find_by_id(&self, id: JobRequestId) -> Result<Option<JobRequest>, JobStoreError> {
        (**self).find_by_id(id).await
    }

    async fn claim_next_excluding(
        &self,
        priorities: Option<&[JobPriority]>,
        exclude: &[JobRequestId],
    ) -> Result<Option<JobRequest>, JobStoreError> {
        (**self).claim_next_excluding(priorities, exclude).await
    }

    async fn claim_by_id(&self, id: JobRequestId) -> Result<Option<JobRequest>, JobStoreError> {
        (**self).claim_by_id(id).await
    }

    async fn mark_waiting(
        &self,
        id: JobRequestId,
        next_run_at: DateTime<Utc>,
        error_message: Option<String>,
        result_summary: Option<Value>,
    ) -> Result<Option<JobRequest>, JobStoreError> {
        (**self)
            .mark_waiting(id, next_run_at, error_message, result_summary)
            .await
    }

    async fn mark_completed(
        &self,
        id: JobRequestId,
        sync_log_id: Option<String>,
        result_summary: Option<Value>,
    ) -> Result<Option<JobRequest>, JobStoreError> {
        (**self).mark_completed(id, sync_log_id, result_summary).await
    }

    async fn mark_failed(
        &self,
        id: JobRequestId,
        error_message: String,
        next_run_at: Option<DateTime<Utc>>,
        result_summary: Option<Value>,
    ) -> Result<Option<JobRequest>, JobStoreError> {
        (**self)
            .mark_failed(id, error_message, next_run_at, result_summary)
            .await
    }

    async fn mark_cancelled(&self, id: JobRequestId) -> Result<JobRequest, JobStoreError> {
        (**self).mark_cancelled(id).await
    }

    async fn set_pending(
        &self,
        id: JobRequestId,
        next_run_at: Option<DateTime<Utc>>,
        priority: Option<JobPriority>,
    ) -> Result<JobRequest, JobStoreError> {
        (**self).set_pending(id, next_run_at, priority).await
    }

    async fn reset_orphaned_running(&self) -> Result<u64, JobStoreError> {
        (**self).reset_orphaned_running().await
    }

    async fn list(
        &self,
        filter: JobFilter,
        pagination: Pagination,
        order: SortOrder,
    ) -> Result<JobRequestPage, JobStoreError> {
        (**self).list(filter, pagination, order).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats().await
    }
}
