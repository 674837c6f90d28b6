use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use clinicflow_core::{JobPriority, JobStatus};
use clinicflow_infra::jobs::types::MAX_ATTEMPTS_LIMIT;
use clinicflow_infra::jobs::{JobFilter, NewJobRequest, Pagination, Requester, SortOrder};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct EnqueueJobRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default = "empty_object")]
    pub payload: Value,
    /// Lenient: unknown values fall back to `normal`.
    pub priority: Option<String>,
    pub origin: Option<String>,
    pub requested_by: Option<String>,
    pub requested_by_name: Option<String>,
    pub requested_by_role: Option<String>,
    pub max_attempts: Option<u32>,
    pub next_run_at: Option<DateTime<Utc>>,
    /// `pending` (default) or `waiting`; a `waiting` job with a future
    /// `next_run_at` is not picked up before that time.
    pub status: Option<String>,
    /// Trigger the job in the background right after enqueueing it.
    #[serde(default)]
    pub run_now: bool,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl EnqueueJobRequest {
    pub fn into_new_job(self, default_max_attempts: u32) -> Result<NewJobRequest, String> {
        let job_type = self.job_type.trim();
        if job_type.is_empty() {
            return Err("type must not be empty".to_string());
        }
        let max_attempts = self.max_attempts.unwrap_or(default_max_attempts);
        if max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(format!("max_attempts must be at most {MAX_ATTEMPTS_LIMIT}"));
        }

        let mut new = NewJobRequest::new(job_type, self.payload)
            .with_priority(JobPriority::normalize(self.priority.as_deref()))
            .with_max_attempts(max_attempts)
            .with_requester(Requester {
                id: self.requested_by,
                name: self.requested_by_name,
                role: self.requested_by_role,
            });
        if let Some(origin) = self.origin {
            new = new.with_origin(origin);
        }
        if let Some(at) = self.next_run_at {
            new = new.with_next_run_at(at);
        }
        if let Some(raw) = self.status.as_deref() {
            let status = raw.parse::<JobStatus>().map_err(|e| e.to_string())?;
            if !matches!(status, JobStatus::Pending | JobStatus::Waiting) {
                return Err(format!("status must be 'pending' or 'waiting', got '{status}'"));
            }
            new = new.with_initial_status(status);
        }
        Ok(new)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub priority: Option<String>,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    /// `asc` or `desc` by creation time (default `desc`)
    pub order: Option<String>,
}

impl ListJobsQuery {
    /// Strict parse: unknown status/priority/order values are rejected.
    pub fn into_parts(self) -> Result<(JobFilter, Pagination, SortOrder), String> {
        let status = self
            .status
            .as_deref()
            .map(str::parse::<JobStatus>)
            .transpose()
            .map_err(|e| e.to_string())?;
        let priority = self
            .priority
            .as_deref()
            .map(str::parse::<JobPriority>)
            .transpose()
            .map_err(|e| e.to_string())?;
        let order = match self.order.as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("desc") => SortOrder::NewestFirst,
            Some("asc") => SortOrder::OldestFirst,
            Some(other) => return Err(format!("order must be 'asc' or 'desc', got '{other}'")),
        };

        let filter = JobFilter {
            status,
            priority,
            job_type: self.job_type.filter(|t| !t.is_empty()),
        };
        Ok((filter, Pagination::new(self.limit, self.offset), order))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct RequeueJobRequest {
    pub next_run_at: Option<DateTime<Utc>>,
    pub priority: Option<String>,
}

impl RequeueJobRequest {
    pub fn priority(&self) -> Result<Option<JobPriority>, String> {
        self.priority
            .as_deref()
            .map(str::parse::<JobPriority>)
            .transpose()
            .map_err(|e| e.to_string())
    }
}
