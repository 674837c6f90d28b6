//! Core job request types and handler outcomes.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use clinicflow_core::{JobPriority, JobRequestId, JobStatus, is_eligible};

/// Default ceiling stored on new job requests when the caller gives none.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Largest `max_attempts` a store can hold (a Postgres `INTEGER`).
pub const MAX_ATTEMPTS_LIMIT: u32 = i32::MAX as u32;

/// Who (or what) asked for a job. Informational only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub id: Option<String>,
    pub name: Option<String>,
    pub role: Option<String>,
}

/// A stored job request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub id: JobRequestId,
    /// Handler key; opaque to the queue.
    #[serde(rename = "type")]
    pub job_type: String,
    pub priority: JobPriority,
    pub status: JobStatus,
    pub origin: Option<String>,
    /// Opaque payload handed verbatim to the handler.
    pub payload: Value,
    pub requested_by: Option<String>,
    pub requested_by_name: Option<String>,
    pub requested_by_role: Option<String>,
    /// Number of successful claims so far.
    pub attempts: u32,
    /// Stored for operators; nothing enforces it automatically.
    pub max_attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Earliest eligibility time; `None` means eligible immediately.
    pub next_run_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// External sync log correlation id reported by a completing handler.
    pub sync_log_id: Option<String>,
    pub error_message: Option<String>,
    pub result_summary: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRequest {
    /// Materialize an enqueue request into a fresh record.
    pub fn from_new(new: NewJobRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: JobRequestId::new(),
            job_type: new.job_type,
            priority: new.priority,
            status: new.initial_status,
            origin: new.origin,
            payload: new.payload,
            requested_by: new.requester.id,
            requested_by_name: new.requester.name,
            requested_by_role: new.requester.role,
            attempts: 0,
            max_attempts: new.max_attempts,
            last_attempt_at: None,
            next_run_at: new.next_run_at,
            completed_at: None,
            sync_log_id: None,
            error_message: None,
            result_summary: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a claim at `now` may take this job.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        is_eligible(self.status, self.next_run_at, now)
    }

    /// Claim ordering key: priority rank, unscheduled first, earliest
    /// `next_run_at`, oldest `created_at`, then id for total determinism.
    pub fn claim_order_key(
        &self,
    ) -> (i16, bool, Option<DateTime<Utc>>, DateTime<Utc>, JobRequestId) {
        (
            self.priority.rank(),
            self.next_run_at.is_some(),
            self.next_run_at,
            self.created_at,
            self.id,
        )
    }
}

/// Parameters for enqueueing a job request.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJobRequest {
    pub job_type: String,
    pub payload: Value,
    pub priority: JobPriority,
    pub origin: Option<String>,
    pub requester: Requester,
    pub max_attempts: u32,
    pub next_run_at: Option<DateTime<Utc>>,
    /// Almost always `Pending`; some callers park work as `Waiting` up front.
    pub initial_status: JobStatus,
}

impl NewJobRequest {
    pub fn new(job_type: impl Into<String>, payload: Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            priority: JobPriority::Normal,
            origin: None,
            requester: Requester::default(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            next_run_at: None,
            initial_status: JobStatus::Pending,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_requester(mut self, requester: Requester) -> Self {
        self.requester = requester;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_next_run_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_run_at = Some(at);
        self
    }

    pub fn with_initial_status(mut self, status: JobStatus) -> Self {
        self.initial_status = status;
        self
    }
}

/// What a handler reports back after running.
///
/// A handler error (or panic) is the third, failed, outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed {
        result: Option<Value>,
        sync_log_id: Option<String>,
    },
    /// Retry later. An explicit `next_run_at` wins over `backoff`; with
    /// neither, the executor's default backoff applies.
    Waiting {
        next_run_at: Option<DateTime<Utc>>,
        backoff: Option<Duration>,
        result: Option<Value>,
        reason: Option<String>,
    },
}

impl JobOutcome {
    pub fn completed() -> Self {
        Self::Completed {
            result: None,
            sync_log_id: None,
        }
    }

    pub fn completed_with(result: Value) -> Self {
        Self::Completed {
            result: Some(result),
            sync_log_id: None,
        }
    }

    pub fn waiting() -> Self {
        Self::Waiting {
            next_run_at: None,
            backoff: None,
            result: None,
            reason: None,
        }
    }

    pub fn waiting_until(at: DateTime<Utc>) -> Self {
        Self::Waiting {
            next_run_at: Some(at),
            backoff: None,
            result: None,
            reason: None,
        }
    }

    pub fn waiting_for(backoff: Duration) -> Self {
        Self::Waiting {
            next_run_at: None,
            backoff: Some(backoff),
            result: None,
            reason: None,
        }
    }

    /// Attach a result payload (either variant).
    pub fn with_result(mut self, value: Value) -> Self {
        match &mut self {
            Self::Completed { result, .. } | Self::Waiting { result, .. } => *result = Some(value),
        }
        self
    }

    /// Attach an external sync log id; ignored for `Waiting`.
    pub fn with_sync_log_id(mut self, id: impl Into<String>) -> Self {
        if let Self::Completed { sync_log_id, .. } = &mut self {
            *sync_log_id = Some(id.into());
        }
        self
    }

    /// Attach a human-readable reason; ignored for `Completed`.
    pub fn with_reason(mut self, text: impl Into<String>) -> Self {
        if let Self::Waiting { reason, .. } = &mut self {
            *reason = Some(text.into());
        }
        self
    }
}

/// Parse a resume time handed over as text (e.g. from an upstream
/// rate-limit header). Accepts RFC 3339 or epoch milliseconds.
pub fn parse_resume_at(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    raw.parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
}

/// Filter criteria for job listings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub priority: Option<JobPriority>,
    pub job_type: Option<String>,
}

impl JobFilter {
    pub fn matches(&self, job: &JobRequest) -> bool {
        self.status.map_or(true, |s| job.status == s)
            && self.priority.map_or(true, |p| job.priority == p)
            && self.job_type.as_deref().map_or(true, |t| job.job_type == t)
    }
}

/// Pagination parameters for job listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).clamp(1, 1000),
            offset: offset.unwrap_or(0),
        }
    }
}

/// Listing order, by `created_at`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// One page of a job listing.
#[derive(Debug, Clone, Serialize)]
pub struct JobRequestPage {
    pub jobs: Vec<JobRequest>,
    /// Total matching rows across all pages.
    pub total: u64,
    pub pagination: Pagination,
    pub has_more: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_request_defaults() {
        let new = NewJobRequest::new("meta_ads.sync", json!({"clinic_id": 7}));
        let job = JobRequest::from_new(new, Utc::now());

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, JobPriority::Normal);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, DEFAULT_MAX_ATTEMPTS);
        assert!(job.next_run_at.is_none());
        assert!(job.is_eligible(Utc::now()));
    }

    #[test]
    fn requester_fields_are_flattened() {
        let new = NewJobRequest::new("noop", json!({})).with_requester(Requester {
            id: Some("42".into()),
            name: Some("Dr. Who".into()),
            role: Some("admin".into()),
        });
        let job = JobRequest::from_new(new, Utc::now());

        assert_eq!(job.requested_by.as_deref(), Some("42"));
        assert_eq!(job.requested_by_role.as_deref(), Some("admin"));
    }

    #[test]
    fn serializes_type_field() {
        let job = JobRequest::from_new(NewJobRequest::new("noop", json!({})), Utc::now());
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "noop");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["priority"], "normal");
    }

    #[test]
    fn outcome_builders() {
        let outcome = JobOutcome::completed()
            .with_result(json!({"ok": true}))
            .with_sync_log_id("log-1");
        assert_eq!(
            outcome,
            JobOutcome::Completed {
                result: Some(json!({"ok": true})),
                sync_log_id: Some("log-1".into()),
            }
        );

        let outcome = JobOutcome::waiting_for(Duration::from_secs(30)).with_reason("quota");
        assert!(matches!(
            outcome,
            JobOutcome::Waiting { backoff: Some(d), reason: Some(_), .. } if d == Duration::from_secs(30)
        ));
    }

    #[test]
    fn parses_resume_times() {
        let at = parse_resume_at("2026-03-01T10:00:00Z").unwrap();
        assert_eq!(at.timestamp(), 1_772_359_200);

        let at = parse_resume_at("1772359200000").unwrap();
        assert_eq!(at.timestamp(), 1_772_359_200);

        assert!(parse_resume_at("tomorrow-ish").is_none());
        assert!(parse_resume_at("   ").is_none());
    }

    #[test]
    fn pagination_is_clamped() {
        assert_eq!(Pagination::new(None, None), Pagination::default());
        assert_eq!(Pagination::new(Some(5000), Some(3)).limit, 1000);
        assert_eq!(Pagination::new(Some(0), None).limit, 1);
    }

    #[test]
    fn filter_matching() {
        let job = JobRequest::from_new(
            NewJobRequest::new("ga.sync", json!({})).with_priority(JobPriority::High),
            Utc::now(),
        );
        assert!(JobFilter::default().matches(&job));
        assert!(JobFilter { priority: Some(JobPriority::High), ..Default::default() }.matches(&job));
        assert!(!JobFilter { status: Some(JobStatus::Failed), ..Default::default() }.matches(&job));
        assert!(!JobFilter { job_type: Some("other".into()), ..Default::default() }.matches(&job));
    }
}
