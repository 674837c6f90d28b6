//! Priority and status vocabulary for job requests.
//!
//! Both enums are closed sets and serialize as lowercase strings, which is also
//! how they are stored in the `job_requests` table.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Scheduling priority of a job request.
///
/// Declaration order is the claim order: `Critical` sorts first.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl JobPriority {
    pub const ALL: [JobPriority; 4] = [
        JobPriority::Critical,
        JobPriority::High,
        JobPriority::Normal,
        JobPriority::Low,
    ];

    /// Tier serviced by the fast polling loop.
    pub const CRITICAL_TIER: [JobPriority; 1] = [JobPriority::Critical];

    /// Tiers serviced by the slow polling loop.
    pub const STANDARD_TIER: [JobPriority; 3] =
        [JobPriority::High, JobPriority::Normal, JobPriority::Low];

    /// Numeric rank used for ordering (lower runs first).
    pub fn rank(self) -> i16 {
        match self {
            JobPriority::Critical => 0,
            JobPriority::High => 1,
            JobPriority::Normal => 2,
            JobPriority::Low => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobPriority::Critical => "critical",
            JobPriority::High => "high",
            JobPriority::Normal => "normal",
            JobPriority::Low => "low",
        }
    }

    /// Lenient parse used at the enqueue boundary: unknown or missing values
    /// fall back to `Normal`.
    pub fn normalize(raw: Option<&str>) -> Self {
        raw.and_then(|s| s.parse().ok()).unwrap_or_default()
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl core::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobPriority {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(JobPriority::Critical),
            "high" => Ok(JobPriority::High),
            "normal" => Ok(JobPriority::Normal),
            "low" => Ok(JobPriority::Low),
            other => Err(DomainError::validation(format!(
                "unknown job priority '{other}'"
            ))),
        }
    }
}

/// Lifecycle status of a job request.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, eligible immediately.
    Pending,
    /// Parked until `next_run_at` (backpressure, timeout or crash recovery).
    Waiting,
    /// Claimed by exactly one executor.
    Running,
    Completed,
    /// Handler failed; only an operator requeue brings it back.
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Waiting,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Waiting => "waiting",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses that are never left without an explicit operator requeue.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }

    /// Operators may only cancel work that has not started.
    pub fn is_cancellable(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Waiting)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "waiting" => Ok(JobStatus::Waiting),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(DomainError::validation(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

/// Eligibility rule shared by every store.
///
/// A job can be claimed iff it is `pending`, or `waiting` with no
/// `next_run_at` or one that has already elapsed.
pub fn is_eligible(status: JobStatus, next_run_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match status {
        JobStatus::Pending => true,
        JobStatus::Waiting => next_run_at.map_or(true, |at| at <= now),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    #[test]
    fn priority_order_matches_rank() {
        let mut sorted = vec![JobPriority::Low, JobPriority::Critical, JobPriority::Normal, JobPriority::High];
        sorted.sort();
        assert_eq!(sorted, JobPriority::ALL.to_vec());
        let ranks: Vec<i16> = JobPriority::ALL.iter().map(|p| p.rank()).collect();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
    }

    #[test]
    fn normalize_falls_back_to_normal() {
        assert_eq!(JobPriority::normalize(Some("CRITICAL")), JobPriority::Critical);
        assert_eq!(JobPriority::normalize(Some(" low ")), JobPriority::Low);
        assert_eq!(JobPriority::normalize(Some("urgent")), JobPriority::Normal);
        assert_eq!(JobPriority::normalize(None), JobPriority::Normal);
    }

    #[test]
    fn tiers_partition_all_priorities() {
        let mut tiers: Vec<_> = JobPriority::CRITICAL_TIER
            .iter()
            .chain(JobPriority::STANDARD_TIER.iter())
            .copied()
            .collect();
        tiers.sort();
        assert_eq!(tiers, JobPriority::ALL.to_vec());
    }

    #[test]
    fn eligibility_rules() {
        let now = Utc::now();
        assert!(is_eligible(JobStatus::Pending, Some(now + Duration::hours(1)), now));
        assert!(is_eligible(JobStatus::Waiting, None, now));
        assert!(is_eligible(JobStatus::Waiting, Some(now), now));
        assert!(!is_eligible(JobStatus::Waiting, Some(now + Duration::hours(1)), now));
        assert!(!is_eligible(JobStatus::Running, None, now));
        assert!(!is_eligible(JobStatus::Completed, None, now));
        assert!(!is_eligible(JobStatus::Failed, None, now));
        assert!(!is_eligible(JobStatus::Cancelled, None, now));
    }

    #[test]
    fn status_string_forms() {
        for s in JobStatus::ALL {
            assert_eq!(s.as_str().parse::<JobStatus>().unwrap(), s);
        }
        assert!("done".parse::<JobStatus>().is_err());
        assert!(JobStatus::Completed.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
        assert!(JobStatus::Waiting.is_cancellable());
        assert!(!JobStatus::Running.is_cancellable());
    }

    proptest! {
        #[test]
        fn normalize_never_panics(raw in ".*") {
            let p = JobPriority::normalize(Some(&raw));
            prop_assert!(JobPriority::ALL.contains(&p));
        }
    }
}
