//! Strongly-typed identifiers used across the domain.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of a job request.
///
/// UUIDv7 keeps identifiers roughly time-ordered, which makes log lines and
/// listings easier to follow.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobRequestId(Uuid);

impl JobRequestId {
    /// Create a new identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobRequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Display for JobRequestId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for JobRequestId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<JobRequestId> for Uuid {
    fn from(value: JobRequestId) -> Self {
        value.0
    }
}

impl FromStr for JobRequestId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::from_str(s)
            .map_err(|e| DomainError::invalid_id(format!("JobRequestId: {}", e)))?;
        Ok(Self(uuid))
    }
}
