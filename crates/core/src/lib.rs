//! `clinicflow-core`: domain foundation for the job request queue.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the priority/status vocabulary and the transition rules that
//! every store implementation must honour.

pub mod error;
pub mod id;
pub mod job;

pub use error::DomainError;
pub use id::JobRequestId;
pub use job::{JobPriority, JobStatus, is_eligible};
