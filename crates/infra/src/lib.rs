//! Infrastructure layer: job request storage, execution and scheduling.

pub mod config;
pub mod jobs;
