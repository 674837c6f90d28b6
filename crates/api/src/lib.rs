//! HTTP API for the job request queue: routing, request/response mapping and
//! the built-in handlers registered by the binary.

pub mod app;
pub mod handlers;
pub mod middleware;
