use axum::Router;

pub mod jobs;
pub mod scheduler;
pub mod system;

/// Router for the job queue endpoints.
pub fn router() -> Router {
    Router::new()
        .nest("/jobs", jobs::router())
        .nest("/scheduler", scheduler::router())
}
