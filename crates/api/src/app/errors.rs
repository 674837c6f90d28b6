use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use clinicflow_core::JobRequestId;
use clinicflow_infra::jobs::{ExecuteError, JobStoreError};

pub fn store_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("job request {id} not found"))
        }
        JobStoreError::InvalidTransition { .. } => {
            json_error(StatusCode::CONFLICT, "invalid_transition", err.to_string())
        }
        JobStoreError::Storage(msg) => {
            tracing::error!(error = %msg, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg)
        }
    }
}

pub fn execute_error_to_response(err: ExecuteError) -> axum::response::Response {
    match err {
        ExecuteError::UnknownJobType(_) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "unknown_job_type", err.to_string())
        }
        ExecuteError::Store(e) => store_error_to_response(e),
        ExecuteError::Dispatch(msg) => json_error(StatusCode::BAD_GATEWAY, "dispatch_error", msg),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn parse_job_id(raw: &str) -> Result<JobRequestId, axum::response::Response> {
    raw.parse()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid job request id"))
}
