//! Job request endpoints: enqueue, inspect, trigger and operator actions.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use tracing::{info, warn};

use clinicflow_infra::jobs::JobRequestStore;

use crate::app::{dto, errors, services::AppServices};

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

pub fn router() -> Router {
    Router::new()
        .route("/", post(enqueue_job).get(list_jobs))
        .route("/stats", get(job_stats))
        .route("/:id", get(get_job))
        .route("/:id/trigger", post(trigger_job))
        .route("/:id/cancel", post(cancel_job))
        .route("/:id/requeue", post(requeue_job))
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// POST /jobs
///
/// Enqueue a job request. With `run_now: true` the job is also triggered in
/// the background; the response does not wait for it.
pub async fn enqueue_job(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::EnqueueJobRequest>,
) -> axum::response::Response {
    let run_now = body.run_now;
    let new = match body.into_new_job(services.default_max_attempts) {
        Ok(new) => new,
        Err(msg) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
    };

    let job = match services.store.enqueue(new).await {
        Ok(job) => job,
        Err(e) => return errors::store_error_to_response(e),
    };
    info!(job_id = %job.id, job_type = %job.job_type, priority = %job.priority, "job enqueued");

    if run_now {
        let scheduler = services.scheduler.clone();
        let id = job.id;
        tokio::spawn(async move {
            if let Err(e) = scheduler.trigger(id).await {
                warn!(job_id = %id, error = %e, "run_now trigger failed");
            }
        });
    }

    (StatusCode::CREATED, Json(job)).into_response()
}

/// GET /jobs?status=failed&priority=high&type=meta_ads.sync&limit=50&offset=0&order=desc
///
/// List job requests, newest first by default.
pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let (filter, pagination, order) = match query.into_parts() {
        Ok(parts) => parts,
        Err(msg) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_query", msg),
    };

    match services.store.list(filter, pagination, order).await {
        Ok(page) => (StatusCode::OK, Json(page)).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /jobs/stats
pub async fn job_stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.store.stats().await {
        Ok(stats) => Json(serde_json::json!({
            "total": stats.total(),
            "by_status": stats,
        }))
        .into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// GET /jobs/:id
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.store.find_by_id(id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("job request {id} not found")),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// POST /jobs/:id/trigger
///
/// Run the job now and wait for it. `triggered: false` means the job was not
/// eligible (already running, waiting for a later time, or terminal).
pub async fn trigger_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let triggered = match services.scheduler.trigger(id).await {
        Ok(triggered) => triggered,
        Err(e) => return errors::execute_error_to_response(e),
    };

    match services.store.find_by_id(id).await {
        Ok(job) => Json(serde_json::json!({
            "triggered": triggered,
            "job": job,
        }))
        .into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// POST /jobs/:id/cancel
///
/// Only `pending` and `waiting` jobs can be cancelled; anything else is a 409.
pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.store.mark_cancelled(id).await {
        Ok(job) => {
            info!(job_id = %id, "job cancelled");
            Json(job).into_response()
        }
        Err(e) => errors::store_error_to_response(e),
    }
}

/// POST /jobs/:id/requeue
///
/// Body (optional): `{"next_run_at": "...", "priority": "critical"}`.
/// Returns the job to `pending` from any status.
pub async fn requeue_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    body: Option<Json<dto::RequeueJobRequest>>,
) -> axum::response::Response {
    let id = match errors::parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let body = body.map(|Json(b)| b).unwrap_or_default();
    let priority = match body.priority() {
        Ok(p) => p,
        Err(msg) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
    };

    match services.store.set_pending(id, body.next_run_at, priority).await {
        Ok(job) => {
            info!(job_id = %id, priority = %job.priority, "job requeued");
            Json(job).into_response()
        }
        Err(e) => errors::store_error_to_response(e),
    }
}
