use std::sync::Arc;

use axum::{extract::Extension, routing::get, Json, Router};

use clinicflow_infra::jobs::SchedulerStatus;

use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new().route("/status", get(scheduler_status))
}

/// GET /scheduler/status
pub async fn scheduler_status(Extension(services): Extension<Arc<AppServices>>) -> Json<SchedulerStatus> {
    Json(services.scheduler.status())
}
