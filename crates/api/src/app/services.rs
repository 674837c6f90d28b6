//! Service wiring: picks the job store and builds the scheduler around it.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use clinicflow_infra::config::AppConfig;
use clinicflow_infra::jobs::{
    HandlerRegistry, InMemoryJobRequestStore, JobRequestStore, JobScheduler,
    PostgresJobRequestStore,
};

/// Store handle shared by routes and the scheduler.
pub type SharedStore = Arc<dyn JobRequestStore>;

/// Services shared by all routes.
pub struct AppServices {
    pub store: SharedStore,
    pub scheduler: JobScheduler<SharedStore>,
    /// `max_attempts` for enqueue requests that do not carry one
    pub default_max_attempts: u32,
}

impl AppServices {
    pub fn new(store: SharedStore, registry: HandlerRegistry, config: &AppConfig) -> Self {
        let scheduler = JobScheduler::new(
            store.clone(),
            Arc::new(registry),
            config.scheduler.clone(),
        );
        Self {
            store,
            scheduler,
            default_max_attempts: config.default_max_attempts,
        }
    }

    /// In-memory services, for dev runs and tests.
    pub fn in_memory(registry: HandlerRegistry, config: &AppConfig) -> Self {
        Self::new(Arc::new(InMemoryJobRequestStore::new()), registry, config)
    }
}

/// Build services from configuration.
///
/// With `DATABASE_URL` set this connects to Postgres and creates the schema if
/// needed; otherwise jobs live in memory and are lost on restart.
pub async fn build_services(
    config: &AppConfig,
    registry: HandlerRegistry,
) -> anyhow::Result<AppServices> {
    let Some(url) = config.database_url.as_deref() else {
        warn!("DATABASE_URL not set; using in-memory job store (jobs are lost on restart)");
        return Ok(AppServices::in_memory(registry, config));
    };

    let store = PostgresJobRequestStore::connect(url, config.database_max_connections)
        .await
        .context("failed to connect to Postgres")?;
    store
        .ensure_schema()
        .await
        .context("failed to create job_requests schema")?;
    info!(
        max_connections = config.database_max_connections,
        "using Postgres job store"
    );

    Ok(AppServices::new(Arc::new(store), registry, config))
}
