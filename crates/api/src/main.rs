use std::sync::Arc;

use anyhow::Context;

use clinicflow_api::{app, handlers};
use clinicflow_infra::config::AppConfig;
use clinicflow_infra::jobs::HandlerRegistry;
use clinicflow_observability::LogFormat;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_format = LogFormat::from_env_value(std::env::var("LOG_FORMAT").ok().as_deref());
    clinicflow_observability::init(log_format.clone().unwrap_or_default());
    if let Err(e) = log_format {
        tracing::warn!(error = %e, "invalid LOG_FORMAT; using json");
    }

    let config = AppConfig::from_env().context("invalid configuration")?;

    let mut registry = HandlerRegistry::new();
    handlers::register_builtin(&mut registry);
    tracing::info!(job_types = ?registry.job_types(), "registered job handlers");

    let services = Arc::new(app::services::build_services(&config, registry).await?);

    let scheduler = if config.scheduler_enabled {
        Some(services.scheduler.start().await.context("failed to start job scheduler")?)
    } else {
        tracing::warn!("JOB_SCHEDULER_ENABLED=false; jobs only run when triggered");
        None
    };

    let app = app::build_app(services.clone());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Some(handle) = scheduler {
        handle.shutdown().await;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
