//! Parley - Campaign dispatch server entry point

use anyhow::{bail, Context, Result};
use parley_api::AppState;
use parley_common::config::{Config, LoggingConfig};
use parley_core::queue::{DISPATCH_QUEUE, RECONCILE_QUEUE};
use parley_core::{
    CampaignManager, DispatchScheduler, HttpGatewayClient, MaintenanceLoop, SessionManager,
    StatusReconciler, TaskQueue, TaskRouter, WebhookIngestor, WorkerPool,
};
use parley_storage::{DatabasePool, MemoryStore, Repositories};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load()?;

    init_logging(&config.logging);

    info!("Starting Parley server...");

    let repos = open_storage(&config).await?;

    let gateway = Arc::new(HttpGatewayClient::new(config.gateway.clone())?);
    let queue = TaskQueue::new(repos.jobs.clone(), config.workers.max_attempts);

    let campaigns = Arc::new(CampaignManager::new(repos.clone(), queue.clone()));
    let sessions = Arc::new(SessionManager::new(
        repos.clone(),
        gateway.clone(),
        &config.server.public_base_url,
    ));
    let ingestor = Arc::new(WebhookIngestor::new(
        repos.clone(),
        queue.clone(),
        config.webhook.clone(),
    ));

    let router = Arc::new(TaskRouter::new(
        Arc::new(DispatchScheduler::new(
            repos.clone(),
            gateway,
            config.dispatch.clone(),
        )),
        Arc::new(StatusReconciler::new(repos.clone(), config.webhook.clone())),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Start workers
    let pool = Arc::new(WorkerPool::new(
        repos.jobs.clone(),
        queue.clone(),
        router,
        config.workers.poll_interval(),
    ));
    let mut handles = pool.spawn(
        DISPATCH_QUEUE,
        config.workers.dispatch_concurrency,
        shutdown_rx.clone(),
    );
    handles.extend(pool.spawn(
        RECONCILE_QUEUE,
        config.workers.reconcile_concurrency,
        shutdown_rx.clone(),
    ));

    // Start maintenance sweeps
    let maintenance = MaintenanceLoop::new(
        repos.clone(),
        queue,
        campaigns.clone(),
        sessions.clone(),
        config.dispatch.clone(),
        config.webhook.clone(),
        config.workers.clone(),
    );
    handles.push(tokio::spawn(maintenance.run(shutdown_rx.clone())));

    // Start API server
    let app = parley_api::create_router(AppState {
        repos,
        campaigns,
        ingestor,
        sessions,
    });
    let bind = format!("{}:{}", config.server.bind_address, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind API server on {}", bind))?;
    info!("Parley server listening on {}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server error")?;

    info!("Shutdown signal received, stopping workers");
    let _ = shutdown_tx.send(true);
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    info!("Parley server shutdown complete");

    Ok(())
}

/// Build the repository set for the configured backend
async fn open_storage(config: &Config) -> Result<Repositories> {
    match config.database.backend.as_str() {
        "postgres" => {
            let db_pool = DatabasePool::new(&config.database).await?;
            db_pool.migrate().await?;
            Ok(Repositories::postgres(&db_pool))
        }
        "memory" => {
            warn!("Using the in-memory backend; nothing survives a restart");
            Ok(MemoryStore::new().repositories())
        }
        other => bail!("Unsupported database backend: {}", other),
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},parley=debug", config.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry
            .with(fmt::layer().json().with_target(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
