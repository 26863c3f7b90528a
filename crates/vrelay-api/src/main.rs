//! vrelay server binary: HTTP API, stale lease reaper and local worker.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use vrelay_api::{create_router, metrics, ApiConfig, AppState, RunnerGateway};
use vrelay_scheduler::{
    DependencyBuilder, EventBus, JobEvent, LeaseManager, LoggingResultHandler, SchedulerConfig,
    StaleLeaseReaper, VideoLock,
};
use vrelay_store::MemoryStore;
use vrelay_worker::{LocalWorker, ProcessEncoder, WorkerConfig};

const EVENT_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env().add_directive("vrelay=info".parse()?);

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(true).with_target(true))
            .with(env_filter)
            .init();
    }

    info!("Starting vrelay-api");

    let config = ApiConfig::from_env();
    let scheduler_config = Arc::new(SchedulerConfig::from_env());
    let worker_config = WorkerConfig::from_env();
    info!("API config: host={}, port={}", config.host, config.port);

    if config.registration_tokens.is_empty() {
        warn!("No runner registration tokens configured, remote runners cannot register");
    }

    let store = match &config.snapshot_path {
        Some(path) if path.exists() => {
            info!(path = %path.display(), "Loading store snapshot");
            Arc::new(MemoryStore::load(path).await.context("failed to load store snapshot")?)
        }
        _ => Arc::new(MemoryStore::new()),
    };

    let events = EventBus::new(EVENT_CAPACITY);
    let locks = VideoLock::new();
    let leases = Arc::new(LeaseManager::new(
        store.clone(),
        Arc::clone(&scheduler_config),
        events.clone(),
        Arc::new(LoggingResultHandler),
    ));
    let builder = Arc::new(DependencyBuilder::new(
        store.clone(),
        Arc::clone(&scheduler_config),
        events.clone(),
    ));
    let gateway = Arc::new(RunnerGateway::new(
        store.clone(),
        Arc::clone(&leases),
        config.registration_tokens.clone(),
    ));

    let metrics_enabled = std::env::var("METRICS_ENABLED")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(true);

    let metrics_handle = if metrics_enabled {
        info!("Prometheus metrics enabled at /metrics");
        Some(metrics::init_metrics().context("failed to install Prometheus recorder")?)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reaper = StaleLeaseReaper::new(
        Arc::clone(&leases),
        store.clone(),
        store.clone(),
        Arc::clone(&scheduler_config),
    );
    let reaper_handle = tokio::spawn(async move { reaper.run(shutdown_rx).await });

    let encoder = Arc::new(ProcessEncoder::new(
        worker_config.encoder_program.clone(),
        worker_config.encode_timeout,
    ));
    let worker = Arc::new(LocalWorker::new(
        worker_config,
        Arc::clone(&leases),
        store.clone(),
        locks,
        encoder,
    ));
    let worker_handle = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move {
            if let Err(e) = worker.run().await {
                error!("Local worker stopped: {}", e);
            }
        })
    };

    tokio::spawn(log_events(events.subscribe()));

    let state = AppState {
        config: config.clone(),
        scheduler: scheduler_config,
        agents: store.clone(),
        leases,
        builder,
        gateway,
    };
    let app = create_router(state, metrics_handle);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid bind address")?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("HTTP server stopped, stopping background tasks");
    let _ = shutdown_tx.send(true);
    worker.shutdown();
    if let Err(e) = reaper_handle.await {
        error!("Reaper task failed: {}", e);
    }
    if let Err(e) = worker_handle.await {
        error!("Worker task failed: {}", e);
    }

    if let Some(path) = &config.snapshot_path {
        store.save(path).await.context("failed to write store snapshot")?;
        info!(path = %path.display(), "Store snapshot written");
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Notification collaborator stand-in: logs lifecycle events.
async fn log_events(mut rx: broadcast::Receiver<JobEvent>) {
    loop {
        match rx.recv().await {
            Ok(JobEvent::InputReleasable { job_id, video_key }) => {
                info!(job_id = %job_id, video_key = %video_key, "Original upload can be released");
            }
            Ok(event) => tracing::debug!(event = ?event, "Job event"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event log lagging");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
