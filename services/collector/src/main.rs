//! yhs-collector
//!
//! Tracks the scheduler's applications, queues and nodes over time. Live
//! events keep running applications current; periodic reconciliation
//! against the REST API keeps everything else in step.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use yhs_collector::{
    api::{self, AppState},
    client::{RestClient, SchedulerClient},
    config::{Config, StoreKind},
    counters::EventCounters,
    db::Database,
    shutdown::signalled,
    store::{MemoryStore, PersistenceStore},
    sync::SyncService,
    workqueue::WorkQueue,
};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to YHS_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting yhs-collector");
    info!(
        scheduler_url = %config.scheduler_url,
        listen_addr = %config.listen_addr,
        store = ?config.store,
        "Configuration loaded"
    );

    let store: Arc<dyn PersistenceStore> = match config.store {
        StoreKind::Postgres => {
            let db = Database::connect(&config.database)
                .await
                .inspect_err(|e| error!(error = %e, "Failed to connect to database"))?;
            if config.dev_mode {
                info!("Running database migrations (dev mode)");
                db.run_migrations()
                    .await
                    .inspect_err(|e| error!(error = %e, "Failed to run migrations"))?;
            }
            Arc::new(db.store())
        }
        StoreKind::Memory => {
            warn!("Using in-memory store; history is lost on exit");
            Arc::new(MemoryStore::new())
        }
    };

    let client: Arc<dyn SchedulerClient> = Arc::new(
        RestClient::new(&config.scheduler_url).context("failed to build scheduler client")?,
    );
    let counters = Arc::new(EventCounters::new());
    let workqueue = Arc::new(WorkQueue::new(config.workqueue.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let service = Arc::new(SyncService::new(
        config.sync.clone(),
        Arc::clone(&client),
        Arc::clone(&store),
        workqueue,
        Arc::clone(&counters),
    ));
    let sync_handle = tokio::spawn({
        let service = Arc::clone(&service);
        let shutdown_rx = shutdown_rx.clone();
        async move {
            if let Err(e) = service.run(shutdown_rx).await {
                error!(error = %e, "Sync service failed");
            }
        }
    });

    let app = api::create_router(AppState::new(client, store, counters));
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn({
        let mut shutdown_rx = shutdown_rx;
        async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    signalled(&mut shutdown_rx).await;
                    info!("HTTP server shutting down");
                })
                .await
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    service.shutdown();
    let _ = shutdown_tx.send(true);

    info!("Waiting for the sync service to stop...");
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, sync_handle).await.is_err() {
        warn!("Sync service did not shut down in time");
    }

    info!("yhs-collector shutdown complete");
    Ok(())
}
