use anyhow::{Context, Result};
use loader_service::config::Config;
use loader_service::dispatcher::{DispatcherSettings, IngestDispatcher};
use loader_service::error::IngestError;
use loader_service::store::PgStore;
use loader_service::watcher::DirectoryWatcher;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Pick up a local .env before reading configuration
    dotenvy::dotenv().ok();

    let config = Config::load().context("Failed to load configuration")?;

    init_tracing(&config.service.log_level, &config.service.log_format);

    info!(
        service = %config.service.name,
        directory = %config.watcher.directory.display(),
        batch_size = config.ingest.batch_size,
        "Starting Nier Loader Service"
    );

    if config.service.metrics_port != 0 {
        init_metrics(config.service.metrics_port)?;
    }

    let store = match bootstrap_store(&config).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(kind = %e.kind(), error = %e, "Schema bootstrap failed");
            return Err(e).context("Failed to initialize database");
        }
    };

    let (tx, rx) = mpsc::channel(config.watcher.queue_capacity);

    let dir_watcher = if config.watcher.scan_existing {
        let (dir_watcher, backlog) =
            DirectoryWatcher::start_with_existing(&config.watcher.directory, tx.clone())
                .context("Failed to start directory watcher")?;
        let backlog_tx = tx.clone();
        tokio::spawn(async move {
            for event in backlog {
                if backlog_tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        dir_watcher
    } else {
        DirectoryWatcher::start(&config.watcher.directory, tx.clone())
            .context("Failed to start directory watcher")?
    };
    drop(tx);

    let dispatcher = Arc::new(IngestDispatcher::new(
        Arc::clone(&store),
        DispatcherSettings::from(&config.ingest),
    ));

    let shutdown = CancellationToken::new();
    let dispatcher_handle = tokio::spawn(dispatcher.run(rx, shutdown.clone()));

    info!("Loader service started successfully");

    shutdown_signal().await;

    info!("Shutting down loader service");

    // Stop new notifications first, then let in-flight files drain
    drop(dir_watcher);
    shutdown.cancel();

    match dispatcher_handle.await {
        Ok(tracker) => {
            let grace = config.shutdown_grace();
            if tokio::time::timeout(grace, tracker.wait()).await.is_err() {
                warn!(
                    grace_secs = grace.as_secs(),
                    in_flight = tracker.len(),
                    "Shutdown grace period elapsed with files still in flight"
                );
            }
        }
        Err(e) => error!(error = %e, "Dispatcher task panicked"),
    }

    store.close().await;

    info!("Loader service stopped");

    Ok(())
}

/// Connect, creating the database when missing, and make sure the schema exists
async fn bootstrap_store(config: &Config) -> Result<PgStore, IngestError> {
    let store = PgStore::connect(&config.database)
        .await
        .map_err(IngestError::SchemaBootstrap)?;
    store
        .ensure_schema()
        .await
        .map_err(IngestError::SchemaBootstrap)?;
    Ok(store)
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
