use anyhow::{Context, Result};
use photobooth::api::{start_api_server, AppState};
use photobooth::config::{Config, DatabaseBackend, ObjectBackend};
use photobooth::{
    database, CommitService, MemoryObjectStore, MemoryRecordStore, MemoryStagingStore,
    ObjectStore, PgRecordStore, PgStagingStore, RecordStore, S3ObjectStore, StagingStore,
    UploadService,
};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Photobooth Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Object store must be ready before the first request
    let objects: Arc<dyn ObjectStore> = match config.object_store.backend {
        ObjectBackend::S3 => Arc::new(
            S3ObjectStore::new(&config.object_store)
                .await
                .context("Failed to initialize S3 object store")?,
        ),
        ObjectBackend::Memory => {
            warn!("Using in-memory object store; images are lost on restart");
            Arc::new(MemoryObjectStore::new(config.object_store.chunk_size_bytes))
        }
    };

    let (staging, records, pool) = init_stores(&config).await?;

    let uploads = Arc::new(UploadService::new(
        objects.clone(),
        staging.clone(),
        records.clone(),
        config.normalizer.clone(),
        &config.staging,
        config.object_store.chunk_size_bytes,
    ));
    let commits = Arc::new(CommitService::new(
        objects.clone(),
        staging,
        records,
        config.records.clone(),
    ));

    let api_state = AppState {
        uploads,
        commits,
        objects,
        database: pool,
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Photobooth service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down photobooth service");

    api_handle.abort();

    info!("Photobooth service stopped");

    Ok(())
}

/// Build the staging and record stores for the configured backend
async fn init_stores(
    config: &Config,
) -> Result<(Arc<dyn StagingStore>, Arc<dyn RecordStore>, Option<PgPool>)> {
    match config.database.backend {
        DatabaseBackend::Postgres => {
            let pool = database::connect(&config.database)
                .await
                .context("Failed to initialize database")?;

            // Run migrations if enabled
            if config.database.run_migrations {
                database::run_migrations(&pool)
                    .await
                    .context("Failed to run database migrations")?;
            }

            let staging: Arc<dyn StagingStore> = Arc::new(PgStagingStore::new(pool.clone()));
            let records: Arc<dyn RecordStore> = Arc::new(PgRecordStore::new(pool.clone()));
            Ok((staging, records, Some(pool)))
        }
        DatabaseBackend::Memory => {
            warn!("Using in-memory staging and record stores; data is lost on restart");
            let staging: Arc<dyn StagingStore> = Arc::new(MemoryStagingStore::new());
            let records: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
            Ok((staging, records, None))
        }
    }
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
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
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
