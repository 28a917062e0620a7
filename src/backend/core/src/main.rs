//! Lectern worker - main entry point
//!
//! Runs the background job scheduler: video transcoding, newsletters,
//! sequences, stuck-video cleanup and weekly backups.

use std::sync::Arc;

use lectern_core::{
    catalog::PgCatalogStore,
    config::Config,
    db::Database,
    handlers::{self, PgDumper, Services},
    jobs::{PgJobStore, Scheduler},
    mail::SesTransport,
    media::{default_ladder, FfmpegEncoder, Transcoder},
    observability,
    storage::StorageGateway,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration, from a file when one is named
    let config = match std::env::var("LECTERN_CONFIG") {
        Ok(path) => Config::from_file(&path)?,
        Err(_) => Config::load()?,
    };

    observability::init("lectern-worker", &config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        worker = %config.scheduler.name,
        "Starting Lectern worker"
    );

    // Connect to database
    let db = Database::new(&config.database).await?;
    db.migrate().await?;
    db.ping().await?;
    tracing::info!("Connected to database, migrations applied");

    // Build collaborators
    let storage = Arc::new(StorageGateway::from_config(config.storage.clone())?);
    let encoder = Arc::new(FfmpegEncoder::new(&config.media));
    let transcoder = Arc::new(Transcoder::new(encoder, default_ladder(), &config.media));
    let mail = Arc::new(SesTransport::new(&config.mail)?);
    let source_url = config
        .backup
        .source_url
        .clone()
        .unwrap_or_else(|| config.database.url.clone());
    let dumper = Arc::new(PgDumper::new(config.backup.dump_command.clone(), source_url));

    let services = Services {
        catalog: Arc::new(PgCatalogStore::new(db.pool().clone())),
        storage,
        transcoder,
        mail,
        dumper,
    };

    // Register handlers and recurring jobs
    let builder = Scheduler::builder(
        Arc::new(PgJobStore::new(db.pool().clone())),
        config.scheduler.clone(),
    );
    let scheduler = handlers::register_handlers(builder, &services, &config)?.build();
    handlers::register_recurring_jobs(&scheduler, &config).await?;

    let handle = scheduler.start();
    tracing::info!("Scheduler running");

    shutdown_signal().await;
    handle.shutdown().await;

    // Cleanup
    observability::shutdown();
    tracing::info!("Worker shutdown complete");

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
