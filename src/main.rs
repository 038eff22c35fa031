use std::fs::OpenOptions;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tufrepo::blobstore::{BlobStore, FjallStore, MemStore};
use tufrepo::chunker::ChunkingStrategy;
use tufrepo::config::{Config, LogFormat};
use tufrepo::routes::router;
use tufrepo::Repository;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // values from a `.env` file never override the process environment
    let dotenv = dotenv::dotenv();
    let config = Config::parse();
    let _log_guard = init_tracing(&config)?;
    if let Ok(path) = &dotenv {
        tracing::info!(path = %path.display(), "loaded environment file");
    }

    let chunking = ChunkingStrategy::fixed(config.chunk_size);
    match &config.data_dir {
        Some(data_dir) => {
            let store = FjallStore::open(data_dir, chunking)
                .with_context(|| format!("failed to open store at {}", data_dir.display()))?;
            tracing::info!(data_dir = %data_dir.display(), "using persistent store");
            serve(store, &config).await
        }
        None => {
            tracing::warn!("no data directory configured, objects are kept in memory only");
            serve(MemStore::new(chunking), &config).await
        }
    }
}

/// Logs to stdout, and to `config.log_file` if one is set. File output stops
/// once the returned guard is dropped.
fn init_tracing(config: &Config) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let stdout = match config.log_format {
        LogFormat::Text => fmt::layer().boxed(),
        LogFormat::Json => fmt::layer().json().boxed(),
    };

    let (file, guard) = match &config.log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .with(file)
        .init();
    Ok(guard)
}

async fn serve<B: BlobStore>(store: B, config: &Config) -> anyhow::Result<()> {
    let repository = Repository::new(Arc::new(store), config);

    match repository.inventory().await {
        Ok(objects) => tracing::info!(objects = objects.len(), "opened blob store"),
        Err(err) => tracing::warn!(%err, "could not take store inventory"),
    }

    let app = router(repository, config.max_upload_bytes);
    let listener = TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    tracing::info!(addr = %config.listen, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
