//! Command implementations for the mirror daemon.
//!
//! Handles:
//! - start: Load config, open storage, build collaborators, supervise the pipeline
//! - status: Print the checkpoint and bookkeeping counts
//! - reset: Write the zero checkpoint

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};

use mirror_client::{CouchRegistry, DownloadsClient, FilesClient};
use mirror_storage::{CheckpointStore, LocalIndex, Storage};
use mirror_types::{Checkpoint, SearchIndex, Settings, TracingReporter};

use crate::pipeline::{Collaborators, Exit, Pipeline};

/// CLI overrides, applied over the loaded configuration.
#[derive(Debug, Default, Clone)]
pub struct Overrides<'a> {
    pub config_path: Option<&'a str>,
    pub db_path: Option<&'a str>,
    pub log_level: Option<&'a str>,
    pub seed: bool,
}

/// Load configuration and apply CLI overrides (highest precedence).
pub fn load_settings(overrides: &Overrides<'_>) -> Result<Settings> {
    let mut settings =
        Settings::load(overrides.config_path).context("Failed to load configuration")?;

    if let Some(db_path) = overrides.db_path {
        settings.db_path = db_path.to_string();
    }
    if let Some(log_level) = overrides.log_level {
        settings.log_level = log_level.to_string();
    }
    if overrides.seed {
        settings.pipeline.seed = true;
    }
    Ok(settings)
}

fn open_storage(settings: &Settings) -> Result<Arc<Storage>> {
    let db_path = settings.expanded_db_path();
    info!("Opening storage at {:?}", db_path);

    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let storage = Storage::open(&db_path).context("Failed to open storage")?;
    Ok(Arc::new(storage))
}

fn init_tracing(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

/// Start the mirror daemon.
///
/// 1. Load configuration (defaults -> file -> env -> CLI)
/// 2. Open RocksDB storage
/// 3. Build the registry, downloads and file listing clients
/// 4. Supervise the pipeline until SIGINT/SIGTERM, exiting hard when the
///    grace period runs out
pub async fn start_daemon(overrides: Overrides<'_>) -> Result<()> {
    let settings = load_settings(&overrides)?;
    init_tracing(&settings.log_level)?;

    info!("Registry mirror starting...");
    info!("Configuration:");
    info!("  Database path: {}", settings.db_path);
    info!("  Registry: {}", settings.registry.url);
    info!("  Production index: {}", settings.indices.production);
    info!("  Log level: {}", settings.log_level);
    if settings.pipeline.seed {
        warn!("Seed requested, the checkpoint will be reset");
    }

    let storage = open_storage(&settings)?;
    let collaborators = Collaborators {
        registry: Arc::new(
            CouchRegistry::new(&settings.registry).context("Failed to build registry client")?,
        ),
        index: Arc::new(LocalIndex::new(storage.clone())),
        downloads: Arc::new(
            DownloadsClient::new(&settings.registry).context("Failed to build downloads client")?,
        ),
        files: Arc::new(
            FilesClient::new(&settings.registry).context("Failed to build files client")?,
        ),
        reporter: Arc::new(TracingReporter),
    };

    let pipeline = Pipeline::new(&settings, storage, collaborators);
    match pipeline.run(shutdown_signal()).await? {
        Exit::Graceful => Ok(()),
        Exit::TimedOut => {
            warn!("Exiting with work still in flight");
            std::process::exit(1);
        }
    }
}

/// Snapshot printed by `status`.
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub checkpoint: Checkpoint,
    pub production_records: u64,
    pub bootstrap_records: u64,
    pub bootstrap_queue: u64,
    pub watch_queue: u64,
    pub not_found: u64,
}

/// Read the checkpoint and index counts without changing anything.
pub async fn read_status(storage: Arc<Storage>, settings: &Settings) -> Result<StatusReport> {
    let store = CheckpointStore::new(storage.clone(), false);
    let checkpoint = store.get().await.context("Failed to read checkpoint")?;
    let index = LocalIndex::new(storage);
    let indices = &settings.indices;

    Ok(StatusReport {
        checkpoint,
        production_records: index.count(&indices.production).await?,
        bootstrap_records: index.count(&indices.bootstrap).await?,
        bootstrap_queue: index.count(&indices.bootstrap_queue).await?,
        watch_queue: index.count(&indices.watch_queue).await?,
        not_found: index.count(&indices.not_found).await?,
    })
}

/// Show checkpoint and bookkeeping state.
pub async fn show_status(overrides: Overrides<'_>) -> Result<()> {
    let settings = load_settings(&overrides)?;
    let storage = open_storage(&settings)
        .context("Database unavailable (is the daemon running?)")?;
    let report = read_status(storage, &settings).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Persist the zero checkpoint.
pub async fn reset_checkpoint(storage: Arc<Storage>) -> Result<Checkpoint> {
    let store = CheckpointStore::new(storage, false);
    store.reset().await.context("Failed to reset checkpoint")
}

/// Reset the checkpoint so the next start bootstraps again.
pub async fn reset(overrides: Overrides<'_>) -> Result<()> {
    let settings = load_settings(&overrides)?;
    let storage = open_storage(&settings)
        .context("Database unavailable (is the daemon running?)")?;
    reset_checkpoint(storage).await?;
    println!("Checkpoint reset; the next start runs a full bootstrap");
    Ok(())
}
