//! docpipe entry point.
//!
//! One binary, two roles, no arguments:
//!
//! * started plain, it runs the **pool manager**, which re-executes this
//!   same binary once per worker with `DOCPIPE_WORKER_ID` set;
//! * started with `DOCPIPE_WORKER_ID` in the environment, it runs a single
//!   **worker**.
//!
//! All configuration comes from the environment (see `Config`).

use anyhow::{Context, Result};
use docpipe::bus::{Bus, RedisBus};
use docpipe::ledger::{Ledger, PgLedger};
use docpipe::{
    load_vision_model, ArtifactStore, Config, PipelineError, PoolManager, Worker,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = Config::from_env()?;

    match std::env::var("DOCPIPE_WORKER_ID") {
        Ok(id) => {
            let worker_id: u32 = id
                .parse()
                .context("DOCPIPE_WORKER_ID must be a positive integer")?;
            run_worker(worker_id, cfg).await
        }
        Err(_) => run_pool(cfg).await,
    }
}

async fn run_pool(cfg: Config) -> Result<()> {
    info!("docpipe pool manager starting");
    let bus: Arc<dyn Bus> = Arc::new(
        RedisBus::connect(&cfg)
            .await
            .map_err(PipelineError::BusConnect)?,
    );

    let mut manager = PoolManager::new(cfg, bus);
    install_signal_handler(manager.shutdown_handle());
    manager.run().await?;
    Ok(())
}

async fn run_worker(worker_id: u32, cfg: Config) -> Result<()> {
    info!("docpipe worker {worker_id} starting");

    let bus: Arc<dyn Bus> = Arc::new(
        RedisBus::connect(&cfg)
            .await
            .map_err(PipelineError::BusConnect)?,
    );
    let ledger: Arc<dyn Ledger> = Arc::new(
        PgLedger::connect(&cfg.database_url)
            .await
            .map_err(PipelineError::LedgerConnect)?,
    );
    if cfg.s3_bucket.is_empty() {
        anyhow::bail!("DOCPIPE_S3_BUCKET must be set to run workers");
    }
    let store = ArtifactStore::from_env(&cfg.s3_bucket)?;

    // The expensive one-shot model load happens off the async threads.
    let load_cfg = cfg.clone();
    let model = tokio::task::spawn_blocking(move || load_vision_model(&load_cfg))
        .await
        .context("model load task panicked")??;

    let worker = Worker::init(worker_id, cfg, bus, ledger, store, model).await?;
    install_signal_handler(worker.shutdown_handle());
    worker.run().await;
    Ok(())
}

/// SIGTERM/SIGINT clear the running flag; loops notice at their next tick
/// and finish in-flight work before exiting.
#[cfg(unix)]
fn install_signal_handler(flag: Arc<AtomicBool>) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("SIGTERM handler unavailable: {e}");
                return;
            }
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("SIGINT handler unavailable: {e}");
                return;
            }
        };
        tokio::select! {
            _ = term.recv() => info!("SIGTERM received, shutting down"),
            _ = int.recv() => info!("SIGINT received, shutting down"),
        }
        flag.store(false, Ordering::SeqCst);
    });
}

#[cfg(not(unix))]
fn install_signal_handler(flag: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            flag.store(false, Ordering::SeqCst);
        }
    });
}
