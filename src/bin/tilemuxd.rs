//! tilemuxd - frame synchronization and tiled-batch inference daemon
//!
//! 1. Loads daemon settings and the persisted pipeline document
//! 2. Starts every registered stream worker and loader
//! 3. Logs a periodic status summary
//! 4. Saves the pipeline and shuts everything down on SIGINT/SIGTERM

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;

use tilemux::{
    DaemonConfig, EngineFactory, InferenceEngine, NullSink, PipelineManager, StubEngine,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-stream tiled-batch inference daemon")]
struct Args {
    /// Path to the daemon config file (JSON).
    #[arg(long, env = "TILEMUX_CONFIG")]
    config: Option<PathBuf>,

    /// Save the pipeline document back to disk on shutdown.
    #[arg(long, env = "TILEMUX_SAVE_ON_EXIT")]
    save_on_exit: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = DaemonConfig::load(args.config.as_deref())?;

    let engine_factory: EngineFactory =
        Box::new(|_spec| Ok(Box::new(StubEngine::new()) as Box<dyn InferenceEngine>));
    let manager = Arc::new(PipelineManager::new(
        engine_factory,
        Arc::new(NullSink),
        cfg.pipeline_path.clone(),
        cfg.queue_capacity,
    ));

    if cfg.pipeline_path.exists() {
        manager
            .load(&cfg.pipeline_path)
            .with_context(|| format!("loading pipeline {}", cfg.pipeline_path.display()))?;
    } else {
        log::warn!(
            "pipeline document {} not found, starting empty",
            cfg.pipeline_path.display()
        );
    }

    manager.start_all();
    log::info!(
        "tilemuxd running: {} streams, {} loaders",
        manager.list_streams().len(),
        manager.list_loaders().len()
    );

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        log::info!("shutdown signal received");
        flag.store(false, Ordering::SeqCst);
    })
    .context("installing signal handler")?;

    let mut last_status = Instant::now();
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_secs(1));

        if last_status.elapsed() >= cfg.status_interval {
            for stream in manager.list_streams() {
                log::info!(
                    "stream {}: state={:?} alive={}",
                    stream.name,
                    stream.state,
                    stream.is_alive
                );
            }
            for loader in manager.list_loaders() {
                log::info!(
                    "loader {}: alive={} queued={}",
                    loader.name,
                    loader.is_alive,
                    loader.queued_batches
                );
            }
            last_status = Instant::now();
        }
    }

    if args.save_on_exit {
        if let Err(e) = manager.save() {
            log::error!("pipeline save failed: {:#}", e);
        }
    }
    manager.stop_all();
    log::info!("tilemuxd stopped");
    Ok(())
}
