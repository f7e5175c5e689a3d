//! Daemon configuration and the persisted pipeline document.
//!
//! Daemon settings come from an optional JSON file plus `TILEMUX_*`
//! environment overrides. The pipeline document (streams and loaders) is a
//! separate JSON file managed by [`crate::manager::PipelineManager`].

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::loader::LoaderSpec;
use crate::stream::StreamSpec;

const DEFAULT_PIPELINE_PATH: &str = "pipeline.json";
const DEFAULT_QUEUE_CAPACITY: usize = 25;
const DEFAULT_STATUS_INTERVAL_SECS: u64 = 30;

/// Persisted pipeline document: the full set of stream and loader records.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PipelineConfigFile {
    #[serde(default)]
    pub streams: Vec<StreamSpec>,
    #[serde(default)]
    pub loaders: Vec<LoaderSpec>,
}

#[derive(Debug, Deserialize, Default)]
struct DaemonConfigFile {
    pipeline_path: Option<PathBuf>,
    queue_capacity: Option<usize>,
    status_interval_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Where the pipeline document is loaded from and saved to.
    pub pipeline_path: PathBuf,
    /// Per-stream frame queue capacity.
    pub queue_capacity: usize,
    /// How often the daemon logs a status summary.
    pub status_interval: Duration,
}

impl DaemonConfig {
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let file_cfg = match config_path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: DaemonConfigFile) -> Self {
        Self {
            pipeline_path: file
                .pipeline_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PIPELINE_PATH)),
            queue_capacity: file.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY),
            status_interval: Duration::from_secs(
                file.status_interval_secs
                    .unwrap_or(DEFAULT_STATUS_INTERVAL_SECS),
            ),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("TILEMUX_PIPELINE") {
            if !path.trim().is_empty() {
                self.pipeline_path = PathBuf::from(path);
            }
        }
        if let Ok(capacity) = std::env::var("TILEMUX_QUEUE_CAPACITY") {
            self.queue_capacity = capacity
                .parse()
                .map_err(|_| anyhow!("TILEMUX_QUEUE_CAPACITY must be an integer"))?;
        }
        if let Ok(interval) = std::env::var("TILEMUX_STATUS_INTERVAL_SECS") {
            let seconds: u64 = interval.parse().map_err(|_| {
                anyhow!("TILEMUX_STATUS_INTERVAL_SECS must be an integer number of seconds")
            })?;
            self.status_interval = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(anyhow!("queue capacity must be greater than zero"));
        }
        if self.status_interval.as_secs() == 0 {
            return Err(anyhow!("status interval must be greater than zero"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<DaemonConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
