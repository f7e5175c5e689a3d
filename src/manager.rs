//! Pipeline registries and lifecycle orchestration.
//!
//! `PipelineManager` owns the stream and loader registries behind one lock
//! and enforces the registry rules: unique names, a hard loader limit, and
//! exclusive stream claims (each stream feeds at most one loader, though it
//! may fill several cells of that loader's grid). It also persists and
//! restores the pipeline document as JSON.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};

use crate::config::PipelineConfigFile;
use crate::detect::InferenceEngine;
use crate::loader::{Loader, LoaderSpec, LoaderStatus};
use crate::sink::FrameSink;
use crate::stream::{StreamHandle, StreamSpec, StreamStatus};

/// Hard cap on concurrent loaders; mirrors the accelerator's core count.
pub const MAX_LOADERS: usize = 3;

/// Builds one engine instance per loader start.
pub type EngineFactory = Box<dyn Fn(&LoaderSpec) -> Result<Box<dyn InferenceEngine>> + Send + Sync>;

struct LoaderEntry {
    loader: Loader,
    /// Accelerator core-affinity mask, fixed at creation.
    core_mask: u32,
}

#[derive(Default)]
struct Registries {
    streams: HashMap<String, StreamHandle>,
    loaders: HashMap<String, LoaderEntry>,
}

pub struct PipelineManager {
    inner: Mutex<Registries>,
    engine_factory: EngineFactory,
    sink: Arc<dyn FrameSink>,
    save_path: PathBuf,
    queue_capacity: usize,
}

impl PipelineManager {
    pub fn new(
        engine_factory: EngineFactory,
        sink: Arc<dyn FrameSink>,
        save_path: PathBuf,
        queue_capacity: usize,
    ) -> Self {
        Self {
            inner: Mutex::new(Registries::default()),
            engine_factory,
            sink,
            save_path,
            queue_capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registries> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ------------------------------------------------------------------------
    // Stream registry
    // ------------------------------------------------------------------------

    pub fn add_stream(&self, spec: StreamSpec) -> Result<()> {
        if spec.name.is_empty() {
            return Err(anyhow!("stream name must not be empty"));
        }
        let mut inner = self.lock();
        if inner.streams.contains_key(&spec.name) {
            return Err(anyhow!("stream {} already exists", spec.name));
        }
        let name = spec.name.clone();
        inner
            .streams
            .insert(name.clone(), StreamHandle::new(spec, self.queue_capacity));
        log::info!("stream {} added", name);
        Ok(())
    }

    /// Remove a stream; rejected while a loader's grid references it.
    pub fn remove_stream(&self, name: &str) -> Result<()> {
        let mut inner = self.lock();
        if let Some(owner) = claiming_loader(&inner, name) {
            return Err(anyhow!("stream {} is used by loader {}", name, owner));
        }
        let mut handle = inner
            .streams
            .remove(name)
            .ok_or_else(|| anyhow!("stream {} not found", name))?;
        drop(inner);
        handle.stop();
        log::info!("stream {} removed", name);
        Ok(())
    }

    /// Replace a stream's spec. The worker is stopped for the swap and
    /// restarted afterwards if it was alive.
    pub fn update_stream(&self, spec: StreamSpec) -> Result<()> {
        let mut inner = self.lock();
        let handle = inner
            .streams
            .get_mut(&spec.name)
            .ok_or_else(|| anyhow!("stream {} not found", spec.name))?;

        let was_alive = handle.is_alive();
        handle.stop();
        *handle.spec_mut()? = spec;
        if was_alive {
            handle.start();
        }
        Ok(())
    }

    pub fn start_stream(&self, name: &str) -> Result<()> {
        let mut inner = self.lock();
        let handle = inner
            .streams
            .get_mut(name)
            .ok_or_else(|| anyhow!("stream {} not found", name))?;
        handle.start();
        Ok(())
    }

    pub fn stop_stream(&self, name: &str) -> Result<()> {
        let mut inner = self.lock();
        let handle = inner
            .streams
            .get_mut(name)
            .ok_or_else(|| anyhow!("stream {} not found", name))?;
        handle.stop();
        Ok(())
    }

    pub fn stream_status(&self, name: &str) -> Result<StreamStatus> {
        let inner = self.lock();
        inner
            .streams
            .get(name)
            .map(StreamHandle::status)
            .ok_or_else(|| anyhow!("stream {} not found", name))
    }

    pub fn list_streams(&self) -> Vec<StreamStatus> {
        let inner = self.lock();
        let mut statuses: Vec<StreamStatus> =
            inner.streams.values().map(StreamHandle::status).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    // ------------------------------------------------------------------------
    // Loader registry
    // ------------------------------------------------------------------------

    pub fn create_loader(&self, spec: LoaderSpec) -> Result<()> {
        spec.validate()?;
        let mut inner = self.lock();
        if inner.loaders.contains_key(&spec.name) {
            return Err(anyhow!("loader {} already exists", spec.name));
        }
        if inner.loaders.len() >= MAX_LOADERS {
            return Err(anyhow!("loader limit reached ({})", MAX_LOADERS));
        }
        for stream in grid_streams(&spec) {
            if let Some(owner) = claiming_loader(&inner, stream) {
                return Err(anyhow!(
                    "stream {} is already claimed by loader {}",
                    stream,
                    owner
                ));
            }
        }

        let core_mask = free_core_mask(&inner);
        let name = spec.name.clone();
        inner.loaders.insert(
            name.clone(),
            LoaderEntry {
                loader: Loader::new(spec),
                core_mask,
            },
        );
        log::info!("loader {} created (core mask {:#x})", name, core_mask);
        Ok(())
    }

    pub fn delete_loader(&self, name: &str) -> Result<()> {
        let mut inner = self.lock();
        let mut entry = inner
            .loaders
            .remove(name)
            .ok_or_else(|| anyhow!("loader {} not found", name))?;
        drop(inner);
        entry.loader.stop();
        log::info!("loader {} deleted", name);
        Ok(())
    }

    /// Replace a loader's spec. The workers are stopped for the swap and
    /// restarted afterwards if they were alive.
    pub fn update_loader(&self, spec: LoaderSpec) -> Result<()> {
        spec.validate()?;
        let was_alive = {
            let mut inner = self.lock();
            if !inner.loaders.contains_key(&spec.name) {
                return Err(anyhow!("loader {} not found", spec.name));
            }
            for stream in grid_streams(&spec) {
                if let Some(owner) = claiming_loader(&inner, stream) {
                    if owner != spec.name {
                        return Err(anyhow!(
                            "stream {} is already claimed by loader {}",
                            stream,
                            owner
                        ));
                    }
                }
            }
            let entry = inner
                .loaders
                .get_mut(&spec.name)
                .ok_or_else(|| anyhow!("loader {} not found", spec.name))?;
            let was_alive = entry.loader.is_alive();
            entry.loader.stop();
            let core_mask = entry.core_mask;
            *entry = LoaderEntry {
                loader: Loader::new(spec.clone()),
                core_mask,
            };
            was_alive
        };
        if was_alive {
            self.start_loader(&spec.name)?;
        }
        Ok(())
    }

    /// Start a loader; every stream its grid names must be registered.
    pub fn start_loader(&self, name: &str) -> Result<()> {
        let mut inner = self.lock();
        let entry = inner
            .loaders
            .get(name)
            .ok_or_else(|| anyhow!("loader {} not found", name))?;
        let spec = entry.loader.spec().clone();
        let core_mask = entry.core_mask;

        let mut names: Vec<&str> = grid_streams(&spec).collect();
        names.sort_unstable();
        names.dedup();
        let mut views = Vec::new();
        for stream in names {
            let handle = inner
                .streams
                .get(stream)
                .ok_or_else(|| anyhow!("loader {}: stream {} not registered", name, stream))?;
            views.push(handle.view());
        }

        let engine = (self.engine_factory)(&spec)
            .with_context(|| format!("loader {}: engine construction failed", name))?;
        let entry = inner
            .loaders
            .get_mut(name)
            .ok_or_else(|| anyhow!("loader {} not found", name))?;
        entry
            .loader
            .start(views, engine, Arc::clone(&self.sink), core_mask)
    }

    pub fn stop_loader(&self, name: &str) -> Result<()> {
        let mut inner = self.lock();
        let entry = inner
            .loaders
            .get_mut(name)
            .ok_or_else(|| anyhow!("loader {} not found", name))?;
        entry.loader.stop();
        Ok(())
    }

    pub fn loader_status(&self, name: &str) -> Result<LoaderStatus> {
        let inner = self.lock();
        inner
            .loaders
            .get(name)
            .map(|entry| entry.loader.status())
            .ok_or_else(|| anyhow!("loader {} not found", name))
    }

    pub fn list_loaders(&self) -> Vec<LoaderStatus> {
        let inner = self.lock();
        let mut statuses: Vec<LoaderStatus> = inner
            .loaders
            .values()
            .map(|entry| entry.loader.status())
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    // ------------------------------------------------------------------------
    // Bulk lifecycle
    // ------------------------------------------------------------------------

    /// Start every stream, then every loader. Individual loader failures are
    /// logged and do not abort the rest.
    pub fn start_all(&self) {
        let names: Vec<String> = {
            let mut inner = self.lock();
            for handle in inner.streams.values_mut() {
                handle.start();
            }
            inner.loaders.keys().cloned().collect()
        };
        for name in names {
            if let Err(e) = self.start_loader(&name) {
                log::error!("loader {} failed to start: {:#}", name, e);
            }
        }
    }

    pub fn stop_all(&self) {
        let mut inner = self.lock();
        for entry in inner.loaders.values_mut() {
            entry.loader.stop();
        }
        for handle in inner.streams.values_mut() {
            handle.stop();
        }
    }

    // ------------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------------

    /// Write the pipeline document to the configured save path.
    pub fn save(&self) -> Result<()> {
        let document = {
            let inner = self.lock();
            let mut streams: Vec<StreamSpec> = inner
                .streams
                .values()
                .map(|handle| handle.spec().clone())
                .collect();
            streams.sort_by(|a, b| a.name.cmp(&b.name));
            let mut loaders: Vec<LoaderSpec> = inner
                .loaders
                .values()
                .map(|entry| entry.loader.spec().clone())
                .collect();
            loaders.sort_by(|a, b| a.name.cmp(&b.name));
            PipelineConfigFile { streams, loaders }
        };

        let raw = serde_json::to_string_pretty(&document)?;
        fs::write(&self.save_path, raw)
            .with_context(|| format!("writing pipeline to {}", self.save_path.display()))?;
        log::info!("pipeline saved to {}", self.save_path.display());
        Ok(())
    }

    /// Load stream and loader records from a pipeline document. Records that
    /// fail validation are logged and skipped, never fatal.
    pub fn load(&self, path: &Path) -> Result<()> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading pipeline from {}", path.display()))?;
        let document: PipelineConfigFile = serde_json::from_str(&raw)
            .with_context(|| format!("parsing pipeline from {}", path.display()))?;

        for spec in document.streams {
            let name = spec.name.clone();
            if let Err(e) = self.add_stream(spec) {
                log::warn!("skipping stream record {}: {:#}", name, e);
            }
        }
        for spec in document.loaders {
            let name = spec.name.clone();
            if let Err(e) = self.create_loader(spec) {
                log::warn!("skipping loader record {}: {:#}", name, e);
            }
        }
        Ok(())
    }
}

/// Lowest accelerator core bit not held by an existing loader.
fn free_core_mask(inner: &Registries) -> u32 {
    let used = inner
        .loaders
        .values()
        .fold(0u32, |acc, entry| acc | entry.core_mask);
    let mut mask = 1u32;
    while mask & used != 0 {
        mask <<= 1;
    }
    mask
}

/// Name of the loader whose grid references `stream`, if any.
fn claiming_loader<'a>(inner: &'a Registries, stream: &str) -> Option<&'a str> {
    inner
        .loaders
        .iter()
        .find(|(_, entry)| grid_streams(entry.loader.spec()).any(|s| s == stream))
        .map(|(name, _)| name.as_str())
}

fn grid_streams(spec: &LoaderSpec) -> impl Iterator<Item = &str> {
    spec.grid
        .iter()
        .flatten()
        .map(String::as_str)
        .filter(|s| !s.is_empty())
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::StubEngine;
    use crate::sink::InMemorySink;
    use crate::stream::DEFAULT_RECONNECT_INTERVAL_SECS;
    use crate::sync::SyncMode;

    fn manager(save_path: PathBuf) -> PipelineManager {
        PipelineManager::new(
            Box::new(|_| Ok(Box::new(StubEngine::new()) as Box<dyn InferenceEngine>)),
            Arc::new(InMemorySink::new()),
            save_path,
            4,
        )
    }

    fn stream_spec(name: &str) -> StreamSpec {
        StreamSpec {
            name: name.to_string(),
            uri: format!("stub://{}", name),
            width: None,
            height: None,
            reconnect_interval_secs: DEFAULT_RECONNECT_INTERVAL_SECS,
        }
    }

    fn loader_spec(name: &str, streams: &[&str]) -> LoaderSpec {
        LoaderSpec {
            name: name.to_string(),
            grid: vec![streams.iter().map(|s| s.to_string()).collect()],
            canvas: 64,
            weights: "model.bin".to_string(),
            classes: None,
            sink_endpoint: format!("mem://{}", name),
            confidence_threshold: 0.5,
            iou_threshold: 0.5,
            sync: SyncMode::TakeLatest,
            max_delta_ms: 200,
        }
    }

    fn tmp_path() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.json");
        (dir, path)
    }

    #[test]
    fn duplicate_stream_names_are_rejected() {
        let (_dir, path) = tmp_path();
        let mgr = manager(path);
        mgr.add_stream(stream_spec("a")).unwrap();
        assert!(mgr.add_stream(stream_spec("a")).is_err());
    }

    #[test]
    fn loader_limit_is_enforced() {
        let (_dir, path) = tmp_path();
        let mgr = manager(path);
        for i in 0..MAX_LOADERS {
            mgr.create_loader(loader_spec(&format!("l{}", i), &[&format!("s{}", i)]))
                .unwrap();
        }
        assert!(mgr
            .create_loader(loader_spec("overflow", &["s9"]))
            .is_err());
    }

    #[test]
    fn cross_loader_stream_claims_are_rejected() {
        let (_dir, path) = tmp_path();
        let mgr = manager(path);
        mgr.create_loader(loader_spec("l0", &["a", "b"])).unwrap();
        // Same stream twice within one grid is fine (fan-out)...
        mgr.create_loader(loader_spec("l1", &["c", "c"])).unwrap();
        // ...but another loader may not claim an already-claimed stream.
        assert!(mgr.create_loader(loader_spec("l2", &["b"])).is_err());
    }

    #[test]
    fn claimed_streams_cannot_be_removed() {
        let (_dir, path) = tmp_path();
        let mgr = manager(path);
        mgr.add_stream(stream_spec("a")).unwrap();
        mgr.create_loader(loader_spec("l0", &["a"])).unwrap();

        assert!(mgr.remove_stream("a").is_err());
        mgr.delete_loader("l0").unwrap();
        mgr.remove_stream("a").unwrap();
    }

    #[test]
    fn starting_a_loader_requires_registered_streams() {
        let (_dir, path) = tmp_path();
        let mgr = manager(path);
        mgr.create_loader(loader_spec("l0", &["ghost"])).unwrap();
        assert!(mgr.start_loader("l0").is_err());
    }

    #[test]
    fn save_and_load_round_trip() {
        let (_dir, path) = tmp_path();
        let mgr = manager(path.clone());
        mgr.add_stream(stream_spec("a")).unwrap();
        mgr.add_stream(stream_spec("b")).unwrap();
        mgr.create_loader(loader_spec("l0", &["a", "b"])).unwrap();
        mgr.save().unwrap();

        let restored = manager(path.clone());
        restored.load(&path).unwrap();
        assert_eq!(restored.list_streams().len(), 2);
        assert_eq!(restored.list_loaders().len(), 1);
        assert_eq!(
            restored.loader_status("l0").unwrap().sink_endpoint,
            "mem://l0"
        );
    }

    #[test]
    fn load_skips_invalid_records() {
        let (_dir, path) = tmp_path();
        // Second loader claims a stream the first already holds.
        let document = r#"{
            "streams": [{"name": "a", "uri": "stub://a"}],
            "loaders": [
                {"name": "l0", "grid": [["a"]], "canvas": 64,
                 "weights": "m.bin", "sink_endpoint": "mem://l0"},
                {"name": "l1", "grid": [["a"]], "canvas": 64,
                 "weights": "m.bin", "sink_endpoint": "mem://l1"}
            ]
        }"#;
        fs::write(&path, document).unwrap();

        let mgr = manager(path.clone());
        mgr.load(&path).unwrap();
        assert_eq!(mgr.list_loaders().len(), 1);
        assert_eq!(mgr.list_streams().len(), 1);
    }

    #[test]
    fn core_masks_stay_distinct_across_delete_and_create() {
        let (_dir, path) = tmp_path();
        let mgr = manager(path);
        mgr.create_loader(loader_spec("l0", &["a"])).unwrap();
        mgr.create_loader(loader_spec("l1", &["b"])).unwrap();
        mgr.delete_loader("l0").unwrap();
        mgr.create_loader(loader_spec("l2", &["c"])).unwrap();

        let inner = mgr.lock();
        let mut masks: Vec<u32> = inner.loaders.values().map(|e| e.core_mask).collect();
        masks.sort_unstable();
        // l2 reuses the bit l0 released; no two loaders share a core.
        assert_eq!(masks, vec![0x1, 0x2]);
    }

    #[test]
    fn update_loader_keeps_its_own_claims_but_not_others() {
        let (_dir, path) = tmp_path();
        let mgr = manager(path);
        mgr.create_loader(loader_spec("l0", &["a"])).unwrap();
        mgr.create_loader(loader_spec("l1", &["b"])).unwrap();

        // Reshaping around its own stream is fine.
        mgr.update_loader(loader_spec("l0", &["a", "a"])).unwrap();
        // Grabbing another loader's stream is not.
        assert!(mgr.update_loader(loader_spec("l0", &["b"])).is_err());
    }

    #[test]
    fn update_stream_restarts_a_running_worker() {
        let (_dir, path) = tmp_path();
        let mgr = manager(path);
        mgr.add_stream(stream_spec("a")).unwrap();
        mgr.start_stream("a").unwrap();
        assert!(mgr.stream_status("a").unwrap().is_alive);

        let mut updated = stream_spec("a");
        updated.uri = "stub://elsewhere".to_string();
        mgr.update_stream(updated).unwrap();

        let status = mgr.stream_status("a").unwrap();
        assert_eq!(status.uri, "stub://elsewhere");
        assert!(status.is_alive);
        mgr.stop_all();
    }
}
