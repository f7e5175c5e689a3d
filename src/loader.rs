//! Batch processors: composition plus inference over one tiling grid.
//!
//! A loader owns two worker threads. The composition worker runs the sync
//! strategy over the loader's streams, composes each collected set into a
//! canvas and pushes it into the bounded batch queue. The inference worker
//! drains that queue, runs the engine, decodes and suppresses detections,
//! annotates the canvas and hands it to the sink. A slow engine only costs
//! canvases (the queue evicts the oldest), never ingestion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::detect::{
    annotate_canvas, decode_detections, ClassTable, Detection, InferenceEngine, OutputTensor,
};
use crate::frame::{FrameQueue, Nv12Frame};
use crate::sink::FrameSink;
use crate::stream::StreamView;
use crate::sync::{strategy_for, SyncMode, DEFAULT_MAX_DELTA_MS};
use crate::tile::{GridSpec, TileBatcher};

/// Composed canvases buffered between composition and inference.
const BATCH_QUEUE_CAPACITY: usize = 25;
/// Sleep when the synchronizer has nothing for us this cycle.
const IDLE_BACKOFF: Duration = Duration::from_millis(5);
/// Inference worker's bounded wait for the next canvas.
const BATCH_WAIT: Duration = Duration::from_secs(1);
/// Upper bound on how long `stop` waits for each worker thread.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_IOU_THRESHOLD: f32 = 0.5;

// ----------------------------------------------------------------------------
// Spec
// ----------------------------------------------------------------------------

/// Persisted per-loader record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoaderSpec {
    pub name: String,
    /// Tiling grid as rows of stream names; empty string means empty cell.
    pub grid: Vec<Vec<String>>,
    /// Square canvas side in pixels; must be positive and even.
    pub canvas: u32,
    /// Model weights reference handed to the engine at bind time.
    pub weights: String,
    /// Optional class table JSON path; absent means annotate in gray.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classes: Option<String>,
    /// Sink endpoint the processed canvases are delivered to.
    pub sink_endpoint: String,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_iou_threshold")]
    pub iou_threshold: f32,
    #[serde(default)]
    pub sync: SyncMode,
    #[serde(default = "default_max_delta_ms")]
    pub max_delta_ms: u64,
}

fn default_confidence_threshold() -> f32 {
    DEFAULT_CONFIDENCE_THRESHOLD
}

fn default_iou_threshold() -> f32 {
    DEFAULT_IOU_THRESHOLD
}

fn default_max_delta_ms() -> u64 {
    DEFAULT_MAX_DELTA_MS
}

impl LoaderSpec {
    /// Validate the record and build its grid.
    pub fn validate(&self) -> Result<GridSpec> {
        if self.name.is_empty() {
            return Err(anyhow!("loader name must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(anyhow!(
                "loader {}: confidence threshold {} outside [0, 1]",
                self.name,
                self.confidence_threshold
            ));
        }
        if !(0.0..=1.0).contains(&self.iou_threshold) {
            return Err(anyhow!(
                "loader {}: iou threshold {} outside [0, 1]",
                self.name,
                self.iou_threshold
            ));
        }
        GridSpec::from_matrix(&self.grid, self.canvas)
            .with_context(|| format!("loader {}: invalid grid", self.name))
    }
}

/// Status snapshot returned by the manager's query operations.
#[derive(Clone, Debug, Serialize)]
pub struct LoaderStatus {
    pub name: String,
    pub sink_endpoint: String,
    pub sync: SyncMode,
    pub is_alive: bool,
    pub queued_batches: usize,
}

// ----------------------------------------------------------------------------
// Loader
// ----------------------------------------------------------------------------

pub struct Loader {
    spec: LoaderSpec,
    running: Arc<AtomicBool>,
    batch_queue: Arc<FrameQueue<Nv12Frame>>,
    workers: Vec<JoinHandle<()>>,
}

impl Loader {
    pub fn new(spec: LoaderSpec) -> Self {
        Self {
            spec,
            running: Arc::new(AtomicBool::new(false)),
            batch_queue: Arc::new(FrameQueue::new(BATCH_QUEUE_CAPACITY)),
            workers: Vec::new(),
        }
    }

    pub fn spec(&self) -> &LoaderSpec {
        &self.spec
    }

    pub fn is_alive(&self) -> bool {
        self.workers.iter().any(|w| !w.is_finished())
    }

    pub fn status(&self) -> LoaderStatus {
        LoaderStatus {
            name: self.spec.name.clone(),
            sink_endpoint: self.spec.sink_endpoint.clone(),
            sync: self.spec.sync,
            is_alive: self.is_alive(),
            queued_batches: self.batch_queue.len(),
        }
    }

    /// Start both workers. `streams` are the views this loader's grid names;
    /// `core_mask` selects the accelerator cores the engine binds to.
    pub fn start(
        &mut self,
        streams: Vec<StreamView>,
        mut engine: Box<dyn InferenceEngine>,
        sink: Arc<dyn FrameSink>,
        core_mask: u32,
    ) -> Result<()> {
        if self.is_alive() {
            log::info!("loader {} already running", self.spec.name);
            return Ok(());
        }

        let grid = self.spec.validate()?;
        engine
            .bind(&self.spec.weights, core_mask)
            .with_context(|| format!("loader {}: engine bind failed", self.spec.name))?;
        let classes = match &self.spec.classes {
            Some(path) => ClassTable::load(std::path::Path::new(path))
                .with_context(|| format!("loader {}: class table", self.spec.name))?,
            None => ClassTable::default(),
        };

        self.running.store(true, Ordering::SeqCst);
        self.batch_queue.clear();

        let compose = {
            let running = Arc::clone(&self.running);
            let queue = Arc::clone(&self.batch_queue);
            let strategy = strategy_for(self.spec.sync, self.spec.max_delta_ms);
            let batcher = TileBatcher::new(grid);
            let name = self.spec.name.clone();
            std::thread::spawn(move || {
                composition_loop(&name, &running, &queue, strategy.as_ref(), &batcher, &streams)
            })
        };
        let infer = {
            let running = Arc::clone(&self.running);
            let queue = Arc::clone(&self.batch_queue);
            let spec = self.spec.clone();
            std::thread::spawn(move || inference_loop(&spec, &running, &queue, engine, sink, classes))
        };

        self.workers = vec![compose, infer];
        log::info!("loader {} started", self.spec.name);
        Ok(())
    }

    /// Request stop and join the workers, waiting at most [`JOIN_TIMEOUT`]
    /// per thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        for worker in self.workers.drain(..) {
            let deadline = Instant::now() + JOIN_TIMEOUT;
            while !worker.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(10));
            }
            if worker.is_finished() {
                let _ = worker.join();
            } else {
                log::warn!("loader {} worker did not stop within timeout", self.spec.name);
            }
        }
        self.batch_queue.clear();
    }
}

impl Drop for Loader {
    fn drop(&mut self) {
        self.stop();
    }
}

// ----------------------------------------------------------------------------
// Workers
// ----------------------------------------------------------------------------

fn composition_loop(
    name: &str,
    running: &AtomicBool,
    queue: &FrameQueue<Nv12Frame>,
    strategy: &dyn crate::sync::SyncStrategy,
    batcher: &TileBatcher,
    streams: &[StreamView],
) {
    log::info!("[{}] composition worker started", name);
    while running.load(Ordering::SeqCst) {
        match strategy.collect(streams, running) {
            Some(frames) => {
                if let Some(canvas) = batcher.compose(&frames) {
                    queue.push(canvas);
                }
            }
            None => std::thread::sleep(IDLE_BACKOFF),
        }
    }
    log::info!("[{}] composition worker stopped", name);
}

fn inference_loop(
    spec: &LoaderSpec,
    running: &AtomicBool,
    queue: &FrameQueue<Nv12Frame>,
    mut engine: Box<dyn InferenceEngine>,
    sink: Arc<dyn FrameSink>,
    classes: ClassTable,
) {
    log::info!("[{}] inference worker started", spec.name);
    while running.load(Ordering::SeqCst) {
        let Some(mut canvas) = queue.pop_oldest_timeout(BATCH_WAIT) else {
            continue;
        };

        // An engine error or an empty result drops this cycle's canvas.
        let outputs = match engine.infer(&canvas) {
            Ok(outputs) if !outputs.is_empty() => outputs,
            Ok(_) => {
                log::warn!("[{}] engine returned no output, dropping canvas", spec.name);
                continue;
            }
            Err(e) => {
                log::error!("[{}] inference failed, dropping canvas: {:#}", spec.name, e);
                continue;
            }
        };

        // Decode/draw failures only degrade: the frame is still forwarded,
        // unannotated if need be.
        match decode_outputs(spec, &outputs, &canvas) {
            Ok(detections) => {
                if let Err(e) = annotate_canvas(&mut canvas, &detections, &classes) {
                    log::error!("[{}] annotation failed: {:#}", spec.name, e);
                }
            }
            Err(e) => {
                log::error!("[{}] detection decode failed: {:#}", spec.name, e);
            }
        }

        if let Err(e) = sink.push_frame(&spec.sink_endpoint, &canvas) {
            log::error!("[{}] sink delivery failed: {:#}", spec.name, e);
        }
    }
    log::info!("[{}] inference worker stopped", spec.name);
}

fn decode_outputs(
    spec: &LoaderSpec,
    outputs: &[OutputTensor],
    canvas: &Nv12Frame,
) -> Result<Vec<Detection>> {
    let mut detections = Vec::new();
    for output in outputs {
        detections.extend(decode_detections(
            output,
            spec.confidence_threshold,
            spec.iou_threshold,
            canvas.width,
            canvas.height,
        )?);
    }
    Ok(detections)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{OutputTensor, StubEngine};
    use crate::frame::now_ms;
    use crate::sink::InMemorySink;
    use crate::stream::StreamState;

    fn spec(sync: SyncMode) -> LoaderSpec {
        LoaderSpec {
            name: "batch0".to_string(),
            grid: vec![vec!["a".to_string()]],
            canvas: 64,
            weights: "model.bin".to_string(),
            classes: None,
            sink_endpoint: "mem://out".to_string(),
            confidence_threshold: 0.5,
            iou_threshold: 0.5,
            sync,
            max_delta_ms: 200,
        }
    }

    fn wait_for_frames(sink: &InMemorySink, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if sink.len() >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn validate_rejects_bad_thresholds_and_grids() {
        let mut s = spec(SyncMode::TakeLatest);
        assert!(s.validate().is_ok());

        s.confidence_threshold = 1.5;
        assert!(s.validate().is_err());

        s.confidence_threshold = 0.5;
        s.canvas = 63; // odd canvas breaks chroma subsampling
        assert!(s.validate().is_err());
    }

    #[test]
    fn composes_annotates_and_delivers() {
        let view = StreamView::for_tests("a", 4, StreamState::Running);
        view.queue().push(Nv12Frame::filled(64, 64, 50, 128, now_ms()));

        // One anchor, two classes: a confident box around the canvas center
        // (normalized coords; on the 64px canvas this is [22,22]..[42,42]).
        let tensor = OutputTensor::new(vec![0.5, 0.5, 0.3125, 0.3125, 0.9, 0.1], 1, 6).unwrap();
        let engine = Box::new(StubEngine::with_outputs(vec![tensor]));
        let sink = Arc::new(InMemorySink::new());

        let mut loader = Loader::new(spec(SyncMode::TakeLatest));
        loader
            .start(vec![view.clone()], engine, Arc::clone(&sink) as Arc<dyn FrameSink>, 0x1)
            .unwrap();
        assert!(wait_for_frames(&sink, 1, Duration::from_secs(3)));
        loader.stop();

        let frames = sink.frames();
        let (endpoint, canvas) = &frames[0];
        assert_eq!(endpoint, "mem://out");
        assert_eq!((canvas.width, canvas.height), (64, 64));
        // Box edge at x1=22,y1=22 drawn in fallback gray over luma 50.
        assert_eq!(canvas.y[22 * 64 + 22], 128);
        // Interior untouched.
        assert_eq!(canvas.y[32 * 64 + 32], 50);
    }

    #[test]
    fn engine_failure_drops_canvas() {
        let view = StreamView::for_tests("a", 4, StreamState::Running);
        view.queue().push(Nv12Frame::filled(64, 64, 50, 128, now_ms()));

        let sink = Arc::new(InMemorySink::new());
        let mut loader = Loader::new(spec(SyncMode::TakeLatest));
        loader
            .start(
                vec![view],
                Box::new(StubEngine::failing()),
                Arc::clone(&sink) as Arc<dyn FrameSink>,
                0x1,
            )
            .unwrap();

        // Give the workers ample time to compose and run the failing engine.
        std::thread::sleep(Duration::from_millis(500));
        loader.stop();
        assert!(sink.is_empty(), "failed inference must not reach the sink");
    }

    #[test]
    fn empty_engine_output_drops_canvas() {
        let view = StreamView::for_tests("a", 4, StreamState::Running);
        view.queue().push(Nv12Frame::filled(64, 64, 50, 128, now_ms()));

        let sink = Arc::new(InMemorySink::new());
        let mut loader = Loader::new(spec(SyncMode::TakeLatest));
        loader
            .start(
                vec![view],
                Box::new(StubEngine::new()),
                Arc::clone(&sink) as Arc<dyn FrameSink>,
                0x1,
            )
            .unwrap();

        std::thread::sleep(Duration::from_millis(500));
        loader.stop();
        assert!(sink.is_empty(), "empty engine output must not reach the sink");
    }

    #[test]
    fn decode_failure_still_forwards_canvas() {
        let view = StreamView::for_tests("a", 4, StreamState::Running);
        view.queue().push(Nv12Frame::filled(64, 64, 50, 128, now_ms()));

        // Malformed tensor: length does not match anchors x stride.
        let bad = OutputTensor {
            data: vec![0.0; 10],
            anchors: 2,
            stride: 6,
        };
        let sink = Arc::new(InMemorySink::new());
        let mut loader = Loader::new(spec(SyncMode::TakeLatest));
        loader
            .start(
                vec![view],
                Box::new(StubEngine::with_outputs(vec![bad])),
                Arc::clone(&sink) as Arc<dyn FrameSink>,
                0x1,
            )
            .unwrap();
        assert!(wait_for_frames(&sink, 1, Duration::from_secs(3)));
        loader.stop();

        // Unannotated: the composed cell keeps its plain source luma.
        let frames = sink.frames();
        assert_eq!(frames[0].1.y[32 * 64 + 32], 50);
    }

    #[test]
    fn stop_is_prompt_even_when_idle() {
        let view = StreamView::for_tests("a", 4, StreamState::Running);
        let sink = Arc::new(InMemorySink::new());
        let mut loader = Loader::new(spec(SyncMode::DeltaAligned));
        loader
            .start(
                vec![view],
                Box::new(StubEngine::new()),
                Arc::clone(&sink) as Arc<dyn FrameSink>,
                0x1,
            )
            .unwrap();
        assert!(loader.is_alive());

        let begun = Instant::now();
        loader.stop();
        assert!(!loader.is_alive());
        assert!(begun.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn start_is_idempotent_while_alive() {
        let view = StreamView::for_tests("a", 4, StreamState::Running);
        let sink: Arc<dyn FrameSink> = Arc::new(InMemorySink::new());
        let mut loader = Loader::new(spec(SyncMode::TakeLatest));
        loader
            .start(vec![view.clone()], Box::new(StubEngine::new()), Arc::clone(&sink), 0x1)
            .unwrap();
        assert!(loader.is_alive());
        loader
            .start(vec![view], Box::new(StubEngine::new()), sink, 0x1)
            .unwrap();
        assert!(loader.is_alive());
        loader.stop();
    }
}
