//! Multi-stream frame synchronization and tiled-batch inference.
//!
//! This crate turns N live video streams into batched inference work for a
//! shared accelerator. Each stream is decoded to raw NV12 by its own worker
//! and buffered in a small bounded queue; a loader collects one coherent
//! frame set across its streams, tiles them letterboxed onto a square
//! canvas, runs the canvas through an inference engine, and delivers the
//! annotated result to a sink.
//!
//! # Module Structure
//!
//! - `frame`: NV12 frame container, bounded evict-oldest queues
//! - `ingest`: frame sources (ffmpeg-decoded URIs, synthetic stub streams)
//! - `stream`: per-stream ingestion workers with probe/reconnect lifecycle
//! - `sync`: cross-stream frame collection strategies
//! - `tile`: letterbox scaling and grid composition
//! - `detect`: inference engine seam, tensor decode, NMS, annotation
//! - `loader`: composition + inference worker pairs
//! - `manager`: registries, lifecycle orchestration, JSON persistence
//! - `sink`: downstream delivery of processed canvases
//! - `config`: daemon configuration

pub mod config;
pub mod detect;
pub mod frame;
pub mod ingest;
pub mod loader;
pub mod manager;
pub mod sink;
pub mod stream;
pub mod sync;
pub mod tile;

pub use config::{DaemonConfig, PipelineConfigFile};
pub use detect::{
    annotate_canvas, box_iou, decode_detections, nms, ClassRecord, ClassTable, Detection,
    InferenceEngine, OutputTensor, StubEngine,
};
pub use frame::{now_ms, FrameQueue, Nv12Frame};
pub use ingest::{create_source, FrameSource, SourceEvent, StreamInfo};
pub use loader::{Loader, LoaderSpec, LoaderStatus};
pub use manager::{EngineFactory, PipelineManager, MAX_LOADERS};
pub use sink::{FrameSink, InMemorySink, NullSink};
pub use stream::{StreamHandle, StreamSpec, StreamState, StreamStatus, StreamView};
pub use sync::{strategy_for, SyncMode, SyncStrategy};
pub use tile::{GridSpec, TileBatcher};
