//! Downstream delivery of processed canvases.
//!
//! The pipeline's output side is a trait so deployments can plug in whatever
//! transport they need. Delivery failures are reported to the caller, who
//! logs and carries on; a broken sink never stops the pipeline.

use std::sync::Mutex;

use anyhow::Result;

use crate::frame::Nv12Frame;

/// Destination for processed canvases, keyed by a loader-owned endpoint.
pub trait FrameSink: Send + Sync {
    fn push_frame(&self, endpoint: &str, frame: &Nv12Frame) -> Result<()>;
}

/// Discards everything; the default when no transport is wired up.
pub struct NullSink;

impl FrameSink for NullSink {
    fn push_frame(&self, endpoint: &str, frame: &Nv12Frame) -> Result<()> {
        log::debug!(
            "dropping canvas for {}: {}x{} ts={}",
            endpoint,
            frame.width,
            frame.height,
            frame.timestamp_ms
        );
        Ok(())
    }
}

/// Collects pushed canvases in memory for inspection in tests.
#[derive(Default)]
pub struct InMemorySink {
    frames: Mutex<Vec<(String, Nv12Frame)>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<(String, Nv12Frame)> {
        self.frames
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.frames
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FrameSink for InMemorySink {
    fn push_frame(&self, endpoint: &str, frame: &Nv12Frame) -> Result<()> {
        self.frames
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((endpoint.to_string(), frame.clone()));
        Ok(())
    }
}
