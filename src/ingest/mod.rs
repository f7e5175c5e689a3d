//! Frame sources.
//!
//! A `FrameSource` turns one stream URI into a sequence of raw NV12 frames.
//! The pipeline core never decodes compressed video itself: decoding is
//! delegated to the source implementation.
//!
//! - `ffmpeg`: production source, spawns an `ffmpeg` subprocess that decodes
//!   the stream to raw NV12 on a pipe (probed with `ffprobe`).
//! - `synthetic`: in-process generator for `stub://` URIs, used by tests and
//!   demo configurations.
//!
//! Sources are driven by exactly one `StreamWorker`; they are not shared.

pub mod ffmpeg;
pub mod synthetic;

use std::time::Duration;

use anyhow::Result;

use crate::frame::Nv12Frame;

pub use ffmpeg::FfmpegSource;
pub use synthetic::SyntheticSource;

/// Metadata reported by a successful probe.
#[derive(Clone, Debug)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    /// Codec hint (e.g. "h264", "hevc"), when the probe can tell.
    pub codec: Option<String>,
}

/// Outcome of one read attempt on a started source.
#[derive(Debug)]
pub enum SourceEvent {
    Frame(Nv12Frame),
    /// No frame arrived within the read timeout.
    Stalled,
    /// The stream ended or the decoder delivered a short read.
    Ended,
}

/// One stream's decode backend.
///
/// Lifecycle: `probe` until it succeeds, `start` with the (possibly
/// dimension-overridden) probe result, then `read` in a loop. `stop` must
/// terminate any underlying process gracefully first, forcefully if needed,
/// and is safe to call at any point.
pub trait FrameSource: Send {
    /// Probe the stream for metadata without starting decode.
    fn probe(&mut self) -> Result<StreamInfo>;

    /// Start decoding at the dimensions in `info`.
    fn start(&mut self, info: &StreamInfo) -> Result<()>;

    /// Read the next frame, waiting at most `timeout`.
    fn read(&mut self, timeout: Duration) -> Result<SourceEvent>;

    /// Terminate the decode backend (graceful, then forced).
    fn stop(&mut self);
}

/// Build the source for a stream URI.
///
/// `stub://` URIs get a synthetic in-process source; everything else goes
/// through the ffmpeg subprocess backend. `forced` dimensions override what
/// the probe reports.
pub fn create_source(uri: &str, forced: Option<(u32, u32)>) -> Box<dyn FrameSource> {
    if uri.starts_with("stub://") {
        Box::new(SyntheticSource::new(uri, forced))
    } else {
        Box::new(FfmpegSource::new(uri, forced))
    }
}
