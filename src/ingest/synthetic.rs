//! Synthetic frame source for `stub://` URIs.
//!
//! Generates a moving gradient pattern at a fixed rate. Used by tests and by
//! demo configurations that have no real cameras attached.

use std::time::Duration;

use anyhow::Result;
use rand::Rng;

use crate::frame::{now_ms, Nv12Frame};

use super::{FrameSource, SourceEvent, StreamInfo};

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const FRAME_INTERVAL: Duration = Duration::from_millis(33);

/// In-process frame generator.
pub struct SyntheticSource {
    uri: String,
    forced: Option<(u32, u32)>,
    width: u32,
    height: u32,
    frame_count: u64,
    started: bool,
}

impl SyntheticSource {
    pub fn new(uri: &str, forced: Option<(u32, u32)>) -> Self {
        Self {
            uri: uri.to_string(),
            forced,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            frame_count: 0,
            started: false,
        }
    }

    fn generate_frame(&mut self) -> Nv12Frame {
        self.frame_count += 1;

        let (w, h) = (self.width as usize, self.height as usize);
        let phase = self.frame_count as usize;
        let noise: u8 = rand::thread_rng().gen();

        // Scrolling diagonal gradient; noise keeps consecutive frames distinct.
        let mut y = vec![0u8; w * h];
        for row in 0..h {
            for col in 0..w {
                y[row * w + col] = ((row + col + phase) % 256) as u8 ^ (noise & 0x07);
            }
        }
        let uv = vec![128u8; w * h / 2];

        Nv12Frame::new(y, uv, self.width, self.height, now_ms())
    }
}

impl FrameSource for SyntheticSource {
    fn probe(&mut self) -> Result<StreamInfo> {
        let (width, height) = self.forced.unwrap_or((DEFAULT_WIDTH, DEFAULT_HEIGHT));
        log::debug!("synthetic probe ok for {} ({}x{})", self.uri, width, height);
        Ok(StreamInfo {
            width,
            height,
            codec: Some("rawvideo".to_string()),
        })
    }

    fn start(&mut self, info: &StreamInfo) -> Result<()> {
        self.width = info.width;
        self.height = info.height;
        self.started = true;
        Ok(())
    }

    fn read(&mut self, _timeout: Duration) -> Result<SourceEvent> {
        if !self.started {
            anyhow::bail!("synthetic source read before start");
        }
        // Pace the generator roughly like a 30 fps camera.
        std::thread::sleep(FRAME_INTERVAL);
        Ok(SourceEvent::Frame(self.generate_frame()))
    }

    fn stop(&mut self) {
        self.started = false;
    }
}
