//! ffmpeg subprocess frame source.
//!
//! Probes the stream with `ffprobe` (JSON output), then spawns `ffmpeg`
//! decoding to raw NV12 on stdout. A dedicated reader thread blocks on the
//! pipe and hands whole frames over a bounded channel, which gives `read` a
//! real timeout without non-blocking I/O on the pipe itself.
//!
//! RTSP inputs are pinned to TCP transport with low-delay flags; everything
//! else (files, HTTP) is passed through untouched.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::frame::{now_ms, Nv12Frame};

use super::{FrameSource, SourceEvent, StreamInfo};

/// How long to wait for the child to exit after a graceful signal.
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// ffmpeg subprocess source.
pub struct FfmpegSource {
    uri: String,
    forced: Option<(u32, u32)>,
    active: Option<ActiveDecode>,
}

struct ActiveDecode {
    child: Child,
    frames: Receiver<ReaderMsg>,
    reader: Option<JoinHandle<()>>,
    width: u32,
    height: u32,
}

enum ReaderMsg {
    Frame(Vec<u8>),
    Ended,
}

impl FfmpegSource {
    pub fn new(uri: &str, forced: Option<(u32, u32)>) -> Self {
        Self {
            uri: uri.to_string(),
            forced,
            active: None,
        }
    }
}

impl FrameSource for FfmpegSource {
    fn probe(&mut self) -> Result<StreamInfo> {
        let output = Command::new("ffprobe")
            .args(probe_args(&self.uri))
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .context("spawn ffprobe")?;
        if !output.status.success() {
            return Err(anyhow!("ffprobe exited with {}", output.status));
        }

        let probe: ProbeOutput =
            serde_json::from_slice(&output.stdout).context("parse ffprobe output")?;
        let video = probe
            .streams
            .into_iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
            .ok_or_else(|| anyhow!("no video stream found in {}", self.uri))?;

        let (probed_w, probed_h) = match (video.width, video.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
            _ => return Err(anyhow!("probe reported no dimensions for {}", self.uri)),
        };
        let (width, height) = self.forced.unwrap_or((probed_w, probed_h));

        Ok(StreamInfo {
            width,
            height,
            codec: video.codec_name,
        })
    }

    fn start(&mut self, info: &StreamInfo) -> Result<()> {
        // A previous decode may still be around after a failure.
        self.stop();

        let frame_size = Nv12Frame::byte_size(info.width, info.height);
        let mut child = Command::new("ffmpeg")
            .args(decode_args(&self.uri, info.width, info.height))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("spawn ffmpeg")?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("ffmpeg stdout missing"))?;
        let (tx, rx) = mpsc::sync_channel(1);
        let reader = std::thread::spawn(move || read_frames(stdout, frame_size, tx));

        self.active = Some(ActiveDecode {
            child,
            frames: rx,
            reader: Some(reader),
            width: info.width,
            height: info.height,
        });
        log::info!(
            "ffmpeg decode started for {} at {}x{}",
            self.uri,
            info.width,
            info.height
        );
        Ok(())
    }

    fn read(&mut self, timeout: Duration) -> Result<SourceEvent> {
        let active = self
            .active
            .as_ref()
            .ok_or_else(|| anyhow!("ffmpeg source read before start"))?;

        match active.frames.recv_timeout(timeout) {
            Ok(ReaderMsg::Frame(buffer)) => {
                let luma_len = (active.width * active.height) as usize;
                let uv = buffer[luma_len..].to_vec();
                let mut y = buffer;
                y.truncate(luma_len);
                Ok(SourceEvent::Frame(Nv12Frame::new(
                    y,
                    uv,
                    active.width,
                    active.height,
                    now_ms(),
                )))
            }
            Ok(ReaderMsg::Ended) | Err(RecvTimeoutError::Disconnected) => Ok(SourceEvent::Ended),
            Err(RecvTimeoutError::Timeout) => Ok(SourceEvent::Stalled),
        }
    }

    fn stop(&mut self) {
        let Some(mut active) = self.active.take() else {
            return;
        };

        terminate_child(&mut active.child, &self.uri);
        // The reader unblocks once the pipe closes.
        if let Some(reader) = active.reader.take() {
            let _ = reader.join();
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Blocking pipe reader: ships whole NV12 frames until EOF or a short read.
fn read_frames(mut stdout: impl Read, frame_size: usize, tx: SyncSender<ReaderMsg>) {
    loop {
        let mut buffer = vec![0u8; frame_size];
        match stdout.read_exact(&mut buffer) {
            Ok(()) => {
                if tx.send(ReaderMsg::Frame(buffer)).is_err() {
                    return; // consumer gone
                }
            }
            Err(_) => {
                let _ = tx.send(ReaderMsg::Ended);
                return;
            }
        }
    }
}

/// Graceful-then-forced child termination.
fn terminate_child(child: &mut Child, uri: &str) {
    #[cfg(unix)]
    {
        unsafe {
            libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
        }
        let deadline = Instant::now() + TERMINATE_GRACE;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => std::thread::sleep(Duration::from_millis(20)),
                Err(_) => break,
            }
        }
    }

    if let Err(e) = child.kill() {
        log::debug!("ffmpeg for {} already exited: {}", uri, e);
    }
    let _ = child.wait();
}

fn is_rtsp(uri: &str) -> bool {
    uri.starts_with("rtsp://") || uri.starts_with("rtsps://")
}

fn probe_args(uri: &str) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-v".into(),
        "error".into(),
        "-print_format".into(),
        "json".into(),
        "-show_streams".into(),
    ];
    if is_rtsp(uri) {
        args.extend(["-rtsp_transport".into(), "tcp".into()]);
    }
    args.push(uri.into());
    args
}

fn decode_args(uri: &str, width: u32, height: u32) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
    if is_rtsp(uri) {
        args.extend([
            "-rtsp_transport".into(),
            "tcp".into(),
            "-fflags".into(),
            "nobuffer".into(),
            "-flags".into(),
            "low_delay".into(),
        ]);
    }
    args.extend([
        "-i".into(),
        uri.into(),
        "-an".into(),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "nv12".into(),
        "-s".into(),
        format!("{}x{}", width, height),
        "pipe:1".into(),
    ]);
    args
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}
