//! Per-stream ingestion lifecycle.
//!
//! Each registered stream gets one `StreamWorker` thread that owns the
//! connection state machine:
//!
//! ```text
//! Stopped -> Probing -> Ready -> Running
//!               ^                   |
//!               +----- Failed <-----+   (read timeout / short read)
//! ```
//!
//! Probe failures stay in `Probing` and retry with a fixed backoff,
//! indefinitely while the worker runs. Frames are timestamped at receipt with
//! the local monotonic clock and pushed into the stream's bounded queue.
//! Nothing escapes the worker thread: every failure becomes `Failed` plus a
//! logged error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::frame::{FrameQueue, Nv12Frame};
use crate::ingest::{create_source, FrameSource, SourceEvent};

/// Fixed read timeout: a healthy stream must deliver within this window.
const READ_TIMEOUT: Duration = Duration::from_secs(3);
/// Backoff sleeps are sliced so stop requests are honored promptly.
const STOP_POLL: Duration = Duration::from_millis(250);
/// Upper bound on how long `stop` waits for the worker thread.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_RECONNECT_INTERVAL_SECS: u64 = 5;

// ----------------------------------------------------------------------------
// State and spec
// ----------------------------------------------------------------------------

/// Connection lifecycle state, owned exclusively by the worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    Stopped,
    Probing,
    Ready,
    Running,
    Failed,
}

/// Persisted per-stream record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamSpec {
    pub name: String,
    pub uri: String,
    /// Forced output width; overrides whatever the probe reports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,
}

fn default_reconnect_interval() -> u64 {
    DEFAULT_RECONNECT_INTERVAL_SECS
}

impl StreamSpec {
    fn forced_dimensions(&self) -> Option<(u32, u32)> {
        match (self.width, self.height) {
            (Some(w), Some(h)) => Some((w, h)),
            _ => None,
        }
    }
}

/// Status snapshot returned by the manager's query operations.
#[derive(Clone, Debug, Serialize)]
pub struct StreamStatus {
    pub name: String,
    pub uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    pub reconnect_interval_secs: u64,
    pub state: StreamState,
    pub is_alive: bool,
}

// ----------------------------------------------------------------------------
// Shared worker state
// ----------------------------------------------------------------------------

pub(crate) struct StreamShared {
    running: AtomicBool,
    state: Mutex<StreamState>,
    queue: FrameQueue<Nv12Frame>,
}

impl StreamShared {
    fn new(queue_capacity: usize) -> Self {
        Self {
            running: AtomicBool::new(false),
            state: Mutex::new(StreamState::Stopped),
            queue: FrameQueue::new(queue_capacity),
        }
    }

    pub(crate) fn state(&self) -> StreamState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: StreamState) {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn queue(&self) -> &FrameQueue<Nv12Frame> {
        &self.queue
    }
}

/// Read-only view of one stream for the synchronizer.
#[derive(Clone)]
pub struct StreamView {
    pub name: String,
    shared: Arc<StreamShared>,
}

impl StreamView {
    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    pub fn queue(&self) -> &FrameQueue<Nv12Frame> {
        self.shared.queue()
    }
}

#[cfg(test)]
impl StreamView {
    /// Detached view with a fixed state, for synchronizer tests.
    pub(crate) fn for_tests(name: &str, queue_capacity: usize, state: StreamState) -> Self {
        let shared = Arc::new(StreamShared::new(queue_capacity));
        shared.set_state(state);
        Self {
            name: name.to_string(),
            shared,
        }
    }
}

// ----------------------------------------------------------------------------
// StreamHandle / StreamWorker
// ----------------------------------------------------------------------------

/// Registry entry for one stream: spec, shared state and exactly one queue.
pub struct StreamHandle {
    spec: StreamSpec,
    shared: Arc<StreamShared>,
    worker: Option<JoinHandle<()>>,
}

impl StreamHandle {
    pub fn new(spec: StreamSpec, queue_capacity: usize) -> Self {
        Self {
            spec,
            shared: Arc::new(StreamShared::new(queue_capacity)),
            worker: None,
        }
    }

    pub fn spec(&self) -> &StreamSpec {
        &self.spec
    }

    /// Mutable access to the spec; only valid while the worker is stopped.
    pub fn spec_mut(&mut self) -> Result<&mut StreamSpec> {
        if self.is_alive() {
            return Err(anyhow!(
                "stream {} must be stopped before updating it",
                self.spec.name
            ));
        }
        Ok(&mut self.spec)
    }

    pub fn state(&self) -> StreamState {
        self.shared.state()
    }

    pub fn is_alive(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    pub fn view(&self) -> StreamView {
        StreamView {
            name: self.spec.name.clone(),
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn status(&self) -> StreamStatus {
        StreamStatus {
            name: self.spec.name.clone(),
            uri: self.spec.uri.clone(),
            width: self.spec.width,
            height: self.spec.height,
            reconnect_interval_secs: self.spec.reconnect_interval_secs,
            state: self.state(),
            is_alive: self.is_alive(),
        }
    }

    /// Start the worker thread. Idempotent while the worker is alive.
    pub fn start(&mut self) {
        let spec = self.spec.clone();
        let source = create_source(&spec.uri, spec.forced_dimensions());
        self.start_with_source(source);
    }

    /// Start the worker with an explicit source (tests inject scripted ones).
    pub fn start_with_source(&mut self, source: Box<dyn FrameSource>) {
        if self.is_alive() {
            log::info!("stream {} already running", self.spec.name);
            return;
        }

        self.shared.running.store(true, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        let spec = self.spec.clone();
        self.worker = Some(std::thread::spawn(move || run_loop(shared, spec, source)));
    }

    /// Request stop and join the worker, waiting at most [`JOIN_TIMEOUT`].
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let Some(worker) = self.worker.take() else {
            self.shared.set_state(StreamState::Stopped);
            return;
        };

        let deadline = Instant::now() + JOIN_TIMEOUT;
        while !worker.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if worker.is_finished() {
            let _ = worker.join();
        } else {
            // Detach rather than block forever; the thread exits on its own
            // once the current read call returns.
            log::warn!("stream {} worker did not stop within timeout", self.spec.name);
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

// ----------------------------------------------------------------------------
// Worker loop
// ----------------------------------------------------------------------------

fn run_loop(shared: Arc<StreamShared>, spec: StreamSpec, mut source: Box<dyn FrameSource>) {
    log::info!("[{}] worker started", spec.name);

    while shared.is_running() {
        shared.set_state(StreamState::Probing);

        let Some(info) = probe_until_ready(&shared, &spec, source.as_mut()) else {
            break; // stop requested during probe
        };
        shared.set_state(StreamState::Ready);

        if let Err(e) = source.start(&info) {
            log::error!("[{}] decode start failed: {:#}", spec.name, e);
            shared.set_state(StreamState::Failed);
            backoff(&shared, &spec);
            continue;
        }

        let stopped = receive_frames(&shared, &spec, source.as_mut());
        source.stop();

        if stopped {
            break;
        }
        shared.set_state(StreamState::Failed);
        log::warn!(
            "[{}] reconnecting in {}s",
            spec.name,
            spec.reconnect_interval_secs
        );
        backoff(&shared, &spec);
    }

    source.stop();
    shared.set_state(StreamState::Stopped);
    log::info!("[{}] worker stopped", spec.name);
}

/// Probe with fixed backoff until success or stop. `None` means stop.
fn probe_until_ready(
    shared: &StreamShared,
    spec: &StreamSpec,
    source: &mut dyn FrameSource,
) -> Option<crate::ingest::StreamInfo> {
    while shared.is_running() {
        match source.probe() {
            Ok(mut info) => {
                if let Some((w, h)) = spec.forced_dimensions() {
                    info.width = w;
                    info.height = h;
                }
                log::info!(
                    "[{}] probe ok: {}x{} codec={:?}",
                    spec.name,
                    info.width,
                    info.height,
                    info.codec
                );
                return Some(info);
            }
            Err(e) => {
                log::warn!(
                    "[{}] probe failed, retry in {}s: {:#}",
                    spec.name,
                    spec.reconnect_interval_secs,
                    e
                );
                backoff(shared, spec);
            }
        }
    }
    None
}

/// Read frames until stop (returns true) or failure (returns false).
fn receive_frames(shared: &StreamShared, spec: &StreamSpec, source: &mut dyn FrameSource) -> bool {
    let mut first_frame = true;

    while shared.is_running() {
        match source.read(READ_TIMEOUT) {
            Ok(SourceEvent::Frame(frame)) => {
                if first_frame {
                    first_frame = false;
                    shared.set_state(StreamState::Running);
                    log::info!("[{}] receiving {}x{}", spec.name, frame.width, frame.height);
                }
                shared.queue.push(frame);
            }
            Ok(SourceEvent::Stalled) => {
                log::error!("[{}] frame timeout ({:?})", spec.name, READ_TIMEOUT);
                return false;
            }
            Ok(SourceEvent::Ended) => {
                log::error!("[{}] stream ended or broken", spec.name);
                return false;
            }
            Err(e) => {
                log::error!("[{}] stream error: {:#}", spec.name, e);
                return false;
            }
        }
    }
    true
}

fn backoff(shared: &StreamShared, spec: &StreamSpec) {
    let deadline = Instant::now() + Duration::from_secs(spec.reconnect_interval_secs);
    while shared.is_running() && Instant::now() < deadline {
        std::thread::sleep(STOP_POLL.min(deadline.saturating_duration_since(Instant::now())));
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::now_ms;
    use crate::ingest::StreamInfo;

    /// Scripted source driven by a shared state block the test can inspect.
    struct ScriptedSource {
        script: Arc<Mutex<Script>>,
    }

    #[derive(Default)]
    struct Script {
        /// Number of probes that must fail before one succeeds.
        probe_failures: usize,
        probe_times: Vec<Instant>,
        /// Frames to deliver before reporting a stall; `None` = endless.
        frames_before_stall: Option<usize>,
        frames_delivered: usize,
        stop_calls: usize,
    }

    impl ScriptedSource {
        fn new(script: Arc<Mutex<Script>>) -> Box<dyn FrameSource> {
            Box::new(Self { script })
        }
    }

    impl FrameSource for ScriptedSource {
        fn probe(&mut self) -> Result<StreamInfo> {
            let mut script = self.script.lock().unwrap();
            script.probe_times.push(Instant::now());
            if script.probe_failures > 0 {
                script.probe_failures -= 1;
                return Err(anyhow!("scripted probe failure"));
            }
            Ok(StreamInfo {
                width: 32,
                height: 16,
                codec: Some("h264".to_string()),
            })
        }

        fn start(&mut self, _info: &StreamInfo) -> Result<()> {
            Ok(())
        }

        fn read(&mut self, _timeout: Duration) -> Result<SourceEvent> {
            std::thread::sleep(Duration::from_millis(5));
            let mut script = self.script.lock().unwrap();
            if let Some(limit) = script.frames_before_stall {
                if script.frames_delivered >= limit {
                    return Ok(SourceEvent::Stalled);
                }
            }
            script.frames_delivered += 1;
            Ok(SourceEvent::Frame(Nv12Frame::filled(32, 16, 0, 128, now_ms())))
        }

        fn stop(&mut self) {
            self.script.lock().unwrap().stop_calls += 1;
        }
    }

    fn spec(reconnect_secs: u64) -> StreamSpec {
        StreamSpec {
            name: "cam".to_string(),
            uri: "stub://cam".to_string(),
            width: None,
            height: None,
            reconnect_interval_secs: reconnect_secs,
        }
    }

    fn wait_for(handle: &StreamHandle, state: StreamState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if handle.state() == state {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn frames_flow_into_the_queue() {
        let script = Arc::new(Mutex::new(Script::default()));
        let mut handle = StreamHandle::new(spec(0), 4);
        handle.start_with_source(ScriptedSource::new(Arc::clone(&script)));

        assert!(wait_for(&handle, StreamState::Running, Duration::from_secs(2)));
        let deadline = Instant::now() + Duration::from_secs(2);
        while handle.view().queue().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let frame = handle.view().queue().pop_oldest().expect("frame queued");
        assert_eq!((frame.width, frame.height), (32, 16));

        handle.stop();
        assert_eq!(handle.state(), StreamState::Stopped);
    }

    #[test]
    fn probe_failures_retry_with_backoff() {
        let script = Arc::new(Mutex::new(Script {
            probe_failures: 2,
            ..Script::default()
        }));
        let mut handle = StreamHandle::new(spec(1), 1);

        assert_eq!(handle.state(), StreamState::Stopped);
        let started = Instant::now();
        handle.start_with_source(ScriptedSource::new(Arc::clone(&script)));

        // Two failed probes with one-second backoffs, then ready/running.
        assert!(wait_for(&handle, StreamState::Running, Duration::from_secs(5)));
        assert!(started.elapsed() >= Duration::from_secs(2));

        let probes = script.lock().unwrap().probe_times.clone();
        assert!(probes.len() >= 3, "expected at least 3 probe attempts");
        assert!(probes[1] - probes[0] >= Duration::from_secs(1));
        assert!(probes[2] - probes[1] >= Duration::from_secs(1));

        handle.stop();
    }

    #[test]
    fn read_stall_fails_and_reprobes() {
        let script = Arc::new(Mutex::new(Script {
            frames_before_stall: Some(1),
            ..Script::default()
        }));
        let mut handle = StreamHandle::new(spec(0), 1);
        handle.start_with_source(ScriptedSource::new(Arc::clone(&script)));

        // The worker must cycle Running -> Failed -> Probing -> Running again.
        let deadline = Instant::now() + Duration::from_secs(3);
        while script.lock().unwrap().probe_times.len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(
            script.lock().unwrap().probe_times.len() >= 2,
            "worker should reprobe after a stall"
        );
        // The failing source must have been terminated before the reprobe.
        assert!(script.lock().unwrap().stop_calls >= 1);

        handle.stop();
    }

    #[test]
    fn start_is_idempotent_while_alive() {
        let script = Arc::new(Mutex::new(Script::default()));
        let mut handle = StreamHandle::new(spec(0), 1);
        handle.start_with_source(ScriptedSource::new(Arc::clone(&script)));
        assert!(wait_for(&handle, StreamState::Running, Duration::from_secs(2)));

        // Second start is a no-op while the worker is alive.
        handle.start();
        assert!(handle.is_alive());

        handle.stop();
        assert!(!handle.is_alive());
    }

    #[test]
    fn spec_updates_require_stopped_worker() {
        let script = Arc::new(Mutex::new(Script::default()));
        let mut handle = StreamHandle::new(spec(0), 1);
        handle.start_with_source(ScriptedSource::new(script));
        assert!(wait_for(&handle, StreamState::Running, Duration::from_secs(2)));

        assert!(handle.spec_mut().is_err());
        handle.stop();
        handle.spec_mut().unwrap().uri = "stub://other".to_string();
        assert_eq!(handle.spec().uri, "stub://other");
    }

    #[test]
    fn stop_terminates_the_source() {
        let script = Arc::new(Mutex::new(Script::default()));
        let mut handle = StreamHandle::new(spec(0), 1);
        handle.start_with_source(ScriptedSource::new(Arc::clone(&script)));
        assert!(wait_for(&handle, StreamState::Running, Duration::from_secs(2)));

        let begun = Instant::now();
        handle.stop();
        assert!(begun.elapsed() < JOIN_TIMEOUT);
        assert_eq!(handle.state(), StreamState::Stopped);
        assert!(script.lock().unwrap().stop_calls >= 1);
    }
}
