//! Raw frame container and bounded frame queues.
//!
//! - `Nv12Frame`: one decoded planar 4:2:0 frame, timestamped at receipt.
//! - `FrameQueue<T>`: bounded single-producer/single-consumer buffer with
//!   evict-oldest-on-full semantics. Used per stream (frames) and per loader
//!   (composed canvases).
//!
//! Timestamps come from a process-local monotonic clock, never from source
//! metadata: cross-stream alignment must work with heterogeneous or absent
//! source clocks.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, OnceLock};
use std::time::{Duration, Instant};

/// Milliseconds since the process-local monotonic epoch.
///
/// The epoch is the first call in this process; only differences between
/// values are meaningful.
pub fn now_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

// ----------------------------------------------------------------------------
// Nv12Frame
// ----------------------------------------------------------------------------

/// One raw NV12 frame.
///
/// `y` is the full-resolution luma plane (`width * height` bytes). `uv` is the
/// half-resolution interleaved chroma plane (`width * height / 2` bytes:
/// `height/2` rows of `width/2` U/V pairs). Immutable once produced.
#[derive(Clone, Debug)]
pub struct Nv12Frame {
    pub y: Vec<u8>,
    pub uv: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Monotonic milliseconds assigned at receipt (see [`now_ms`]).
    pub timestamp_ms: u64,
}

impl Nv12Frame {
    pub fn new(y: Vec<u8>, uv: Vec<u8>, width: u32, height: u32, timestamp_ms: u64) -> Self {
        debug_assert_eq!(y.len(), (width * height) as usize);
        debug_assert_eq!(uv.len(), (width * height / 2) as usize);
        Self {
            y,
            uv,
            width,
            height,
            timestamp_ms,
        }
    }

    /// Frame filled with constant luma/chroma values.
    pub fn filled(width: u32, height: u32, luma: u8, chroma: u8, timestamp_ms: u64) -> Self {
        Self {
            y: vec![luma; (width * height) as usize],
            uv: vec![chroma; (width * height / 2) as usize],
            width,
            height,
            timestamp_ms,
        }
    }

    /// Expected byte size of one NV12 frame at the given dimensions.
    pub fn byte_size(width: u32, height: u32) -> usize {
        (width as usize * height as usize * 3) / 2
    }
}

// ----------------------------------------------------------------------------
// FrameQueue
// ----------------------------------------------------------------------------

/// Bounded SPSC queue with evict-oldest-on-full pushes.
///
/// `push` never blocks the producer: when the queue is full the oldest entry
/// is dropped first. Ordering among survivors is FIFO. Two consumption modes
/// are supported by the same structure:
///
/// - take-latest (`take_latest`): newest entry wins, the rest is discarded;
/// - peek/advance (`with_oldest` / `pop_oldest`): timestamp-aware draining
///   from the oldest end.
pub struct FrameQueue<T> {
    inner: Mutex<VecDeque<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T> FrameQueue<T> {
    /// Create a queue holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert an entry, evicting the oldest one first when full.
    pub fn push(&self, item: T) {
        let mut queue = self.lock();
        while queue.len() >= self.capacity {
            queue.pop_front();
        }
        queue.push_back(item);
        self.available.notify_one();
    }

    /// Pop the newest entry and discard everything older.
    pub fn take_latest(&self) -> Option<T> {
        let mut queue = self.lock();
        let latest = queue.pop_back();
        queue.clear();
        latest
    }

    /// Read the oldest entry without removing it.
    pub fn with_oldest<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let queue = self.lock();
        queue.front().map(f)
    }

    /// Remove and return the oldest entry.
    pub fn pop_oldest(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Remove and return the oldest entry, waiting up to `timeout` for one
    /// to arrive.
    pub fn pop_oldest_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut queue = self.lock();
        loop {
            if let Some(item) = queue.pop_front() {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, result) = self
                .available
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            queue = guard;
            if result.timed_out() && queue.is_empty() {
                return None;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<T>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
