//! Cross-stream frame synchronization.
//!
//! Once per composition cycle a strategy collects one coherent set of frames,
//! at most one per running stream, draining the per-stream queues. Every
//! frame included in a returned set has been consumed from its queue and is
//! never delivered twice.
//!
//! Two strategies exist and are selected per loader:
//!
//! - `TakeLatest`: newest frame per stream, minimal latency, no alignment.
//! - `DeltaAligned`: walks each queue from the oldest end until the spread of
//!   arrival timestamps fits within a window, best effort after a bounded
//!   number of iterations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::frame::Nv12Frame;
use crate::stream::{StreamState, StreamView};

/// Alignment loop bound for the delta strategy.
const MAX_ALIGN_ITERATIONS: usize = 10;
/// Sleep between polls while waiting for frames in take-latest mode.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

pub const DEFAULT_MAX_DELTA_MS: u64 = 200;

/// Strategy selection, persisted with the loader record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    TakeLatest,
    DeltaAligned,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::DeltaAligned
    }
}

/// One cycle of cross-stream frame collection.
///
/// `running` is the owning worker's cooperative stop flag; implementations
/// must return promptly once it clears. `None` means "no data this cycle" —
/// the caller backs off instead of busy-polling.
pub trait SyncStrategy: Send {
    fn collect(
        &self,
        streams: &[StreamView],
        running: &AtomicBool,
    ) -> Option<HashMap<String, Nv12Frame>>;
}

/// Build the configured strategy.
pub fn strategy_for(mode: SyncMode, max_delta_ms: u64) -> Box<dyn SyncStrategy> {
    match mode {
        SyncMode::TakeLatest => Box::new(TakeLatest),
        SyncMode::DeltaAligned => Box::new(DeltaAligned { max_delta_ms }),
    }
}

fn running_views(streams: &[StreamView]) -> Vec<&StreamView> {
    streams
        .iter()
        .filter(|v| v.state() == StreamState::Running)
        .collect()
}

// ----------------------------------------------------------------------------
// TakeLatest
// ----------------------------------------------------------------------------

/// Newest frame per stream; waits until every running stream has one.
pub struct TakeLatest;

impl SyncStrategy for TakeLatest {
    fn collect(
        &self,
        streams: &[StreamView],
        running: &AtomicBool,
    ) -> Option<HashMap<String, Nv12Frame>> {
        while running.load(Ordering::SeqCst) {
            let views = running_views(streams);
            if views.is_empty() {
                return None;
            }

            if views.iter().any(|v| v.queue().is_empty()) {
                std::thread::sleep(POLL_INTERVAL);
                continue;
            }

            let mut frames = HashMap::with_capacity(views.len());
            for view in views {
                if let Some(frame) = view.queue().take_latest() {
                    frames.insert(view.name.clone(), frame);
                }
            }
            if frames.is_empty() {
                return None;
            }
            return Some(frames);
        }
        None
    }
}

// ----------------------------------------------------------------------------
// DeltaAligned
// ----------------------------------------------------------------------------

/// Oldest-end alignment within a timestamp window.
pub struct DeltaAligned {
    pub max_delta_ms: u64,
}

impl SyncStrategy for DeltaAligned {
    fn collect(
        &self,
        streams: &[StreamView],
        _running: &AtomicBool,
    ) -> Option<HashMap<String, Nv12Frame>> {
        let views = running_views(streams);
        if views.is_empty() {
            return None;
        }

        // Peek each queue head; advancing a slot discards the stale head and
        // peeks the next-oldest frame. Nothing is consumed until the set is
        // settled.
        let mut slots: Vec<(&StreamView, Option<u64>)> = views
            .into_iter()
            .map(|view| {
                let head_ts = view.queue().with_oldest(|f| f.timestamp_ms);
                (view, head_ts)
            })
            .collect();

        if slots.iter().all(|(_, ts)| ts.is_none()) {
            return None;
        }

        for _ in 0..MAX_ALIGN_ITERATIONS {
            let timestamps: Vec<u64> = slots.iter().filter_map(|(_, ts)| *ts).collect();
            let Some(&max) = timestamps.iter().max() else {
                break;
            };
            let &min = timestamps.iter().min().expect("non-empty timestamps");
            if max - min <= self.max_delta_ms {
                break;
            }

            // Advance every stream lagging more than the window behind max.
            for (view, slot) in slots.iter_mut() {
                if slot.is_some_and(|ts| max - ts > self.max_delta_ms) {
                    view.queue().pop_oldest();
                    *slot = view.queue().with_oldest(|f| f.timestamp_ms);
                }
            }
        }

        let frames: HashMap<String, Nv12Frame> = slots
            .into_iter()
            .filter_map(|(view, ts)| {
                ts.and_then(|_| view.queue().pop_oldest())
                    .map(|frame| (view.name.clone(), frame))
            })
            .collect();
        if frames.is_empty() {
            None
        } else {
            Some(frames)
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
