//! Progress reporting
//!
//! Turns byte deltas from segment workers into [`ProgressEvent`]s with a
//! windowed transfer rate and ETA, and broadcasts them to subscribers. Holds
//! no control state; the coordinator only tells it segment counts.

use crate::protocol::{ProgressEvent, SessionId, TransferEvent};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Samples kept for the rate window
const SPEED_WINDOW: usize = 20;

/// Speed calculator for download rate
pub struct SpeedCalculator {
    /// Window size for averaging
    window_size: usize,
    /// Recent measurements (bytes, timestamp)
    measurements: VecDeque<(u64, Instant)>,
    /// Total bytes tracked
    total_bytes: u64,
}

impl SpeedCalculator {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size: window_size.max(2),
            measurements: VecDeque::with_capacity(window_size),
            total_bytes: 0,
        }
    }

    /// Add a measurement
    pub fn add_bytes(&mut self, bytes: u64) {
        self.total_bytes += bytes;
        if self.measurements.len() >= self.window_size {
            self.measurements.pop_front();
        }
        self.measurements.push_back((bytes, Instant::now()));
    }

    /// Current speed in bytes/second over the window
    pub fn speed(&self) -> u64 {
        let (Some(first), Some(last)) = (self.measurements.front(), self.measurements.back())
        else {
            return 0;
        };
        if self.measurements.len() < 2 {
            return 0;
        }

        let elapsed = last.1.duration_since(first.1).as_secs_f64();
        if elapsed <= 0.0 {
            return 0;
        }

        // The first sample marks the window start; its bytes arrived before it
        let bytes: u64 = self.measurements.iter().skip(1).map(|(b, _)| *b).sum();
        (bytes as f64 / elapsed) as u64
    }

    pub fn total(&self) -> u64 {
        self.total_bytes
    }

    pub fn reset(&mut self) {
        self.measurements.clear();
        self.total_bytes = 0;
    }
}

struct ProgressState {
    bytes_done: u64,
    total_size: Option<u64>,
    speed: SpeedCalculator,
    segments_verified: usize,
    segments_total: usize,
    active_workers: usize,
}

/// Aggregates progress for one session and broadcasts it
pub struct ProgressReporter {
    id: SessionId,
    events: broadcast::Sender<TransferEvent>,
    state: Mutex<ProgressState>,
}

impl ProgressReporter {
    pub fn new(
        id: SessionId,
        total_size: Option<u64>,
        events: broadcast::Sender<TransferEvent>,
    ) -> Self {
        Self {
            id,
            events,
            state: Mutex::new(ProgressState {
                bytes_done: 0,
                total_size,
                speed: SpeedCalculator::new(SPEED_WINDOW),
                segments_verified: 0,
                segments_total: 0,
                active_workers: 0,
            }),
        }
    }

    /// Bytes already verified before this run started
    pub fn set_baseline(&self, bytes: u64) {
        self.state.lock().bytes_done = bytes;
    }

    /// Apply a byte delta from a worker and emit an event
    ///
    /// Negative deltas undo bytes of a failed attempt and do not count
    /// towards the rate.
    pub fn record(&self, delta: i64) {
        {
            let mut state = self.state.lock();
            if delta >= 0 {
                state.bytes_done = state.bytes_done.saturating_add(delta as u64);
                state.speed.add_bytes(delta as u64);
            } else {
                state.bytes_done = state.bytes_done.saturating_sub(delta.unsigned_abs());
            }
        }
        self.emit();
    }

    /// Update segment counts from the coordinator
    pub fn set_segments(&self, verified: usize, total: usize, active_workers: usize) {
        let mut state = self.state.lock();
        state.segments_verified = verified;
        state.segments_total = total;
        state.active_workers = active_workers;
    }

    /// Size learned once a streaming segment finished
    pub fn set_total_size(&self, total: u64) {
        self.state.lock().total_size = Some(total);
    }

    pub fn snapshot(&self) -> ProgressEvent {
        let state = self.state.lock();
        let rate = state.speed.speed();
        let eta_secs = match state.total_size {
            Some(total) if rate > 0 => Some(total.saturating_sub(state.bytes_done) / rate),
            _ => None,
        };
        ProgressEvent {
            bytes_done: state.bytes_done,
            total_size: state.total_size,
            rate,
            eta_secs,
            segments_verified: state.segments_verified,
            segments_total: state.segments_total,
            active_workers: state.active_workers,
        }
    }

    /// Broadcast the current snapshot
    pub fn emit(&self) {
        let progress = self.snapshot();
        // No subscribers is fine
        let _ = self.events.send(TransferEvent::Progress {
            id: self.id,
            progress,
        });
    }
}
