//! Transfer events
//!
//! Events emitted by the engine while a session runs, and the final outcome
//! handed back to the caller.

use super::types::{ByteRange, EndpointHealth, SessionId, SessionState};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Point-in-time progress snapshot; never mutated after emission
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Bytes received so far (verified plus in-flight)
    pub bytes_done: u64,
    /// Total size in bytes (unknown in streaming mode)
    pub total_size: Option<u64>,
    /// Current transfer rate in bytes/sec
    pub rate: u64,
    /// Estimated time remaining in seconds
    pub eta_secs: Option<u64>,
    pub segments_verified: usize,
    pub segments_total: usize,
    /// Number of fetches currently running
    pub active_workers: usize,
}

impl ProgressEvent {
    /// Calculate progress percentage (0.0 - 100.0)
    pub fn percentage(&self) -> f64 {
        match self.total_size {
            Some(total) if total > 0 => (self.bytes_done as f64 / total as f64) * 100.0,
            _ => 0.0,
        }
    }
}

/// Events emitted by the transfer engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransferEvent {
    /// Session state changed
    StateChanged {
        id: SessionId,
        old_state: SessionState,
        new_state: SessionState,
    },
    /// Progress update
    Progress { id: SessionId, progress: ProgressEvent },
    /// A segment was durably recorded as verified
    SegmentVerified {
        id: SessionId,
        index: usize,
        range: ByteRange,
    },
    /// A segment fetch gave up on an endpoint
    SegmentFailed {
        id: SessionId,
        index: usize,
        endpoint: String,
        error: String,
    },
    /// An endpoint moved between healthy, degraded and dead
    EndpointHealthChanged {
        id: SessionId,
        endpoint: String,
        health: EndpointHealth,
    },
    /// Transfer completed successfully
    Completed { id: SessionId, path: PathBuf },
    /// Transfer failed
    Failed {
        id: SessionId,
        error: String,
        failed_ranges: Vec<ByteRange>,
    },
    /// Transfer was cancelled; verified work is kept
    Cancelled { id: SessionId },
}

impl TransferEvent {
    /// Session the event belongs to
    pub fn session(&self) -> SessionId {
        match self {
            Self::StateChanged { id, .. }
            | Self::Progress { id, .. }
            | Self::SegmentVerified { id, .. }
            | Self::SegmentFailed { id, .. }
            | Self::EndpointHealthChanged { id, .. }
            | Self::Completed { id, .. }
            | Self::Failed { id, .. }
            | Self::Cancelled { id } => *id,
        }
    }
}

/// Final result of a transfer session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferOutcome {
    /// The output file is complete and verified
    Completed { path: PathBuf },
    /// The session could not finish; `failed_ranges` never completed
    Failed {
        reason: String,
        failed_ranges: Vec<ByteRange>,
    },
    /// Cancelled by the caller; `verified_ranges` are kept for a later resume
    Cancelled { verified_ranges: Vec<ByteRange> },
}

impl TransferOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// Output path of a completed transfer
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::Completed { path } => Some(path),
            _ => None,
        }
    }
}
