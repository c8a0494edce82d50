//! Core protocol types
//!
//! Fundamental types used throughout the protocol.

use super::checksum::ChecksumAlgorithm;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a transfer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a new random session ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Short 16-char hex form used in log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0.as_bytes()[0..8])
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short())
    }
}

/// Lifecycle state of a transfer session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum SessionState {
    /// Segments are being planned or the ledger is being loaded
    Planning,
    /// Segments are being fetched
    Running,
    /// Paused by the caller; no fetches in flight
    Paused,
    /// Every segment verified and the output renamed
    Completed,
    /// Session ended without completing
    Failed { reason: String },
}

impl SessionState {
    /// Check if the session has reached a terminal state
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed { .. })
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed { .. } => "failed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed { reason } => write!(f, "failed ({})", reason),
            other => f.write_str(other.label()),
        }
    }
}

/// Health of a source endpoint as seen by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointHealth {
    Healthy,
    Degraded,
    Dead,
}

impl EndpointHealth {
    pub fn is_usable(&self) -> bool {
        !matches!(self, Self::Dead)
    }
}

impl std::fmt::Display for EndpointHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

/// Half-open byte range `[start, end)`; `end == None` means "until EOF"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    /// Length of the range, if bounded
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.start))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

impl std::fmt::Display for ByteRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.end {
            Some(end) => write!(f, "[{}, {})", self.start, end),
            None => write!(f, "[{}, EOF)", self.start),
        }
    }
}

/// Per-block digests that segments are verified against
///
/// Digest `i` covers bytes `[i * block_size, min((i + 1) * block_size, total))`.
/// Segments are always aligned to block boundaries when these are present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentChecksums {
    pub algorithm: ChecksumAlgorithm,
    pub block_size: u64,
    /// Hex-encoded, lowercase
    pub digests: Vec<String>,
}

impl SegmentChecksums {
    /// Digests covering `[start, end)`; `None` if the range is not block aligned
    pub fn digests_for(&self, start: u64, end: u64) -> Option<&[String]> {
        if self.block_size == 0 || start % self.block_size != 0 {
            return None;
        }
        let first = (start / self.block_size) as usize;
        let last = end.div_ceil(self.block_size) as usize;
        if first > last || last > self.digests.len() {
            return None;
        }
        Some(&self.digests[first..last])
    }
}

/// Everything the engine knows about the content being fetched
///
/// Immutable once resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentDescriptor {
    /// Hex digest naming the resource (info hash, or derived from URL + validator)
    pub content_id: String,
    /// Total size in bytes, `None` when the source does not tell us
    pub total_size: Option<u64>,
    /// Optional per-block checksums
    pub checksums: Option<SegmentChecksums>,
    /// Output filename
    pub name: String,
}

impl ContentDescriptor {
    pub fn new(content_id: impl Into<String>, total_size: Option<u64>, name: impl Into<String>) -> Self {
        Self {
            content_id: content_id.into(),
            total_size,
            checksums: None,
            name: name.into(),
        }
    }

    pub fn with_checksums(mut self, checksums: SegmentChecksums) -> Self {
        self.checksums = Some(checksums);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_is_16_hex_chars() {
        let id = SessionId::new();
        let short = id.short();
        assert_eq!(short.len(), 16);
        assert!(short.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id.to_string(), short);
    }

    #[test]
    fn byte_range_display() {
        assert_eq!(ByteRange::new(0, Some(10)).to_string(), "[0, 10)");
        assert_eq!(ByteRange::new(5, None).to_string(), "[5, EOF)");
        assert_eq!(ByteRange::new(3, Some(10)).len(), Some(7));
        assert_eq!(ByteRange::new(3, None).len(), None);
    }

    #[test]
    fn health_ordering_prefers_healthy() {
        assert!(EndpointHealth::Healthy < EndpointHealth::Degraded);
        assert!(EndpointHealth::Degraded < EndpointHealth::Dead);
        assert!(!EndpointHealth::Dead.is_usable());
    }

    #[test]
    fn digests_for_aligned_ranges() {
        let checksums = SegmentChecksums {
            algorithm: ChecksumAlgorithm::Sha1,
            block_size: 4,
            digests: vec!["a".into(), "b".into(), "c".into()],
        };
        assert_eq!(checksums.digests_for(0, 8).unwrap(), &["a", "b"]);
        // last block is short
        assert_eq!(checksums.digests_for(8, 10).unwrap(), &["c"]);
        assert!(checksums.digests_for(2, 8).is_none());
        assert!(checksums.digests_for(8, 20).is_none());
    }

    #[test]
    fn failed_state_display_includes_reason() {
        let state = SessionState::Failed {
            reason: "cancelled".into(),
        };
        assert_eq!(state.to_string(), "failed (cancelled)");
        assert!(state.is_finished());
        assert!(!SessionState::Paused.is_finished());
    }
}
