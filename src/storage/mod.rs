//! Storage Module
//!
//! Segments, the resume ledger that records which of them are verified, and
//! the reassembler that writes them into the output file.
//!
//! The ledger is persisted through the [`ResumeStore`] trait. The default
//! implementation is a JSON sidecar next to the output file, rewritten
//! atomically (temp file, fsync, rename) on every verified segment.

pub mod output;
pub mod sidecar;

pub use output::{OutputFile, Reassembler, SegmentWriter};
pub use sidecar::SidecarStore;

use crate::error::{EngineError, Result};
use crate::protocol::{ByteRange, ContentDescriptor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current ledger format version
pub const LEDGER_VERSION: u32 = 1;

/// Segment state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentState {
    /// Waiting to be dispatched
    Pending,
    /// A worker is fetching it
    InFlight,
    /// Bytes written, synced and recorded in the ledger
    Verified,
    /// Out of endpoints and retries
    Failed { error: String },
}

/// A contiguous byte range of the output, the unit of fetch, verify and retry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Segment index (0-based, ordered by offset)
    pub index: usize,
    /// Start byte offset (inclusive)
    pub start: u64,
    /// End byte offset (exclusive); `None` in streaming mode
    pub end: Option<u64>,
    pub state: SegmentState,
    /// Endpoint the segment is assigned to
    pub endpoint: Option<usize>,
    /// Failed attempts across endpoints
    pub retries: u32,
    /// Endpoints that served data failing the checksum
    pub excluded: Vec<usize>,
}

impl Segment {
    /// Create a new pending segment covering `[start, end)`
    pub fn new(index: usize, start: u64, end: u64) -> Self {
        Self {
            index,
            start,
            end: Some(end),
            state: SegmentState::Pending,
            endpoint: None,
            retries: 0,
            excluded: Vec::new(),
        }
    }

    /// Single open-ended segment for content of unknown size
    pub fn unbounded() -> Self {
        Self {
            end: None,
            ..Self::new(0, 0, 0)
        }
    }

    /// Length in bytes, if bounded
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end - self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    pub fn is_verified(&self) -> bool {
        self.state == SegmentState::Verified
    }

    pub fn range(&self) -> ByteRange {
        ByteRange::new(self.start, self.end)
    }
}

/// One segment as recorded in the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRecord {
    pub index: usize,
    pub start: u64,
    pub end: Option<u64>,
    pub verified: bool,
}

/// Persisted record of a session's layout and verified segments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    pub version: u32,
    pub content_id: String,
    pub total_size: Option<u64>,
    pub segments: Vec<SegmentRecord>,
    pub updated_at: DateTime<Utc>,
}

impl ResumeState {
    /// Fresh ledger for a planned layout; nothing verified
    pub fn new(descriptor: &ContentDescriptor, segments: &[Segment]) -> Self {
        Self {
            version: LEDGER_VERSION,
            content_id: descriptor.content_id.clone(),
            total_size: descriptor.total_size,
            segments: segments
                .iter()
                .map(|s| SegmentRecord {
                    index: s.index,
                    start: s.start,
                    end: s.end,
                    verified: false,
                })
                .collect(),
            updated_at: Utc::now(),
        }
    }

    /// Check that the ledger belongs to this content and still partitions it
    pub fn validate_against(&self, descriptor: &ContentDescriptor) -> Result<()> {
        let corrupt = |msg: String| EngineError::resume_corrupt(&descriptor.name, msg);

        if self.version != LEDGER_VERSION {
            return Err(corrupt(format!("unsupported ledger version {}", self.version)));
        }
        if self.content_id != descriptor.content_id {
            return Err(corrupt(format!(
                "content id {} does not match {}",
                self.content_id, descriptor.content_id
            )));
        }
        if self.total_size != descriptor.total_size {
            return Err(corrupt(format!(
                "total size {:?} does not match {:?}",
                self.total_size, descriptor.total_size
            )));
        }
        if self.segments.is_empty() {
            return Err(corrupt("ledger has no segments".to_string()));
        }

        // Unknown or zero size: one open segment, bounded once verified
        let streaming = self.total_size.unwrap_or(0) == 0 && self.segments.len() == 1;

        let mut expected_start = 0u64;
        for (i, record) in self.segments.iter().enumerate() {
            if record.index != i || record.start != expected_start {
                return Err(corrupt(format!("segment {} breaks the layout", i)));
            }
            match record.end {
                Some(end) if end > record.start => expected_start = end,
                Some(end) if streaming && record.verified && end == record.start => {}
                None if streaming => {
                    if record.verified {
                        return Err(corrupt("open segment marked verified".to_string()));
                    }
                    return Ok(());
                }
                _ => return Err(corrupt(format!("segment {} has an invalid end", i))),
            }
        }

        match self.total_size {
            Some(total) if total > 0 && expected_start != total => Err(corrupt(format!(
                "segments cover {} of {} bytes",
                expected_start, total
            ))),
            None if self.segments.len() != 1 => {
                Err(corrupt("streaming ledger with several segments".to_string()))
            }
            _ => Ok(()),
        }
    }

    /// Mark a segment verified; `end` bounds an open streaming segment
    pub fn mark_verified(&mut self, index: usize, end: Option<u64>) {
        if let Some(record) = self.segments.get_mut(index) {
            record.verified = true;
            if record.end.is_none() {
                record.end = end;
            }
        }
        self.updated_at = Utc::now();
    }

    /// Forget every verification, keeping the layout
    pub fn reset(&mut self) {
        for record in &mut self.segments {
            record.verified = false;
        }
        self.updated_at = Utc::now();
    }

    pub fn all_verified(&self) -> bool {
        self.segments.iter().all(|s| s.verified)
    }

    pub fn verified_ranges(&self) -> Vec<ByteRange> {
        self.segments
            .iter()
            .filter(|s| s.verified)
            .map(|s| ByteRange::new(s.start, s.end))
            .collect()
    }

    /// Rebuild segments from the ledger
    pub fn to_segments(&self) -> Vec<Segment> {
        self.segments
            .iter()
            .map(|record| Segment {
                index: record.index,
                start: record.start,
                end: record.end,
                state: if record.verified {
                    SegmentState::Verified
                } else {
                    SegmentState::Pending
                },
                endpoint: None,
                retries: 0,
                excluded: Vec::new(),
            })
            .collect()
    }
}

/// Persistence for one session's resume ledger
///
/// Implementations handle storing and retrieving the ledger so a session can
/// skip verified segments after a crash or restart. `load` reports an
/// unreadable ledger as `ResumeStateCorrupt`.
#[async_trait]
pub trait ResumeStore: Send + Sync {
    /// Load the ledger, `None` if there is none
    async fn load(&self) -> Result<Option<ResumeState>>;

    /// Durably replace the ledger
    async fn save(&self, state: &ResumeState) -> Result<()>;

    /// Remove the ledger
    async fn clear(&self) -> Result<()>;
}

/// In-memory ledger for testing
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: parking_lot::RwLock<Option<ResumeState>>,
    saves: std::sync::atomic::AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that already holds a ledger
    pub fn with_state(state: ResumeState) -> Self {
        Self {
            state: parking_lot::RwLock::new(Some(state)),
            saves: Default::default(),
        }
    }

    pub fn current(&self) -> Option<ResumeState> {
        self.state.read().clone()
    }

    /// Number of successful saves
    pub fn save_count(&self) -> usize {
        self.saves.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[async_trait]
impl ResumeStore for MemoryStore {
    async fn load(&self) -> Result<Option<ResumeState>> {
        Ok(self.state.read().clone())
    }

    async fn save(&self, state: &ResumeState) -> Result<()> {
        *self.state.write() = Some(state.clone());
        self.saves.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        *self.state.write() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(total: Option<u64>) -> ContentDescriptor {
        ContentDescriptor::new("abc123", total, "file.bin")
    }

    fn layout() -> Vec<Segment> {
        vec![Segment::new(0, 0, 10), Segment::new(1, 10, 20), Segment::new(2, 20, 25)]
    }

    #[test]
    fn test_segment_basics() {
        let segment = Segment::new(1, 10, 20);
        assert_eq!(segment.len(), Some(10));
        assert_eq!(segment.range(), ByteRange::new(10, Some(20)));
        assert!(!segment.is_verified());

        let open = Segment::unbounded();
        assert_eq!(open.len(), None);
        assert_eq!(open.range().to_string(), "[0, EOF)");
    }

    #[test]
    fn test_ledger_validates() {
        let desc = descriptor(Some(25));
        let mut state = ResumeState::new(&desc, &layout());
        assert!(state.validate_against(&desc).is_ok());

        state.mark_verified(1, None);
        let segments = state.to_segments();
        assert!(segments[1].is_verified());
        assert!(!segments[0].is_verified());
        assert_eq!(state.verified_ranges(), vec![ByteRange::new(10, Some(20))]);
    }

    #[test]
    fn test_ledger_mismatch_is_corrupt() {
        let desc = descriptor(Some(25));
        let state = ResumeState::new(&desc, &layout());

        let other = ContentDescriptor::new("other", Some(25), "file.bin");
        assert!(state.validate_against(&other).unwrap_err().is_resume_corrupt());

        let resized = descriptor(Some(30));
        assert!(state.validate_against(&resized).unwrap_err().is_resume_corrupt());

        let mut gap = state.clone();
        gap.segments[1].start = 11;
        assert!(gap.validate_against(&desc).unwrap_err().is_resume_corrupt());

        let mut versioned = state;
        versioned.version = 99;
        assert!(versioned.validate_against(&desc).is_err());
    }

    #[test]
    fn test_streaming_ledger() {
        let desc = descriptor(None);
        let mut state = ResumeState::new(&desc, &[Segment::unbounded()]);
        assert!(state.validate_against(&desc).is_ok());

        state.mark_verified(0, Some(42));
        assert_eq!(state.segments[0].end, Some(42));
        assert!(state.all_verified());
        assert!(state.validate_against(&desc).is_ok());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let desc = descriptor(Some(25));
        let store = MemoryStore::new();
        assert!(store.load().await.unwrap().is_none());

        let state = ResumeState::new(&desc, &layout());
        store.save(&state).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(state));
        assert_eq!(store.save_count(), 1);

        store.clear().await.unwrap();
        assert!(store.load().await.unwrap().is_none());
    }
}
