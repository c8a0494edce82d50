//! Output file and reassembly
//!
//! Segments are written straight into `<output_dir>/<name>.part` at their
//! absolute offsets, each worker through its own file handle. A segment only
//! counts as verified after its bytes are synced and the ledger recording it
//! has been durably replaced. When every segment is verified the part file is
//! renamed to its final name.

use super::{ResumeState, ResumeStore, Segment};
use crate::error::{EngineError, Result, StorageErrorKind};
use crate::http::checksum::{checksum_mismatch_error, compute_checksum};
use crate::protocol::{ByteRange, ContentDescriptor, ExpectedChecksum};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// Paths of one output file
#[derive(Debug, Clone)]
pub struct OutputFile {
    part_path: PathBuf,
    final_path: PathBuf,
}

impl OutputFile {
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            part_path: dir.join(format!("{}.part", name)),
            final_path: dir.join(name),
        }
    }

    pub fn part_path(&self) -> &Path {
        &self.part_path
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    fn io_error(&self, action: &str, err: std::io::Error) -> EngineError {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            _ => StorageErrorKind::Io,
        };
        EngineError::storage(kind, &self.part_path, format!("Failed to {}: {}", action, err))
    }

    /// Create or truncate the part file, pre-allocated when the size is known
    pub async fn create(&self, total_size: Option<u64>) -> Result<()> {
        let file = File::create(&self.part_path)
            .await
            .map_err(|e| self.io_error("create part file", e))?;
        if let Some(size) = total_size {
            file.set_len(size)
                .await
                .map_err(|e| self.io_error("pre-allocate part file", e))?;
        }
        file.sync_all()
            .await
            .map_err(|e| self.io_error("sync part file", e))?;
        Ok(())
    }

    /// Length of the existing part file, `None` if it is missing
    pub async fn part_len(&self) -> Result<Option<u64>> {
        match tokio::fs::metadata(&self.part_path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error("stat part file", e)),
        }
    }

    /// Open a writer positioned at `offset`
    pub async fn writer(&self, offset: u64) -> Result<SegmentWriter> {
        let mut file = OpenOptions::new()
            .write(true)
            .open(&self.part_path)
            .await
            .map_err(|e| self.io_error("open part file", e))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| self.io_error("seek part file", e))?;
        Ok(SegmentWriter {
            file,
            path: self.part_path.clone(),
            start: offset,
            written: 0,
        })
    }

    /// Cut the part file to `len` bytes
    pub async fn truncate(&self, len: u64) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .open(&self.part_path)
            .await
            .map_err(|e| self.io_error("open part file", e))?;
        file.set_len(len)
            .await
            .map_err(|e| self.io_error("truncate part file", e))?;
        file.sync_all()
            .await
            .map_err(|e| self.io_error("sync part file", e))
    }

    /// Rename the part file to its final name
    pub async fn finalize(&self) -> Result<PathBuf> {
        tokio::fs::rename(&self.part_path, &self.final_path)
            .await
            .map_err(|e| self.io_error("rename part file", e))?;
        Ok(self.final_path.clone())
    }
}

/// Positional writer for one segment
pub struct SegmentWriter {
    file: File,
    path: PathBuf,
    start: u64,
    written: u64,
}

impl SegmentWriter {
    fn io_error(&self, action: &str, err: std::io::Error) -> EngineError {
        EngineError::storage(
            StorageErrorKind::Io,
            &self.path,
            format!("Failed to {} at offset {}: {}", action, self.start + self.written, err),
        )
    }

    /// Bytes written since the segment start
    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file
            .write_all(data)
            .await
            .map_err(|e| self.io_error("write", e))?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Go back to the segment start for another attempt
    pub async fn rewind(&mut self) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(self.start))
            .await
            .map_err(|e| self.io_error("seek", e))?;
        self.written = 0;
        Ok(())
    }

    /// Flush written bytes to stable storage
    pub async fn sync(&mut self) -> Result<()> {
        self.file.flush().await.map_err(|e| self.io_error("flush", e))?;
        self.file
            .sync_data()
            .await
            .map_err(|e| self.io_error("sync", e))
    }
}

/// Writes verified segments into the output and keeps the ledger current
pub struct Reassembler {
    output: OutputFile,
    descriptor: ContentDescriptor,
    ledger: Mutex<ResumeState>,
    store: Arc<dyn ResumeStore>,
}

impl std::fmt::Debug for Reassembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reassembler")
            .field("output", &self.output)
            .field("descriptor", &self.descriptor)
            .field("ledger", &self.ledger)
            .finish_non_exhaustive()
    }
}

impl Reassembler {
    /// Open the output for a session, resuming from the ledger when it is usable
    ///
    /// Returns the segments to work with: the ledger's layout with verified
    /// segments marked, or `planned` when starting fresh. A ledger that does
    /// not parse, does not match the content, or whose part file is gone is
    /// logged and discarded.
    pub async fn open(
        dir: &Path,
        descriptor: ContentDescriptor,
        planned: Vec<Segment>,
        store: Arc<dyn ResumeStore>,
    ) -> Result<(Self, Vec<Segment>)> {
        let output = OutputFile::new(dir, &descriptor.name);

        let previous = match store.load().await {
            Ok(state) => state,
            Err(e) if e.is_resume_corrupt() => {
                tracing::warn!("Discarding resume state for {}: {}", descriptor.name, e);
                None
            }
            Err(e) => return Err(e),
        };

        if let Some(state) = previous {
            match Self::check_resumable(&output, &descriptor, &state).await {
                Ok(()) => {
                    let segments = state.to_segments();
                    let verified = segments.iter().filter(|s| s.is_verified()).count();
                    tracing::info!(
                        "Resuming {} with {}/{} segments verified",
                        descriptor.name,
                        verified,
                        segments.len()
                    );
                    let reassembler = Self {
                        output,
                        descriptor,
                        ledger: Mutex::new(state),
                        store,
                    };
                    return Ok((reassembler, segments));
                }
                Err(e) => {
                    tracing::warn!(
                        "Resume state for {} is unusable, restarting fresh: {}",
                        descriptor.name,
                        e
                    );
                }
            }
        }

        // The fresh ledger lands before the part file is touched, so a stale
        // ledger never sits next to a recreated part file
        let state = ResumeState::new(&descriptor, &planned);
        store.save(&state).await?;
        output.create(descriptor.total_size).await?;

        let reassembler = Self {
            output,
            descriptor,
            ledger: Mutex::new(state),
            store,
        };
        Ok((reassembler, planned))
    }

    async fn check_resumable(
        output: &OutputFile,
        descriptor: &ContentDescriptor,
        state: &ResumeState,
    ) -> Result<()> {
        state.validate_against(descriptor)?;

        let part_len = output.part_len().await?;
        let finalized = part_len.is_none() && output.final_path().exists();
        if state.all_verified() && finalized {
            return Ok(());
        }
        let streaming = descriptor.total_size.unwrap_or(0) == 0;
        match (part_len, descriptor.total_size) {
            (Some(_), _) if streaming => Ok(()),
            (Some(len), Some(total)) if len == total => Ok(()),
            (None, _) if state.verified_ranges().is_empty() => {
                // Nothing to lose; recreate the part file for the same layout
                output.create(descriptor.total_size).await
            }
            (len, _) => Err(EngineError::resume_corrupt(
                output.part_path(),
                format!("part file length {:?} does not match the ledger", len),
            )),
        }
    }

    pub fn output(&self) -> &OutputFile {
        &self.output
    }

    pub fn descriptor(&self) -> &ContentDescriptor {
        &self.descriptor
    }

    /// Writer positioned at the segment start
    pub async fn writer(&self, segment: &Segment) -> Result<SegmentWriter> {
        self.output.writer(segment.start).await
    }

    /// Durably record a fetched segment as verified
    ///
    /// Syncs the segment's bytes first, then replaces the ledger. If either
    /// step fails the segment stays unverified and will be fetched again.
    pub async fn commit(&self, mut writer: SegmentWriter, index: usize) -> Result<ByteRange> {
        writer.sync().await?;
        let end = writer.start + writer.written;
        drop(writer);

        let mut ledger = self.ledger.lock().await;
        let range = ledger
            .segments
            .get(index)
            .map(|record| ByteRange::new(record.start, record.end.or(Some(end))))
            .ok_or_else(|| EngineError::Internal(format!("no segment {} in ledger", index)))?;

        let mut next = ledger.clone();
        next.mark_verified(index, Some(end));
        self.store.save(&next).await?;
        *ledger = next;
        Ok(range)
    }

    pub async fn verified_ranges(&self) -> Vec<ByteRange> {
        self.ledger.lock().await.verified_ranges()
    }

    /// Finish the output once every segment is verified
    ///
    /// Verifies the whole-file checksum when one is expected. On mismatch the
    /// ledger is reset so the next run fetches everything again.
    pub async fn finish(&self, checksum: Option<&ExpectedChecksum>) -> Result<PathBuf> {
        let ledger = self.ledger.lock().await.clone();
        if !ledger.all_verified() {
            return Err(EngineError::Internal(
                "finish called with unverified segments".to_string(),
            ));
        }

        if self.output.part_len().await?.is_none() && self.output.final_path().exists() {
            tracing::debug!("{} already finalized", self.descriptor.name);
            return Ok(self.output.final_path().to_path_buf());
        }

        if self.descriptor.total_size.unwrap_or(0) == 0 {
            // Streaming mode: drop anything past the bytes actually received
            let end = ledger.segments.last().and_then(|s| s.end).unwrap_or(0);
            self.output.truncate(end).await?;
        }

        if let Some(expected) = checksum {
            let actual = compute_checksum(self.output.part_path(), expected.algorithm).await?;
            if !actual.eq_ignore_ascii_case(&expected.value) {
                let mut reset = ledger;
                reset.reset();
                self.store.save(&reset).await?;
                *self.ledger.lock().await = reset;
                return Err(checksum_mismatch_error(
                    &self.descriptor.name,
                    &expected.value,
                    &actual,
                ));
            }
        }

        self.output.finalize().await
    }
}
