//! Segment fetching
//!
//! Fetches one segment from one endpoint into a positional writer, retrying
//! transient failures with backoff. Every read waits at most the segment
//! timeout, so a stalled endpoint turns into a retryable error instead of a
//! hang.

use crate::endpoint::SourceEndpoint;
use crate::error::{EngineError, NetworkErrorKind, Result};
use crate::http::{BlockVerifier, RangeSource, RetryPolicy};
use crate::protocol::SegmentChecksums;
use crate::storage::{Segment, SegmentWriter};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Fetches segments through a [`RangeSource`]
#[derive(Clone)]
pub struct SegmentFetcher {
    source: Arc<dyn RangeSource>,
    retry: RetryPolicy,
    stall_timeout: Duration,
    chunk_size: u64,
}

impl SegmentFetcher {
    pub fn new(
        source: Arc<dyn RangeSource>,
        retry: RetryPolicy,
        stall_timeout: Duration,
        chunk_size: u64,
    ) -> Self {
        Self {
            source,
            retry,
            stall_timeout,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Fetch `segment` from `endpoint` into `writer`
    ///
    /// Returns the number of bytes written. `progress` receives byte deltas
    /// every `chunk_size` bytes; a failed attempt is undone with a negative
    /// delta. Checksum mismatches and other permanent errors are returned
    /// without retrying so the caller can choose another endpoint.
    pub async fn fetch<F>(
        &self,
        segment: &Segment,
        endpoint: &SourceEndpoint,
        checksums: Option<&SegmentChecksums>,
        writer: &mut SegmentWriter,
        cancel: &CancellationToken,
        progress: F,
    ) -> Result<u64>
    where
        F: Fn(i64) + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if writer.written() > 0 {
                writer.rewind().await?;
            }

            let mut reported = 0u64;
            let result = self
                .attempt(segment, endpoint, checksums, writer, cancel, &progress, &mut reported)
                .await;
            let err = match result {
                Ok(bytes) => return Ok(bytes),
                Err(e) => e,
            };

            if reported > 0 {
                progress(-(reported as i64));
            }
            if matches!(err, EngineError::Cancelled) || !self.retry.should_retry(attempt, &err) {
                return Err(err);
            }

            let delay = self.retry.delay_for_attempt(attempt);
            tracing::debug!(
                "Segment {} from {} failed (attempt {}), retrying in {:?}: {}",
                segment.index,
                endpoint.uri,
                attempt + 1,
                delay,
                err
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt<F>(
        &self,
        segment: &Segment,
        endpoint: &SourceEndpoint,
        checksums: Option<&SegmentChecksums>,
        writer: &mut SegmentWriter,
        cancel: &CancellationToken,
        progress: &F,
        reported: &mut u64,
    ) -> Result<u64>
    where
        F: Fn(i64) + Send + Sync,
    {
        let start = segment.start;
        let expected = segment.len();

        let mut verifier = match (checksums, segment.end) {
            (Some(sums), Some(end)) => {
                let digests = sums.digests_for(start, end).ok_or_else(|| {
                    EngineError::Internal(format!(
                        "segment {} is not aligned to checksum blocks",
                        segment.index
                    ))
                })?;
                Some(BlockVerifier::new(sums.algorithm, sums.block_size, digests, start))
            }
            _ => None,
        };

        let open = self.source.open(&endpoint.uri, start, segment.end);
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            opened = tokio::time::timeout(self.stall_timeout, open) => {
                opened.map_err(|_| self.stalled(segment, "waiting for a response"))??
            }
        };

        let mut pending = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                next = tokio::time::timeout(self.stall_timeout, stream.next()) => {
                    next.map_err(|_| self.stalled(segment, "waiting for data"))?
                }
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk?;

            if let Some(expected) = expected {
                if writer.written() + chunk.len() as u64 > expected {
                    return Err(EngineError::network(
                        NetworkErrorKind::ShortRead,
                        format!(
                            "{} sent more than the {} bytes of segment {}",
                            endpoint.uri, expected, segment.index
                        ),
                    ));
                }
            }
            if let Some(ref mut verifier) = verifier {
                verifier.update(&chunk)?;
            }
            writer.write(&chunk).await?;

            pending += chunk.len() as u64;
            if pending >= self.chunk_size {
                progress(pending as i64);
                *reported += pending;
                pending = 0;
            }
        }

        if let Some(expected) = expected {
            if writer.written() != expected {
                return Err(EngineError::network(
                    NetworkErrorKind::ShortRead,
                    format!(
                        "{} ended segment {} after {} of {} bytes",
                        endpoint.uri,
                        segment.index,
                        writer.written(),
                        expected
                    ),
                ));
            }
        }
        if let Some(verifier) = verifier {
            verifier.finish()?;
        }

        if pending > 0 {
            progress(pending as i64);
            *reported += pending;
        }
        Ok(writer.written())
    }

    fn stalled(&self, segment: &Segment, what: &str) -> EngineError {
        EngineError::network(
            NetworkErrorKind::Timeout,
            format!(
                "segment {} stalled for {:?} {}",
                segment.index, self.stall_timeout, what
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackoffConfig;
    use crate::http::checksum::Hasher;
    use crate::http::ByteStream;
    use crate::protocol::ChecksumAlgorithm;
    use crate::storage::OutputFile;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
    use tempfile::TempDir;

    enum Reply {
        Data(&'static [u8]),
        Fail(NetworkErrorKind),
        Stall,
    }

    struct Scripted {
        replies: Mutex<VecDeque<Reply>>,
        opens: AtomicUsize,
    }

    impl Scripted {
        fn new(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                opens: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RangeSource for Scripted {
        async fn open(&self, _uri: &str, start: u64, end: Option<u64>) -> Result<ByteStream> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let reply = self.replies.lock().pop_front();
            match reply {
                Some(Reply::Data(data)) => {
                    let end = end.map(|e| e as usize).unwrap_or(data.len()).min(data.len());
                    let slice = &data[start as usize..end];
                    let chunks: Vec<Result<Bytes>> = slice
                        .chunks(3)
                        .map(|c| Ok(Bytes::copy_from_slice(c)))
                        .collect();
                    Ok(stream::iter(chunks).boxed())
                }
                Some(Reply::Fail(kind)) => Err(EngineError::network(kind, "scripted failure")),
                Some(Reply::Stall) | None => Ok(stream::pending().boxed()),
            }
        }
    }

    fn fetcher(source: Arc<Scripted>) -> SegmentFetcher {
        let backoff = BackoffConfig {
            base_ms: 10,
            factor: 2.0,
            cap_ms: 100,
            jitter: 0.0,
        };
        SegmentFetcher::new(source, RetryPolicy::new(2, &backoff), Duration::from_secs(5), 4)
    }

    async fn output(len: u64) -> (TempDir, OutputFile) {
        let dir = tempfile::tempdir().unwrap();
        let output = OutputFile::new(dir.path(), "out.bin");
        output.create(Some(len)).await.unwrap();
        (dir, output)
    }

    const DATA: &[u8] = b"0123456789abcdefghij";

    #[tokio::test]
    async fn test_fetch_writes_segment_and_reports_progress() {
        let (_dir, output) = output(20).await;
        let source = Scripted::new(vec![Reply::Data(DATA)]);
        let segment = Segment::new(1, 5, 15);
        let mut writer = output.writer(5).await.unwrap();
        let total = AtomicI64::new(0);
        let calls = AtomicUsize::new(0);

        let written = fetcher(source)
            .fetch(
                &segment,
                &SourceEndpoint::new("mem://a"),
                None,
                &mut writer,
                &CancellationToken::new(),
                |d| {
                    total.fetch_add(d, Ordering::SeqCst);
                    calls.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await
            .unwrap();

        assert_eq!(written, 10);
        assert_eq!(total.load(Ordering::SeqCst), 10);
        // 3-byte chunks against a 4-byte progress unit: 6, then the remaining 4
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        writer.sync().await.unwrap();
        let bytes = tokio::fs::read(output.part_path()).await.unwrap();
        assert_eq!(&bytes[5..15], &DATA[5..15]);
    }

    #[tokio::test]
    async fn test_short_read_retries_then_gives_up() {
        let (_dir, output) = output(30).await;
        // DATA is only 20 bytes, every attempt comes up short
        let source = Scripted::new(vec![Reply::Data(DATA), Reply::Data(DATA), Reply::Data(DATA)]);
        let segment = Segment::new(0, 0, 30);
        let mut writer = output.writer(0).await.unwrap();
        let total = AtomicI64::new(0);

        let err = fetcher(source.clone())
            .fetch(
                &segment,
                &SourceEndpoint::new("mem://a"),
                None,
                &mut writer,
                &CancellationToken::new(),
                |d| {
                    total.fetch_add(d, Ordering::SeqCst);
                },
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind_label(), "short_read");
        assert_eq!(source.opens.load(Ordering::SeqCst), 3);
        // every failed attempt was rolled back
        assert_eq!(total.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_then_success() {
        let (_dir, output) = output(20).await;
        let source = Scripted::new(vec![
            Reply::Fail(NetworkErrorKind::ConnectionReset),
            Reply::Data(DATA),
        ]);
        let segment = Segment::new(0, 0, 20);
        let mut writer = output.writer(0).await.unwrap();

        let written = fetcher(source.clone())
            .fetch(
                &segment,
                &SourceEndpoint::new("mem://a"),
                None,
                &mut writer,
                &CancellationToken::new(),
                |_| {},
            )
            .await
            .unwrap();
        assert_eq!(written, 20);
        assert_eq!(source.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let (_dir, output) = output(20).await;
        let source = Scripted::new(vec![Reply::Fail(NetworkErrorKind::HttpStatus(404))]);
        let mut writer = output.writer(0).await.unwrap();

        let err = fetcher(source.clone())
            .fetch(
                &Segment::new(0, 0, 20),
                &SourceEndpoint::new("mem://a"),
                None,
                &mut writer,
                &CancellationToken::new(),
                |_| {},
            )
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(source.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_returns_immediately() {
        let (_dir, output) = output(20).await;
        let source = Scripted::new(vec![Reply::Data(DATA), Reply::Data(DATA)]);

        let digest = |data: &[u8]| {
            let mut h = Hasher::new(ChecksumAlgorithm::Sha1);
            h.update(data);
            h.finalize_hex()
        };
        let sums = SegmentChecksums {
            algorithm: ChecksumAlgorithm::Sha1,
            block_size: 10,
            digests: vec![digest(&DATA[..10]), digest(b"not the second block")],
        };
        let mut writer = output.writer(0).await.unwrap();

        let err = fetcher(source.clone())
            .fetch(
                &Segment::new(0, 0, 20),
                &SourceEndpoint::new("mem://a"),
                Some(&sums),
                &mut writer,
                &CancellationToken::new(),
                |_| {},
            )
            .await
            .unwrap_err();
        assert!(err.is_checksum_mismatch());
        assert_eq!(source.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_matching_checksums_pass() {
        let (_dir, output) = output(20).await;
        let source = Scripted::new(vec![Reply::Data(DATA)]);
        let digest = |data: &[u8]| {
            let mut h = Hasher::new(ChecksumAlgorithm::Sha1);
            h.update(data);
            h.finalize_hex()
        };
        let sums = SegmentChecksums {
            algorithm: ChecksumAlgorithm::Sha1,
            block_size: 8,
            digests: vec![digest(&DATA[..8]), digest(&DATA[8..16]), digest(&DATA[16..])],
        };
        let mut writer = output.writer(8).await.unwrap();

        let written = fetcher(source)
            .fetch(
                &Segment::new(1, 8, 20),
                &SourceEndpoint::new("mem://a"),
                Some(&sums),
                &mut writer,
                &CancellationToken::new(),
                |_| {},
            )
            .await
            .unwrap();
        assert_eq!(written, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_times_out_and_retries() {
        let (_dir, output) = output(20).await;
        let source = Scripted::new(vec![Reply::Stall, Reply::Data(DATA)]);
        let mut writer = output.writer(0).await.unwrap();

        let written = fetcher(source.clone())
            .fetch(
                &Segment::new(0, 0, 20),
                &SourceEndpoint::new("mem://a"),
                None,
                &mut writer,
                &CancellationToken::new(),
                |_| {},
            )
            .await
            .unwrap();
        assert_eq!(written, 20);
        assert_eq!(source.opens.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_aborts_stalled_fetch() {
        let (_dir, output) = output(20).await;
        let source = Scripted::new(vec![Reply::Stall]);
        let mut writer = output.writer(0).await.unwrap();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = fetcher(source)
            .fetch(
                &Segment::new(0, 0, 20),
                &SourceEndpoint::new("mem://a"),
                None,
                &mut writer,
                &cancel,
                |_| {},
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }
}
