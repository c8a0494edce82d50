//! Ranged byte sources
//!
//! A [`RangeSource`] opens a byte stream for `[start, end)` of one endpoint.
//! The HTTP implementation issues `Range` requests and rejects responses that
//! do not cover the requested offsets.

use super::connection::{status_error, ConnectionPool};
use crate::error::{EngineError, ProtocolErrorKind, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::{ACCEPT_ENCODING, CONTENT_RANGE, RANGE};
use reqwest::StatusCode;
use std::sync::Arc;

/// Stream of body chunks for one range request
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Something that can serve byte ranges of a content
///
/// `end` is exclusive; `None` reads to the end of the content. The returned
/// stream yields exactly the bytes of the range, in order. Implementations
/// must not retry internally; retries and failover are decided by the caller.
#[async_trait]
pub trait RangeSource: Send + Sync {
    async fn open(&self, uri: &str, start: u64, end: Option<u64>) -> Result<ByteStream>;
}

/// HTTP(S) range requests through the shared connection pool
pub struct HttpRangeSource {
    pool: Arc<ConnectionPool>,
}

impl HttpRangeSource {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RangeSource for HttpRangeSource {
    async fn open(&self, uri: &str, start: u64, end: Option<u64>) -> Result<ByteStream> {
        let mut request = self
            .pool
            .client()
            .get(uri)
            // Offsets must refer to the stored bytes, not an encoded body
            .header(ACCEPT_ENCODING, "identity");
        if let Some(value) = range_header(start, end) {
            request = request.header(RANGE, value);
        }

        let response = request.send().await?;
        let status = response.status();

        let limit = match status {
            StatusCode::PARTIAL_CONTENT => {
                if let Some(value) = response.headers().get(CONTENT_RANGE) {
                    let value = value.to_str().unwrap_or_default();
                    check_content_range(value, start, end)?;
                }
                None
            }
            StatusCode::OK if start == 0 => {
                // Full body for a range at offset zero; keep only what was asked for
                end
            }
            StatusCode::OK => {
                return Err(EngineError::protocol(
                    ProtocolErrorKind::RangeNotSupported,
                    format!("{} ignored the range request for offset {}", uri, start),
                ));
            }
            StatusCode::RANGE_NOT_SATISFIABLE => {
                return Err(status_error(
                    status,
                    &format!("range {} (content may have changed)", format_range(start, end)),
                ));
            }
            _ => return Err(status_error(status, uri)),
        };

        let pool = Arc::clone(&self.pool);
        let stream: ByteStream = response
            .bytes_stream()
            .then(move |item| {
                let pool = Arc::clone(&pool);
                async move {
                    let chunk = item?;
                    pool.acquire_download(chunk.len() as u64).await;
                    pool.record_download(chunk.len() as u64);
                    Ok::<_, EngineError>(chunk)
                }
            })
            .boxed();

        Ok(match limit {
            Some(len) => take_bytes(stream, len),
            None => stream,
        })
    }
}

/// `Range` header value for `[start, end)`, `None` when the whole body is wanted
pub fn range_header(start: u64, end: Option<u64>) -> Option<String> {
    match end {
        Some(end) if end > start => Some(format!("bytes={}-{}", start, end - 1)),
        Some(_) => Some(format!("bytes={}-{}", start, start)),
        None if start > 0 => Some(format!("bytes={}-", start)),
        None => None,
    }
}

fn format_range(start: u64, end: Option<u64>) -> String {
    match end {
        Some(end) => format!("{}-{}", start, end),
        None => format!("{}-", start),
    }
}

/// Parse a Content-Range header
///
/// Format: "bytes start-end/total" or "bytes start-end/*"
pub fn parse_content_range(header: &str) -> Option<(u64, u64, Option<u64>)> {
    let rest = header.trim().strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;

    let start = start.trim().parse::<u64>().ok()?;
    let end = end.trim().parse::<u64>().ok()?;
    if end < start {
        return None;
    }
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse::<u64>().ok()?),
    };
    if total.is_some_and(|total| end >= total) {
        return None;
    }

    Some((start, end, total))
}

/// Check that a 206 response covers exactly the requested range
fn check_content_range(header: &str, start: u64, end: Option<u64>) -> Result<()> {
    let (got_start, got_end, _) = parse_content_range(header).ok_or_else(|| {
        EngineError::protocol(
            ProtocolErrorKind::InvalidResponse,
            format!("Invalid Content-Range header: {}", header),
        )
    })?;

    let start_ok = got_start == start;
    let end_ok = match end {
        Some(end) => got_end + 1 == end,
        None => true,
    };
    if !start_ok || !end_ok {
        return Err(EngineError::protocol(
            ProtocolErrorKind::InvalidResponse,
            format!(
                "Content-Range mismatch: requested {}, got {}",
                format_range(start, end),
                header
            ),
        ));
    }
    Ok(())
}

/// Cut a stream off after `len` bytes
fn take_bytes(stream: ByteStream, len: u64) -> ByteStream {
    stream
        .scan(len, |remaining, item| {
            let next = match item {
                Ok(_) if *remaining == 0 => None,
                Ok(mut chunk) => {
                    if chunk.len() as u64 > *remaining {
                        chunk.truncate(*remaining as usize);
                    }
                    *remaining -= chunk.len() as u64;
                    Some(Ok(chunk))
                }
                Err(e) => Some(Err(e)),
            };
            futures::future::ready(next)
        })
        .boxed()
}
