//! Server probing
//!
//! Learns the size, range support and validators of a URL before planning,
//! and turns the answer into a [`TransferRequest`].

use super::checksum::Hasher;
use super::connection::{status_error, with_retry, ConnectionPool, RetryPolicy};
use super::range::parse_content_range;
use crate::error::Result;
use crate::protocol::{ChecksumAlgorithm, ContentDescriptor, TransferRequest};
use reqwest::header::{
    HeaderMap, HeaderName, ACCEPT_ENCODING, ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH,
    CONTENT_RANGE, ETAG, LAST_MODIFIED, RANGE,
};
use reqwest::StatusCode;
use std::path::Path;

/// Name used when neither the server nor the URL suggests one
pub const FALLBACK_NAME: &str = "download";

/// What a server told us about a URL
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerCapabilities {
    /// URL after redirects
    pub final_url: String,
    pub content_length: Option<u64>,
    pub supports_range: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub suggested_filename: Option<String>,
}

impl ServerCapabilities {
    /// Stable identity of the content behind `url`
    ///
    /// Changes when the server's validator or the size changes, so a ledger
    /// written for an older version of the file is not reused.
    pub fn content_id(&self, url: &str) -> String {
        let validator = self
            .etag
            .clone()
            .or_else(|| self.last_modified.clone())
            .unwrap_or_default();
        let size = self
            .content_length
            .map(|s| s.to_string())
            .unwrap_or_default();

        let mut hasher = Hasher::new(ChecksumAlgorithm::Sha1);
        for part in [url, "\n", validator.as_str(), "\n", size.as_str()] {
            hasher.update(part.as_bytes());
        }
        hasher.finalize_hex()
    }

    /// Output name: server suggestion, then URL path, then a fallback
    pub fn file_name(&self, url: &str) -> String {
        self.suggested_filename
            .as_deref()
            .and_then(sanitize_filename)
            .or_else(|| filename_from_url(&self.final_url).and_then(|n| sanitize_filename(&n)))
            .or_else(|| filename_from_url(url).and_then(|n| sanitize_filename(&n)))
            .unwrap_or_else(|| FALLBACK_NAME.to_string())
    }

    /// Request for fetching `url` with what the probe learned
    pub fn into_request(self, url: &str) -> TransferRequest {
        let descriptor =
            ContentDescriptor::new(self.content_id(url), self.content_length, self.file_name(url));
        TransferRequest::new(descriptor, vec![url.to_string()])
            .with_supports_ranges(self.supports_range)
    }
}

/// Probe a URL, retrying transient failures
pub async fn probe_server(
    pool: &ConnectionPool,
    url: &str,
    policy: &RetryPolicy,
) -> Result<ServerCapabilities> {
    with_retry(policy, || probe_once(pool, url)).await
}

async fn probe_once(pool: &ConnectionPool, url: &str) -> Result<ServerCapabilities> {
    let response = pool.client().head(url).send().await?;

    if response.status().is_success() {
        let final_url = response.url().to_string();
        let mut caps = capabilities_from_headers(response.headers());
        caps.final_url = final_url;
        // Accept-Ranges is optional; confirm with a one byte request when absent
        if !caps.supports_range && caps.content_length.is_some() {
            if let Ok(ranged) = probe_with_range(pool, url).await {
                caps.supports_range = ranged.supports_range;
            }
        }
        return Ok(caps);
    }

    // Some servers reject HEAD outright
    match response.status() {
        StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED | StatusCode::FORBIDDEN => {
            tracing::debug!("HEAD {} returned {}, probing with GET", url, response.status());
            probe_with_range(pool, url).await
        }
        status => Err(status_error(status, "HEAD request")),
    }
}

/// Probe with `GET` for the first byte
async fn probe_with_range(pool: &ConnectionPool, url: &str) -> Result<ServerCapabilities> {
    let response = pool
        .client()
        .get(url)
        .header(RANGE, "bytes=0-0")
        .header(ACCEPT_ENCODING, "identity")
        .send()
        .await?;

    let status = response.status();
    let final_url = response.url().to_string();
    let mut caps = capabilities_from_headers(response.headers());
    caps.final_url = final_url;

    match status {
        StatusCode::PARTIAL_CONTENT => {
            caps.supports_range = true;
            caps.content_length = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range)
                .and_then(|(_, _, total)| total);
        }
        StatusCode::OK => caps.supports_range = false,
        status => return Err(status_error(status, "ranged GET probe")),
    }
    // Body is dropped unread
    Ok(caps)
}

fn capabilities_from_headers(headers: &HeaderMap) -> ServerCapabilities {
    let header = |name: HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().to_string())
    };

    ServerCapabilities {
        final_url: String::new(),
        content_length: header(CONTENT_LENGTH).and_then(|s| s.parse::<u64>().ok()),
        supports_range: header(ACCEPT_RANGES)
            .map(|v| v.to_ascii_lowercase().contains("bytes"))
            .unwrap_or(false),
        etag: header(ETAG),
        last_modified: header(LAST_MODIFIED),
        suggested_filename: header(CONTENT_DISPOSITION)
            .as_deref()
            .and_then(parse_content_disposition),
    }
}

/// Parse filename from Content-Disposition header
///
/// `filename*=UTF-8''...` wins over a plain `filename=`.
pub fn parse_content_disposition(header: &str) -> Option<String> {
    if let Some(start) = header.find("filename*=") {
        let rest = &header[start + 10..];
        if let Some(quote_start) = rest.find("''") {
            let encoded = &rest[quote_start + 2..];
            let end = encoded.find(';').unwrap_or(encoded.len());
            if let Ok(decoded) = urlencoding::decode(encoded[..end].trim()) {
                return Some(decoded.to_string());
            }
        }
    }

    let start = header.find("filename=")?;
    let rest = &header[start + 9..];
    if let Some(stripped) = rest.strip_prefix('"') {
        let end = stripped.find('"')?;
        Some(stripped[..end].to_string())
    } else {
        let end = rest.find(';').unwrap_or(rest.len());
        Some(rest[..end].trim().to_string())
    }
}

/// Extract filename from URL path
pub fn filename_from_url(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()?
        .path_segments()?
        .next_back()
        .filter(|s| !s.is_empty())
        .map(|s| {
            urlencoding::decode(s)
                .map(|d| d.to_string())
                .unwrap_or_else(|_| s.to_string())
        })
}

/// Reduce a suggested name to a single safe path component
pub fn sanitize_filename(name: &str) -> Option<String> {
    let normalized = name.replace('\\', "/");
    let base = Path::new(&normalized).file_name()?.to_str()?.trim();
    if base.is_empty() || base == "." || base == ".." {
        return None;
    }
    Some(base.to_string())
}
