//! Test Helpers
//!
//! Builders and fakes shared by the integration tests: a torrent builder
//! with web seeds, an in-memory `RangeSource` with per-endpoint failure
//! injection, and a wiremock responder that honors `Range` headers.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt};
use parking_lot::Mutex;
use rangefetch::{
    BackoffConfig, ByteStream, EngineConfig, EngineError, MemoryStore, NetworkErrorKind,
    RangeSource, ResumeState, ResumeStore, Result, StorageErrorKind, TransferEvent,
};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use wiremock::{Request, Respond, ResponseTemplate};

/// Deterministic content of `size` bytes
pub fn test_content(size: usize) -> Vec<u8> {
    (0..size).map(|i| ((i * 7 + i / 251) % 256) as u8).collect()
}

/// Config with small segments and millisecond backoff
pub fn fast_config(dir: &Path) -> EngineConfig {
    EngineConfig::default()
        .output_dir(dir)
        .concurrency(4)
        .min_segment_size(16 * 1024)
        .max_retries(1)
        .backoff(BackoffConfig {
            base_ms: 1,
            factor: 2.0,
            cap_ms: 5,
            jitter: 0.0,
        })
        .progress_chunk_size(4096)
        .cancel_grace(Duration::from_millis(500))
}

/// Builder for single-file torrents served by web seeds
pub struct TestTorrentBuilder {
    name: String,
    piece_length: u64,
    content: Vec<u8>,
    url_list: Vec<String>,
    announce: Option<String>,
}

impl TestTorrentBuilder {
    pub fn new(name: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            piece_length: 16384, // 16KB default
            content,
            url_list: Vec::new(),
            announce: None,
        }
    }

    pub fn piece_length(mut self, length: u64) -> Self {
        self.piece_length = length;
        self
    }

    /// Add a BEP 19 web seed
    pub fn web_seed(mut self, url: impl Into<String>) -> Self {
        self.url_list.push(url.into());
        self
    }

    pub fn announce(mut self, url: impl Into<String>) -> Self {
        self.announce = Some(url.into());
        self
    }

    /// SHA-1 of every piece
    pub fn piece_hashes(&self) -> Vec<[u8; 20]> {
        self.content
            .chunks(self.piece_length as usize)
            .map(|piece| Sha1::digest(piece).into())
            .collect()
    }

    /// Bencoded info dictionary
    pub fn info_bytes(&self) -> Vec<u8> {
        let pieces: Vec<u8> = self.piece_hashes().iter().flatten().copied().collect();
        let mut info = HashMap::new();
        info.insert("length".to_string(), Bencode::Integer(self.content.len() as i64));
        info.insert("name".to_string(), Bencode::Bytes(self.name.as_bytes().to_vec()));
        info.insert(
            "piece length".to_string(),
            Bencode::Integer(self.piece_length as i64),
        );
        info.insert("pieces".to_string(), Bencode::Bytes(pieces));
        encode(&Bencode::Dict(info))
    }

    /// Expected info hash
    pub fn info_hash(&self) -> [u8; 20] {
        Sha1::digest(self.info_bytes()).into()
    }

    /// Bencoded torrent file
    ///
    /// The info dict is spliced in raw so its bytes match `info_bytes()`.
    /// Root keys are written in sorted order.
    pub fn build(&self) -> Vec<u8> {
        let key = |k: &str| encode(&Bencode::Bytes(k.as_bytes().to_vec()));
        let mut out = vec![b'd'];
        if let Some(ref announce) = self.announce {
            out.extend(key("announce"));
            out.extend(encode(&Bencode::Bytes(announce.clone().into_bytes())));
        }
        out.extend(key("info"));
        out.extend(self.info_bytes());
        if !self.url_list.is_empty() {
            let seeds = self
                .url_list
                .iter()
                .map(|u| Bencode::Bytes(u.clone().into_bytes()))
                .collect();
            out.extend(key("url-list"));
            out.extend(encode(&Bencode::List(seeds)));
        }
        out.push(b'e');
        out
    }
}

enum Bencode {
    Integer(i64),
    Bytes(Vec<u8>),
    List(Vec<Bencode>),
    Dict(HashMap<String, Bencode>),
}

fn encode(value: &Bencode) -> Vec<u8> {
    match value {
        Bencode::Integer(i) => format!("i{}e", i).into_bytes(),
        Bencode::Bytes(b) => {
            let mut result = format!("{}:", b.len()).into_bytes();
            result.extend_from_slice(b);
            result
        }
        Bencode::List(list) => {
            let mut result = vec![b'l'];
            for item in list {
                result.extend(encode(item));
            }
            result.push(b'e');
            result
        }
        Bencode::Dict(dict) => {
            // Keys must be sorted
            let mut keys: Vec<_> = dict.keys().collect();
            keys.sort();

            let mut result = vec![b'd'];
            for key in keys {
                result.extend(encode(&Bencode::Bytes(key.as_bytes().to_vec())));
                result.extend(encode(&dict[key]));
            }
            result.push(b'e');
            result
        }
    }
}

/// How an in-memory endpoint answers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Serve,
    /// Serves the right length with every byte flipped
    Corrupt,
    /// Connection refused on every open
    Refuse,
    /// 404 for ranges starting at or after the offset
    MissingFrom(u64),
    /// Never sends data for ranges starting at or after the offset
    StallFrom(u64),
}

/// `RangeSource` serving one byte string from any number of fake endpoints
pub struct MemorySource {
    content: Bytes,
    chunk_size: usize,
    behaviors: Mutex<HashMap<String, Behavior>>,
    opens: Mutex<Vec<(String, u64)>>,
}

impl MemorySource {
    pub fn new(content: Vec<u8>) -> Self {
        Self {
            content: Bytes::from(content),
            chunk_size: 4096,
            behaviors: Mutex::new(HashMap::new()),
            opens: Mutex::new(Vec::new()),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Endpoints without a behavior serve normally
    pub fn set(&self, uri: &str, behavior: Behavior) {
        self.behaviors.lock().insert(uri.to_string(), behavior);
    }

    pub fn total_opens(&self) -> usize {
        self.opens.lock().len()
    }

    pub fn opens_for(&self, uri: &str) -> usize {
        self.opens.lock().iter().filter(|(u, _)| u == uri).count()
    }

    /// Sorted, deduplicated start offsets that were requested
    pub fn requested_starts(&self) -> Vec<u64> {
        let mut starts: Vec<u64> = self.opens.lock().iter().map(|(_, s)| *s).collect();
        starts.sort_unstable();
        starts.dedup();
        starts
    }

    pub fn clear_opens(&self) {
        self.opens.lock().clear();
    }
}

#[async_trait]
impl RangeSource for MemorySource {
    async fn open(&self, uri: &str, start: u64, end: Option<u64>) -> Result<ByteStream> {
        self.opens.lock().push((uri.to_string(), start));
        let behavior = self
            .behaviors
            .lock()
            .get(uri)
            .copied()
            .unwrap_or(Behavior::Serve);

        let len = self.content.len() as u64;
        let end = end.unwrap_or(len).min(len);
        let mut data = self.content.slice(start.min(end) as usize..end as usize);

        match behavior {
            Behavior::Serve => {}
            Behavior::Corrupt => data = data.iter().map(|b| !b).collect::<Vec<u8>>().into(),
            Behavior::Refuse => {
                return Err(EngineError::network(
                    NetworkErrorKind::ConnectionRefused,
                    format!("{} refused the connection", uri),
                ))
            }
            Behavior::MissingFrom(offset) if start >= offset => {
                return Err(EngineError::network(
                    NetworkErrorKind::HttpStatus(404),
                    format!("{} has no bytes at {}", uri, start),
                ))
            }
            Behavior::StallFrom(offset) if start >= offset => {
                return Ok(stream::pending().boxed());
            }
            Behavior::MissingFrom(_) | Behavior::StallFrom(_) => {}
        }

        let chunks: Vec<Result<Bytes>> = (0..data.len())
            .step_by(self.chunk_size)
            .map(|i| Ok(data.slice(i..(i + self.chunk_size).min(data.len()))))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }
}

/// What a `FaultyStore` does once its good saves are used up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFault {
    /// Save fails with an I/O storage error
    Fail,
    /// Save never returns
    Hang,
}

/// Ledger store that behaves after `good_saves` successful saves
pub struct FaultyStore {
    inner: MemoryStore,
    good_saves: usize,
    fault: StoreFault,
    saves: AtomicUsize,
}

impl FaultyStore {
    pub fn new(good_saves: usize, fault: StoreFault) -> Self {
        Self {
            inner: MemoryStore::new(),
            good_saves,
            fault,
            saves: AtomicUsize::new(0),
        }
    }

    pub fn current(&self) -> Option<ResumeState> {
        self.inner.current()
    }
}

#[async_trait]
impl ResumeStore for FaultyStore {
    async fn load(&self) -> Result<Option<ResumeState>> {
        self.inner.load().await
    }

    async fn save(&self, state: &ResumeState) -> Result<()> {
        if self.saves.fetch_add(1, Ordering::SeqCst) < self.good_saves {
            return self.inner.save(state).await;
        }
        match self.fault {
            StoreFault::Fail => Err(EngineError::storage(
                StorageErrorKind::Io,
                "data.bin.rfstate",
                "No space left on device",
            )),
            StoreFault::Hang => futures::future::pending().await,
        }
    }

    async fn clear(&self) -> Result<()> {
        self.inner.clear().await
    }
}

/// wiremock responder serving byte ranges of `content`
pub struct RangeResponder {
    pub content: Vec<u8>,
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let total = self.content.len() as u64;
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("bytes="))
            .and_then(|v| v.split_once('-'));

        let Some((start, end)) = range else {
            return ResponseTemplate::new(200).set_body_bytes(self.content.clone());
        };
        let start: u64 = start.parse().unwrap_or(0);
        let last = end
            .parse::<u64>()
            .map(|e| e.min(total - 1))
            .unwrap_or(total - 1);
        if start > last {
            return ResponseTemplate::new(416)
                .insert_header("content-range", format!("bytes */{}", total).as_str());
        }

        ResponseTemplate::new(206)
            .insert_header(
                "content-range",
                format!("bytes {}-{}/{}", start, last, total).as_str(),
            )
            .set_body_bytes(self.content[start as usize..=last as usize].to_vec())
    }
}

/// Wait for the first event matching `predicate`
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<TransferEvent>,
    timeout: Duration,
    predicate: F,
) -> Option<TransferEvent>
where
    F: Fn(&TransferEvent) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Poll `condition` every 10ms until it holds or `timeout_ms` passes
pub async fn wait_for<F>(timeout_ms: u64, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    let timeout = Duration::from_millis(timeout_ms);

    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_torrent_builder_pieces() {
        let builder = TestTorrentBuilder::new("t.bin", vec![0u8; 4096]).piece_length(1024);
        assert_eq!(builder.piece_hashes().len(), 4);

        let data = builder.build();
        assert!(data.starts_with(b"d"));
        assert!(data.ends_with(b"e"));
    }

    #[test]
    fn test_info_bytes_spliced_verbatim() {
        let builder = TestTorrentBuilder::new("t.bin", test_content(100))
            .web_seed("http://seed.test/t.bin")
            .announce("http://tracker.test/announce");
        let data = builder.build();
        let info = builder.info_bytes();
        assert!(data.windows(info.len()).any(|w| w == info.as_slice()));
    }

    #[tokio::test]
    async fn test_memory_source_behaviors() {
        let source = MemorySource::new(test_content(10_000));
        source.set("http://bad.test/f", Behavior::Refuse);
        source.set("http://half.test/f", Behavior::MissingFrom(5_000));

        let mut stream = source.open("http://ok.test/f", 100, Some(9_000)).await.unwrap();
        let mut received = Vec::new();
        while let Some(chunk) = stream.next().await {
            received.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(received, test_content(10_000)[100..9_000]);

        assert!(source.open("http://bad.test/f", 0, None).await.is_err());
        assert!(source.open("http://half.test/f", 0, Some(10)).await.is_ok());
        assert!(source.open("http://half.test/f", 5_000, None).await.is_err());
        assert_eq!(source.total_opens(), 4);
        assert_eq!(source.opens_for("http://half.test/f"), 2);
    }
}
