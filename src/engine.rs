//! Transfer Engine - Main entry point
//!
//! The `TransferEngine` owns the configuration, the shared HTTP connection
//! pool and the event channel. It resolves locators into transfer requests
//! and starts one coordinator per session.

use crate::config::EngineConfig;
use crate::coordinator::{self, SessionSetup, TransferHandle};
use crate::error::{EngineError, ProtocolErrorKind, Result, StorageErrorKind};
use crate::fetch::SegmentFetcher;
use crate::http::{probe_server, ConnectionPool, HttpRangeSource, RangeSource, RetryPolicy};
use crate::locator::Locator;
use crate::protocol::{TransferEvent, TransferOutcome, TransferRequest};
use crate::storage::{OutputFile, ResumeStore, SidecarStore};
use crate::torrent::Metainfo;
use std::path::{Component, Path};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Maximum number of events to buffer
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Segmented transfer engine
pub struct TransferEngine {
    config: Arc<EngineConfig>,
    pool: Arc<ConnectionPool>,
    source: Arc<dyn RangeSource>,
    event_tx: broadcast::Sender<TransferEvent>,
}

impl TransferEngine {
    /// Create an engine fetching over HTTP(S)
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(ConnectionPool::with_limit(&config.http, config.download_limit)?);
        let source: Arc<dyn RangeSource> = Arc::new(HttpRangeSource::new(Arc::clone(&pool)));
        Ok(Self::assemble(config, pool, source))
    }

    /// Create an engine that fetches segments through a custom source
    ///
    /// Direct URLs are still probed over HTTP; only segment data comes from
    /// `source`.
    pub fn with_source(config: EngineConfig, source: Arc<dyn RangeSource>) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(ConnectionPool::with_limit(&config.http, config.download_limit)?);
        Ok(Self::assemble(config, pool, source))
    }

    fn assemble(
        config: EngineConfig,
        pool: Arc<ConnectionPool>,
        source: Arc<dyn RangeSource>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config: Arc::new(config),
            pool,
            source,
            event_tx,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe to transfer events of every session
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.event_tx.subscribe()
    }

    /// Bytes received over HTTP by all sessions
    pub fn total_downloaded(&self) -> u64 {
        self.pool.total_downloaded()
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.config.max_retries, &self.config.backoff)
    }

    /// Turn a locator into a transfer request
    ///
    /// URLs are probed for size, range support and filename. Torrent files
    /// are parsed and fetched from their web seeds. Magnet links carry no
    /// metadata and are rejected.
    pub async fn resolve(&self, locator: &Locator) -> Result<TransferRequest> {
        match locator {
            Locator::Url(url) => {
                let caps = probe_server(&self.pool, url.as_str(), &self.retry_policy()).await?;
                tracing::debug!(
                    "Probed {}: size={:?} ranges={}",
                    url,
                    caps.content_length,
                    caps.supports_range
                );
                Ok(caps.into_request(url.as_str()))
            }
            Locator::Torrent(path) => {
                let data = tokio::fs::read(path).await.map_err(|e| {
                    EngineError::storage(
                        StorageErrorKind::NotFound,
                        path,
                        format!("Failed to read torrent file: {}", e),
                    )
                })?;
                let metainfo = Metainfo::parse(&data)?;
                tracing::debug!(
                    "Parsed torrent {} ({} bytes, {} pieces)",
                    metainfo.info_hash_hex(),
                    metainfo.info.total_size,
                    metainfo.info.num_pieces()
                );
                metainfo.transfer_request()
            }
            Locator::Magnet(magnet) => Err(EngineError::invalid_input(
                "locator",
                format!(
                    "magnet {} has no metadata; resolve it to a torrent file first",
                    magnet.info_hash_hex()
                ),
            )),
        }
    }

    /// Start a session with the JSON sidecar ledger next to the output
    pub fn start(&self, request: TransferRequest) -> Result<TransferHandle> {
        check_output_name(&request.descriptor.name)?;
        let store = Arc::new(SidecarStore::new(
            &self.config.output_dir,
            &request.descriptor.name,
        ));
        self.start_with_store(request, store)
    }

    /// Start a session persisting its ledger through `store`
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_with_store(
        &self,
        request: TransferRequest,
        store: Arc<dyn ResumeStore>,
    ) -> Result<TransferHandle> {
        check_output_name(&request.descriptor.name)?;
        validate_request(&request)?;

        let fetcher = SegmentFetcher::new(
            Arc::clone(&self.source),
            self.retry_policy(),
            self.config.segment_timeout_duration(),
            self.config.progress_chunk_size,
        );

        tracing::info!(
            "Starting {} ({}) from {} endpoint(s)",
            request.descriptor.name,
            request.descriptor.content_id,
            request.endpoints.len()
        );

        Ok(coordinator::spawn(SessionSetup {
            config: Arc::clone(&self.config),
            descriptor: request.descriptor,
            endpoints: request.endpoints,
            checksum: request.checksum,
            supports_ranges: request.supports_ranges,
            fetcher,
            store,
            events: self.event_tx.clone(),
        }))
    }

    /// Resolve, fetch and wait for a locator string
    pub async fn download(&self, locator: &str) -> Result<TransferOutcome> {
        let locator = Locator::parse(locator)?;
        let request = self.resolve(&locator).await?;
        let handle = self.start(request)?;
        Ok(handle.wait().await)
    }

    /// Forget a session: remove its ledger and any leftover part file
    ///
    /// The completed output file is kept.
    pub async fn clear_session(&self, name: &str) -> Result<()> {
        check_output_name(name)?;
        SidecarStore::new(&self.config.output_dir, name).clear().await?;

        let output = OutputFile::new(&self.config.output_dir, name);
        match tokio::fs::remove_file(output.part_path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::storage(
                StorageErrorKind::Io,
                output.part_path(),
                format!("Failed to remove part file: {}", e),
            )),
        }
    }
}

/// Reject names that would escape the output directory
fn check_output_name(name: &str) -> Result<()> {
    let path = Path::new(name);
    let mut components = path.components();
    let single_normal = matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none();
    if name.is_empty() || !single_normal || name.contains(['/', '\\']) {
        return Err(EngineError::storage(
            StorageErrorKind::PathTraversal,
            path,
            format!("'{}' is not a plain file name", name),
        ));
    }
    Ok(())
}

fn validate_request(request: &TransferRequest) -> Result<()> {
    if request.endpoints.is_empty() {
        return Err(EngineError::invalid_input(
            "endpoints",
            "at least one source endpoint is required",
        ));
    }
    for endpoint in &request.endpoints {
        url::Url::parse(endpoint).map_err(|e| {
            EngineError::protocol(
                ProtocolErrorKind::InvalidUrl,
                format!("invalid endpoint '{}': {}", endpoint, e),
            )
        })?;
    }
    if request.descriptor.checksums.is_some() && request.descriptor.total_size.is_none() {
        return Err(EngineError::invalid_input(
            "descriptor",
            "block checksums need a known total size",
        ));
    }
    Ok(())
}
