//! # rangefetch
//!
//! Segmented, resumable content fetching over HTTP(S).
//!
//! ## Features
//!
//! - **Segmented transfers**: Byte ranges fetched in parallel from one or more endpoints
//! - **Failover**: Endpoint health tracking with reassignment of stranded segments
//! - **Resume**: A durable ledger of verified segments survives crashes and restarts
//! - **Integrity**: Per-block checksums while streaming and whole-file checksums at the end
//! - **Torrent bootstrap**: Single-file torrents with web seeds fetched over HTTP
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rangefetch::{EngineConfig, TransferEngine, TransferEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = TransferEngine::new(EngineConfig::default().concurrency(8))?;
//!
//!     let mut events = engine.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             if let TransferEvent::Progress { progress, .. } = event {
//!                 println!("{} bytes", progress.bytes_done);
//!             }
//!         }
//!     });
//!
//!     let outcome = engine.download("https://example.com/file.iso").await?;
//!     println!("{:?}", outcome);
//!     Ok(())
//! }
//! ```

// Modules
pub mod config;
pub mod coordinator;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod http;
pub mod locator;
pub mod planner;
pub mod progress;
pub mod protocol;
pub mod storage;
pub mod torrent;

// Re-exports for convenience
pub use config::{BackoffConfig, EngineConfig, HttpConfig};
pub use coordinator::{SessionSnapshot, TransferHandle};
pub use endpoint::{EndpointPool, SourceEndpoint};
pub use engine::TransferEngine;
pub use error::{EngineError, NetworkErrorKind, ProtocolErrorKind, Result, StorageErrorKind};
pub use locator::Locator;

// Protocol exports
pub use protocol::{
    ByteRange, ChecksumAlgorithm, ContentDescriptor, EndpointHealth, ExpectedChecksum,
    ProgressEvent, SegmentChecksums, SessionId, SessionState, TransferEvent, TransferOutcome,
    TransferRequest,
};

// Storage exports
pub use storage::{
    MemoryStore, ResumeState, ResumeStore, Segment, SegmentRecord, SegmentState, SidecarStore,
};

// HTTP module exports
pub use http::{ByteStream, ConnectionPool, HttpRangeSource, RangeSource, RetryPolicy};

// Torrent exports
pub use torrent::{MagnetUri, Metainfo};
