//! HTTP Transport
//!
//! This module handles everything that talks to HTTP(S) endpoints:
//! - Connection pooling with an optional global rate limit
//! - Retry policy with exponential backoff and jitter
//! - Ranged GET requests with Content-Range validation
//! - Server probing (size, range support, validators, filename)
//! - Checksum computation for segments and whole files

pub mod checksum;
pub mod connection;
pub mod probe;
pub mod range;

pub use checksum::{compute_checksum, verify_checksum, BlockVerifier, Hasher};
pub use connection::{with_retry, ConnectionPool, RetryPolicy};
pub use probe::{probe_server, ServerCapabilities};
pub use range::{ByteStream, HttpRangeSource, RangeSource};
