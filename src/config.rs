//! Engine configuration
//!
//! Every tunable of a transfer session lives here and is handed to the
//! coordinator when a session starts.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the transfer engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory that receives the output file and its resume sidecar
    pub output_dir: PathBuf,

    /// Maximum number of segment fetches running at once
    pub concurrency: usize,

    /// Minimum segment size in bytes (won't split smaller than this)
    pub min_segment_size: u64,

    /// Retry attempts for a transiently failing segment
    pub max_retries: u32,

    /// Backoff between retries
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Bytes received between two progress deltas
    #[serde(default = "default_progress_chunk_size")]
    pub progress_chunk_size: u64,

    /// Longest a fetch may go without receiving data, in seconds
    #[serde(default = "default_segment_timeout_secs")]
    pub segment_timeout_secs: u64,

    /// Time in-flight fetches get to stop after a cancel, in milliseconds
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: u64,

    /// Consecutive segment failures before an endpoint is declared dead
    #[serde(default = "default_endpoint_failure_threshold")]
    pub endpoint_failure_threshold: u32,

    /// Global download speed limit (bytes/sec, None = unlimited)
    pub download_limit: Option<u64>,

    /// HTTP configuration
    #[serde(default)]
    pub http: HttpConfig,
}

/// Exponential backoff parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry in milliseconds
    pub base_ms: u64,
    /// Multiplier applied per attempt
    pub factor: f64,
    /// Upper bound for a single delay in milliseconds
    pub cap_ms: u64,
    /// Jitter factor (0.0 to 1.0)
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

/// HTTP-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Connection timeout in seconds
    pub connect_timeout: u64,

    /// Read timeout in seconds
    pub read_timeout: u64,

    /// Maximum redirects to follow
    pub max_redirects: usize,

    /// User agent sent with every request
    pub user_agent: String,

    /// Whether to accept invalid TLS certificates (dangerous!)
    pub accept_invalid_certs: bool,

    /// Proxy URL (e.g., "http://proxy:8080" or "socks5://proxy:1080")
    pub proxy_url: Option<String>,
}

fn default_progress_chunk_size() -> u64 {
    256 * 1024
}

fn default_segment_timeout_secs() -> u64 {
    60
}

fn default_cancel_grace_ms() -> u64 {
    5_000
}

fn default_endpoint_failure_threshold() -> u32 {
    3
}

fn default_jitter() -> f64 {
    0.25
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            concurrency: 16,
            min_segment_size: 1024 * 1024, // 1 MiB
            max_retries: 3,
            backoff: BackoffConfig::default(),
            progress_chunk_size: default_progress_chunk_size(),
            segment_timeout_secs: default_segment_timeout_secs(),
            cancel_grace_ms: default_cancel_grace_ms(),
            endpoint_failure_threshold: default_endpoint_failure_threshold(),
            download_limit: None,
            http: HttpConfig::default(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 500,
            factor: 2.0,
            cap_ms: 30_000,
            jitter: default_jitter(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 30,
            read_timeout: 60,
            max_redirects: 10,
            user_agent: format!("rangefetch/{}", env!("CARGO_PKG_VERSION")),
            accept_invalid_certs: false,
            proxy_url: None,
        }
    }
}

impl EngineConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the output directory
    pub fn output_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_dir = path.into();
        self
    }

    /// Set the concurrency limit
    pub fn concurrency(mut self, limit: usize) -> Self {
        self.concurrency = limit;
        self
    }

    /// Set the minimum segment size
    pub fn min_segment_size(mut self, bytes: u64) -> Self {
        self.min_segment_size = bytes;
        self
    }

    /// Set the retry budget per segment
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the backoff parameters
    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the progress granularity
    pub fn progress_chunk_size(mut self, bytes: u64) -> Self {
        self.progress_chunk_size = bytes;
        self
    }

    /// Set the per-fetch inactivity deadline
    pub fn segment_timeout(mut self, timeout: Duration) -> Self {
        self.segment_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Set the cancellation grace period
    pub fn cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace_ms = grace.as_millis() as u64;
        self
    }

    /// Set how many consecutive failures kill an endpoint
    pub fn endpoint_failure_threshold(mut self, failures: u32) -> Self {
        self.endpoint_failure_threshold = failures;
        self
    }

    /// Set global download speed limit
    pub fn download_limit(mut self, limit: Option<u64>) -> Self {
        self.download_limit = limit;
        self
    }

    /// Set the user agent
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.http.user_agent = ua.into();
        self
    }

    pub fn segment_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.segment_timeout_secs)
    }

    pub fn cancel_grace_duration(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.output_dir.exists() {
            return Err(EngineError::invalid_input(
                "output_dir",
                format!("Directory does not exist: {:?}", self.output_dir),
            ));
        }

        if !self.output_dir.is_dir() {
            return Err(EngineError::invalid_input(
                "output_dir",
                format!("Path is not a directory: {:?}", self.output_dir),
            ));
        }

        if self.concurrency == 0 {
            return Err(EngineError::invalid_input("concurrency", "Must be at least 1"));
        }

        if self.min_segment_size == 0 {
            return Err(EngineError::invalid_input(
                "min_segment_size",
                "Must be at least 1 byte",
            ));
        }

        if self.progress_chunk_size == 0 {
            return Err(EngineError::invalid_input(
                "progress_chunk_size",
                "Must be at least 1 byte",
            ));
        }

        if self.endpoint_failure_threshold == 0 {
            return Err(EngineError::invalid_input(
                "endpoint_failure_threshold",
                "Must be at least 1",
            ));
        }

        if self.backoff.factor < 1.0 {
            return Err(EngineError::invalid_input(
                "backoff.factor",
                "Must be at least 1.0",
            ));
        }

        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(EngineError::invalid_input(
                "backoff.jitter",
                "Must be between 0.0 and 1.0",
            ));
        }

        if self.backoff.base_ms > self.backoff.cap_ms {
            return Err(EngineError::invalid_input(
                "backoff",
                "Base delay must not exceed the cap",
            ));
        }

        Ok(())
    }
}
