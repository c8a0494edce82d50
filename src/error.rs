//! Typed error hierarchy for rangefetch
//!
//! Every error carries enough context to tell whether a segment fetch may be
//! retried, and session-fatal errors carry the byte ranges that never
//! completed.

use std::path::PathBuf;
use thiserror::Error;

use crate::protocol::ByteRange;

/// Main error type for the transfer engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Network-related errors (unreachable endpoint, timeout, short read, ...)
    #[error("Network error: {message}")]
    Network {
        kind: NetworkErrorKind,
        message: String,
        retryable: bool,
    },

    /// Storage/filesystem errors
    #[error("Storage error at {path:?}: {message}")]
    Storage {
        kind: StorageErrorKind,
        path: PathBuf,
        message: String,
    },

    /// Protocol-level errors (metadata, HTTP semantics, integrity)
    #[error("Protocol error: {message}")]
    Protocol {
        kind: ProtocolErrorKind,
        message: String,
    },

    /// Every source endpoint is dead; the listed ranges could not complete
    #[error("No healthy endpoints left ({} range(s) incomplete)", failed_ranges.len())]
    NoHealthyEndpoints { failed_ranges: Vec<ByteRange> },

    /// Invalid input from the caller
    #[error("Invalid input for '{field}': {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    /// Invalid state transition
    #[error("Invalid state: cannot {action} while {current_state}")]
    InvalidState {
        action: &'static str,
        current_state: String,
    },

    /// The transfer was cancelled
    #[error("Transfer cancelled")]
    Cancelled,

    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Network error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Endpoint could not be reached at all
    Unreachable,
    /// Connection refused
    ConnectionRefused,
    /// Connection reset mid-transfer
    ConnectionReset,
    /// No data within the segment deadline
    Timeout,
    /// Stream ended before the segment range was filled
    ShortRead,
    /// Server returned an error status
    HttpStatus(u16),
    /// Too many redirects
    TooManyRedirects,
    /// Other network error
    Other,
}

/// Storage error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// File/directory not found
    NotFound,
    /// Permission denied
    PermissionDenied,
    /// Name would escape the output directory
    PathTraversal,
    /// File already exists
    AlreadyExists,
    /// Resume sidecar unreadable or inconsistent with the content
    ResumeStateCorrupt,
    /// I/O error
    Io,
}

/// Protocol error subtypes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolErrorKind {
    /// Torrent metadata lacks a required structure
    MalformedMetadata,
    /// Bencode decoding failed
    BencodeParse,
    /// Invalid URL
    InvalidUrl,
    /// Invalid magnet URI
    InvalidMagnet,
    /// Invalid HTTP response
    InvalidResponse,
    /// Server ignores range requests
    RangeNotSupported,
    /// Segment or file digest did not match
    ChecksumMismatch,
    /// Total size unknown or zero at plan time
    InvalidSize,
}

impl EngineError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { retryable, .. } => *retryable,
            Self::Storage { kind, .. } => matches!(kind, StorageErrorKind::Io),
            _ => false,
        }
    }

    /// Create a network error
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        let retryable = match kind {
            NetworkErrorKind::Unreachable
            | NetworkErrorKind::ConnectionRefused
            | NetworkErrorKind::ConnectionReset
            | NetworkErrorKind::Timeout
            | NetworkErrorKind::ShortRead => true,
            NetworkErrorKind::HttpStatus(status) => status >= 500 || status == 429,
            NetworkErrorKind::TooManyRedirects | NetworkErrorKind::Other => false,
        };
        Self::Network {
            kind,
            message: message.into(),
            retryable,
        }
    }

    /// Create a storage error
    pub fn storage(
        kind: StorageErrorKind,
        path: impl Into<PathBuf>,
        message: impl Into<String>,
    ) -> Self {
        Self::Storage {
            kind,
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a protocol error
    pub fn protocol(kind: ProtocolErrorKind, message: impl Into<String>) -> Self {
        Self::Protocol {
            kind,
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }

    /// Shorthand for a malformed torrent structure
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::protocol(ProtocolErrorKind::MalformedMetadata, message)
    }

    /// Shorthand for an unusable resume sidecar
    pub fn resume_corrupt(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::storage(StorageErrorKind::ResumeStateCorrupt, path, message)
    }

    pub fn is_checksum_mismatch(&self) -> bool {
        matches!(
            self,
            Self::Protocol {
                kind: ProtocolErrorKind::ChecksumMismatch,
                ..
            }
        )
    }

    pub fn is_invalid_size(&self) -> bool {
        matches!(
            self,
            Self::Protocol {
                kind: ProtocolErrorKind::InvalidSize,
                ..
            }
        )
    }

    pub fn is_resume_corrupt(&self) -> bool {
        matches!(
            self,
            Self::Storage {
                kind: StorageErrorKind::ResumeStateCorrupt,
                ..
            }
        )
    }

    /// Short machine-readable label used in events and logs
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::Network { kind, .. } => match kind {
                NetworkErrorKind::Unreachable
                | NetworkErrorKind::ConnectionRefused
                | NetworkErrorKind::ConnectionReset => "endpoint_unreachable",
                NetworkErrorKind::Timeout => "segment_timeout",
                NetworkErrorKind::ShortRead => "short_read",
                NetworkErrorKind::HttpStatus(_) => "http_status",
                NetworkErrorKind::TooManyRedirects | NetworkErrorKind::Other => "network",
            },
            Self::Protocol { kind, .. } => match kind {
                ProtocolErrorKind::MalformedMetadata | ProtocolErrorKind::BencodeParse => {
                    "malformed_metadata"
                }
                ProtocolErrorKind::ChecksumMismatch => "checksum_mismatch",
                ProtocolErrorKind::InvalidSize => "invalid_size",
                _ => "protocol",
            },
            Self::Storage { kind, .. } => match kind {
                StorageErrorKind::ResumeStateCorrupt => "resume_state_corrupt",
                _ => "storage",
            },
            Self::NoHealthyEndpoints { .. } => "no_healthy_endpoints",
            Self::InvalidInput { .. } => "invalid_input",
            Self::InvalidState { .. } => "invalid_state",
            Self::Cancelled => "cancelled",
            Self::Internal(_) => "internal",
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        let kind = match err.kind() {
            ErrorKind::NotFound => StorageErrorKind::NotFound,
            ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            ErrorKind::AlreadyExists => StorageErrorKind::AlreadyExists,
            _ => StorageErrorKind::Io,
        };
        Self::Storage {
            kind,
            path: PathBuf::new(),
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            NetworkErrorKind::Timeout
        } else if err.is_connect() {
            NetworkErrorKind::Unreachable
        } else if err.is_redirect() {
            NetworkErrorKind::TooManyRedirects
        } else if let Some(status) = err.status() {
            NetworkErrorKind::HttpStatus(status.as_u16())
        } else if err.is_body() || err.is_decode() {
            NetworkErrorKind::ConnectionReset
        } else {
            NetworkErrorKind::Other
        };

        Self::network(kind, err.to_string())
    }
}

impl From<url::ParseError> for EngineError {
    fn from(err: url::ParseError) -> Self {
        Self::Protocol {
            kind: ProtocolErrorKind::InvalidUrl,
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {}", err))
    }
}
