//! Transfer requests
//!
//! What a resolver hands to the engine: the content, where to get it, and
//! how to check it.

use super::checksum::ExpectedChecksum;
use super::types::ContentDescriptor;
use serde::{Deserialize, Serialize};

/// A resolved transfer, ready to be planned
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub descriptor: ContentDescriptor,
    /// Source endpoint URIs, primary first
    pub endpoints: Vec<String>,
    /// Expected checksum of the finished file
    pub checksum: Option<ExpectedChecksum>,
    /// Tracker/peer hints for an external swarm collaborator
    #[serde(default)]
    pub tracker_hints: Vec<String>,
    /// Whether the sources honor byte-range requests
    pub supports_ranges: bool,
}

impl TransferRequest {
    pub fn new(descriptor: ContentDescriptor, endpoints: Vec<String>) -> Self {
        Self {
            descriptor,
            endpoints,
            checksum: None,
            tracker_hints: Vec::new(),
            supports_ranges: true,
        }
    }

    /// Add mirror endpoints, skipping duplicates
    pub fn with_mirrors<I, S>(mut self, mirrors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for mirror in mirrors {
            let mirror = mirror.into();
            if !self.endpoints.contains(&mirror) {
                self.endpoints.push(mirror);
            }
        }
        self
    }

    /// Override the output filename
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.descriptor.name = name.into();
        self
    }

    pub fn with_checksum(mut self, checksum: ExpectedChecksum) -> Self {
        self.checksum = Some(checksum);
        self
    }

    pub fn with_supports_ranges(mut self, supports_ranges: bool) -> Self {
        self.supports_ranges = supports_ranges;
        self
    }

    pub fn with_tracker_hints(mut self, hints: Vec<String>) -> Self {
        self.tracker_hints = hints;
        self
    }
}
