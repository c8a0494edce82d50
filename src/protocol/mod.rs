//! Protocol types for rangefetch
//!
//! This module contains all types that cross the engine boundary:
//! - Content descriptors and transfer requests handed to the engine
//! - Events emitted while a session runs
//! - The outcome returned when it ends
//!
//! These types are serializable so a presentation layer can forward them
//! over any message-passing interface.

mod checksum;
mod events;
mod request;
mod types;

pub use checksum::{ChecksumAlgorithm, ExpectedChecksum};
pub use events::{ProgressEvent, TransferEvent, TransferOutcome};
pub use request::TransferRequest;
pub use types::{
    ByteRange, ContentDescriptor, EndpointHealth, SegmentChecksums, SessionId, SessionState,
};
