//! Torrent metadata
//!
//! This module turns torrent metadata into something the segmented fetcher
//! can consume:
//! - Bencode decoding with raw byte spans for the info hash
//! - Metainfo parsing (file layout, piece hashes, trackers, web seeds)
//! - Magnet URI parsing and generation
//!
//! Peer discovery and the peer-wire protocol are left to an external
//! collaborator; single-file torrents with web seeds are fetched over HTTP.

pub mod bencode;
pub mod magnet;
pub mod metainfo;

pub use bencode::BencodeValue;
pub use magnet::MagnetUri;
pub use metainfo::{FileInfo, Info, Metainfo, Sha1Hash};
