//! Torrent Metainfo Parser
//!
//! Parses .torrent files (BEP 3) into the pieces the fetcher needs: the
//! info hash that names the content, the file layout, the piece hashes used
//! to verify segments, and the tracker and web seed hints.

use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::bencode::{info_dict_bytes, BencodeValue};
use super::magnet::MagnetUri;
use crate::error::{EngineError, Result};
use crate::protocol::{ChecksumAlgorithm, ContentDescriptor, SegmentChecksums, TransferRequest};

/// SHA-1 hash (20 bytes)
pub type Sha1Hash = [u8; 20];

/// Parsed torrent metainfo
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// SHA-1 hash of the raw bencoded info dictionary
    pub info_hash: Sha1Hash,
    pub info: Info,
    /// Primary announce URL
    pub announce: Option<String>,
    /// Announce list (BEP 12), one inner list per tier
    pub announce_list: Vec<Vec<String>>,
    /// Creation timestamp (Unix epoch)
    pub creation_date: Option<i64>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    /// Web seed URLs (BEP 19 GetRight-style)
    pub url_list: Vec<String>,
    /// HTTP seeds (BEP 17 Hoffman-style)
    pub httpseeds: Vec<String>,
}

/// The info dictionary
#[derive(Debug, Clone)]
pub struct Info {
    /// Suggested name for the file or directory
    pub name: String,
    /// Number of bytes per piece
    pub piece_length: u64,
    /// SHA-1 hash of each piece
    pub pieces: Vec<Sha1Hash>,
    pub files: Vec<FileInfo>,
    /// Total size of all files
    pub total_size: u64,
    pub is_single_file: bool,
    /// Private flag (BEP 27)
    pub private: bool,
}

/// A single file in the torrent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Path components joined (multi-file) or just the name (single-file)
    pub path: PathBuf,
    pub length: u64,
    /// Byte offset in the concatenated file stream
    pub offset: u64,
}

type Dict = BTreeMap<Vec<u8>, BencodeValue>;

fn get<'a>(dict: &'a Dict, key: &str) -> Option<&'a BencodeValue> {
    dict.get(key.as_bytes())
}

fn get_string(dict: &Dict, key: &str) -> Option<String> {
    get(dict, key).and_then(|v| v.as_string()).map(String::from)
}

impl Metainfo {
    /// Parse a .torrent file from bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        // Locating the raw info bytes also validates the root structure
        let info_bytes = info_dict_bytes(data)?;
        let info_hash: Sha1Hash = Sha1::digest(info_bytes).into();

        let root = BencodeValue::parse(data)?;
        let dict = root
            .as_dict()
            .ok_or_else(|| EngineError::malformed("Root must be a dictionary"))?;
        let info = get(dict, "info")
            .ok_or_else(|| EngineError::malformed("Missing 'info' dictionary"))
            .and_then(Self::parse_info)?;

        Ok(Metainfo {
            info_hash,
            info,
            announce: get_string(dict, "announce"),
            announce_list: Self::parse_announce_list(get(dict, "announce-list")),
            creation_date: get(dict, "creation date").and_then(|v| v.as_int()),
            comment: get_string(dict, "comment"),
            created_by: get_string(dict, "created by"),
            url_list: Self::parse_url_list(get(dict, "url-list")),
            httpseeds: Self::parse_url_list(get(dict, "httpseeds")),
        })
    }

    fn parse_info(value: &BencodeValue) -> Result<Info> {
        let dict = value
            .as_dict()
            .ok_or_else(|| EngineError::malformed("'info' must be a dictionary"))?;

        let name = get_string(dict, "name")
            .filter(|n| !n.is_empty())
            .ok_or_else(|| EngineError::malformed("Missing 'name' in info"))?;

        let piece_length = get(dict, "piece length")
            .and_then(|v| v.as_uint())
            .filter(|&len| len > 0)
            .ok_or_else(|| EngineError::malformed("Missing or invalid 'piece length'"))?;

        let pieces_bytes = get(dict, "pieces")
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| EngineError::malformed("Missing 'pieces'"))?;
        if pieces_bytes.len() % 20 != 0 {
            return Err(EngineError::malformed(format!(
                "Invalid pieces length: {} (not a multiple of 20)",
                pieces_bytes.len()
            )));
        }
        let pieces: Vec<Sha1Hash> = pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let private = get(dict, "private").and_then(|v| v.as_int()) == Some(1);

        let (files, total_size, is_single_file) = match get(dict, "files") {
            Some(files) => {
                let (files, total) = Self::parse_files(files)?;
                (files, total, false)
            }
            None => {
                let length = get(dict, "length")
                    .and_then(|v| v.as_uint())
                    .ok_or_else(|| {
                        EngineError::malformed("Missing 'length' for single-file torrent")
                    })?;
                let file = FileInfo {
                    path: PathBuf::from(&name),
                    length,
                    offset: 0,
                };
                (vec![file], length, true)
            }
        };

        let expected_pieces = total_size.div_ceil(piece_length);
        if pieces.len() as u64 != expected_pieces {
            return Err(EngineError::malformed(format!(
                "Piece count mismatch: have {}, expected {} for {} bytes with {} byte pieces",
                pieces.len(),
                expected_pieces,
                total_size,
                piece_length
            )));
        }

        Ok(Info {
            name,
            piece_length,
            pieces,
            files,
            total_size,
            is_single_file,
            private,
        })
    }

    fn parse_files(value: &BencodeValue) -> Result<(Vec<FileInfo>, u64)> {
        let list = value
            .as_list()
            .ok_or_else(|| EngineError::malformed("'files' must be a list"))?;

        let mut files = Vec::with_capacity(list.len());
        let mut offset = 0u64;
        for entry in list {
            let entry = entry
                .as_dict()
                .ok_or_else(|| EngineError::malformed("File entry must be a dictionary"))?;
            let length = get(entry, "length")
                .and_then(|v| v.as_uint())
                .ok_or_else(|| EngineError::malformed("Missing 'length' in file entry"))?;
            let components = get(entry, "path")
                .and_then(|v| v.as_list())
                .ok_or_else(|| EngineError::malformed("'path' must be a list of strings"))?;

            let mut path = PathBuf::new();
            for component in components {
                let part = component
                    .as_string()
                    .ok_or_else(|| EngineError::malformed("Path component must be a string"))?;
                if part.is_empty() || part == "." || part == ".." || part.contains(['/', '\\']) {
                    return Err(EngineError::malformed(format!(
                        "Unsafe path component {:?}",
                        part
                    )));
                }
                path.push(part);
            }
            if path.as_os_str().is_empty() {
                return Err(EngineError::malformed("Empty path in file entry"));
            }

            files.push(FileInfo {
                path,
                length,
                offset,
            });
            offset = offset
                .checked_add(length)
                .ok_or_else(|| EngineError::malformed("Total size overflows"))?;
        }

        if files.is_empty() {
            return Err(EngineError::malformed("'files' is empty"));
        }
        Ok((files, offset))
    }

    /// Tiers are kept in order; empty tiers and non-string entries are dropped
    fn parse_announce_list(value: Option<&BencodeValue>) -> Vec<Vec<String>> {
        let Some(tiers) = value.and_then(|v| v.as_list()) else {
            return Vec::new();
        };

        tiers
            .iter()
            .filter_map(|tier| tier.as_list())
            .map(|urls| {
                urls.iter()
                    .filter_map(|url| url.as_string())
                    .filter(|url| !url.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .filter(|tier| !tier.is_empty())
            .collect()
    }

    /// Parse url-list or httpseeds; accepts a single string or a list
    fn parse_url_list(value: Option<&BencodeValue>) -> Vec<String> {
        let is_http = |s: &&str| s.starts_with("http://") || s.starts_with("https://");
        match value {
            Some(BencodeValue::Bytes(_)) => value
                .and_then(|v| v.as_string())
                .filter(is_http)
                .map(|s| vec![s.to_string()])
                .unwrap_or_default(),
            Some(BencodeValue::List(list)) => list
                .iter()
                .filter_map(|item| item.as_string())
                .filter(is_http)
                .map(String::from)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Get the info_hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// `announce` followed by every announce-list tier, deduplicated
    pub fn all_trackers(&self) -> Vec<String> {
        let mut trackers: Vec<String> = Vec::new();
        let tiers = self.announce_list.iter().flatten();
        for url in self.announce.iter().chain(tiers) {
            if !trackers.contains(url) {
                trackers.push(url.clone());
            }
        }
        trackers
    }

    /// Hints handed to a swarm collaborator: trackers, then BEP 17 seeds
    pub fn tracker_hints(&self) -> Vec<String> {
        let mut hints = self.all_trackers();
        for seed in &self.httpseeds {
            if !hints.contains(seed) {
                hints.push(seed.clone());
            }
        }
        hints
    }

    /// Byte range of a piece (the last piece may be shorter)
    pub fn piece_range(&self, index: usize) -> Option<(u64, u64)> {
        if index >= self.info.pieces.len() {
            return None;
        }
        let start = index as u64 * self.info.piece_length;
        let end = (start + self.info.piece_length).min(self.info.total_size);
        Some((start, end))
    }

    /// Piece hashes as per-block checksums
    pub fn piece_checksums(&self) -> SegmentChecksums {
        SegmentChecksums {
            algorithm: ChecksumAlgorithm::Sha1,
            block_size: self.info.piece_length,
            digests: self.info.pieces.iter().map(hex::encode).collect(),
        }
    }

    /// Content descriptor named by the info hash
    pub fn descriptor(&self) -> ContentDescriptor {
        let total = (self.info.total_size > 0).then_some(self.info.total_size);
        ContentDescriptor::new(self.info_hash_hex(), total, self.info.name.clone())
            .with_checksums(self.piece_checksums())
    }

    /// HTTP endpoints serving the whole file (BEP 19)
    ///
    /// Only single-file torrents map onto one ranged resource. A url-list
    /// entry ending in `/` names a directory, so the file name is appended.
    pub fn webseed_endpoints(&self) -> Vec<String> {
        if !self.info.is_single_file {
            return Vec::new();
        }
        let name = urlencoding::encode(&self.info.name);
        let mut endpoints: Vec<String> = Vec::new();
        for base in &self.url_list {
            let url = if base.ends_with('/') {
                format!("{}{}", base, name)
            } else {
                base.clone()
            };
            if !endpoints.contains(&url) {
                endpoints.push(url);
            }
        }
        endpoints
    }

    /// Transfer request fetching the content from its web seeds
    pub fn transfer_request(&self) -> Result<TransferRequest> {
        if !self.info.is_single_file {
            return Err(EngineError::invalid_input(
                "locator",
                "multi-file torrents need a swarm collaborator to fetch",
            ));
        }
        let endpoints = self.webseed_endpoints();
        if endpoints.is_empty() {
            return Err(EngineError::invalid_input(
                "locator",
                format!(
                    "torrent {} has no web seeds; peer discovery is delegated",
                    self.info_hash_hex()
                ),
            ));
        }
        Ok(TransferRequest::new(self.descriptor(), endpoints)
            .with_tracker_hints(self.tracker_hints()))
    }

    /// Magnet locator carrying the info hash, name and trackers
    pub fn magnet(&self) -> MagnetUri {
        MagnetUri {
            info_hash: self.info_hash,
            display_name: Some(self.info.name.clone()),
            trackers: self.all_trackers(),
            web_seeds: self.url_list.clone(),
            exact_length: Some(self.info.total_size),
        }
    }
}

impl Info {
    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_torrent(extra_root: &[u8]) -> Vec<u8> {
        // 100 bytes, 32 KiB pieces, one zeroed piece hash
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce35:http://tracker.example.com/announce");
        data.extend_from_slice(extra_root);
        data.extend_from_slice(b"4:infod6:lengthi100e4:name8:test.txt12:piece lengthi32768e");
        data.extend_from_slice(b"6:pieces20:");
        data.extend_from_slice(&[0u8; 20]);
        data.extend_from_slice(b"ee");
        data
    }

    #[test]
    fn test_parse_single_file_torrent() {
        let metainfo = Metainfo::parse(&single_file_torrent(b"")).unwrap();

        assert_eq!(metainfo.info.name, "test.txt");
        assert_eq!(metainfo.info.piece_length, 32768);
        assert_eq!(metainfo.info.total_size, 100);
        assert_eq!(metainfo.info.num_pieces(), 1);
        assert!(metainfo.info.is_single_file);
        assert_eq!(
            metainfo.announce.as_deref(),
            Some("http://tracker.example.com/announce")
        );
        assert_eq!(metainfo.piece_range(0), Some((0, 100)));
        assert_eq!(metainfo.piece_range(1), None);
    }

    #[test]
    fn test_info_hash_is_sha1_of_raw_info() {
        let data = single_file_torrent(b"");
        let metainfo = Metainfo::parse(&data).unwrap();
        let raw = info_dict_bytes(&data).unwrap();
        assert_eq!(metainfo.info_hash_hex(), hex::encode(Sha1::digest(raw)));
        assert_eq!(metainfo.info_hash_hex().len(), 40);

        // Same bytes in, same identifier out
        let again = Metainfo::parse(&data).unwrap();
        assert_eq!(metainfo.info_hash, again.info_hash);
    }

    #[test]
    fn test_announce_list_flattened_in_tier_order() {
        let extra = b"13:announce-listll35:http://tracker.example.com/announce16:udp://t2.test:80eel16:udp://t3.test:80ee";
        let metainfo = Metainfo::parse(&single_file_torrent(extra)).unwrap();
        assert_eq!(
            metainfo.all_trackers(),
            vec![
                "http://tracker.example.com/announce",
                "udp://t2.test:80",
                "udp://t3.test:80"
            ]
        );
    }

    #[test]
    fn test_webseed_endpoints() {
        let extra = b"8:url-listl21:http://seed.test/dir/22:http://seed.test/a.bin3:ftpe";
        let metainfo = Metainfo::parse(&single_file_torrent(extra)).unwrap();
        assert_eq!(
            metainfo.webseed_endpoints(),
            vec!["http://seed.test/dir/test.txt", "http://seed.test/a.bin"]
        );

        let request = metainfo.transfer_request().unwrap();
        assert_eq!(request.descriptor.content_id, metainfo.info_hash_hex());
        assert_eq!(request.descriptor.total_size, Some(100));
        assert!(request.descriptor.checksums.is_some());
    }

    #[test]
    fn test_torrent_without_seeds_is_not_fetchable() {
        let metainfo = Metainfo::parse(&single_file_torrent(b"")).unwrap();
        assert!(metainfo.transfer_request().is_err());
    }

    #[test]
    fn test_multi_file_layout() {
        let mut data = Vec::new();
        data.extend_from_slice(b"d4:infod5:filesl");
        data.extend_from_slice(b"d6:lengthi10e4:pathl1:a5:b.bineed6:lengthi5e4:pathl5:c.bonee");
        data.extend_from_slice(b"e4:name3:dir12:piece lengthi16e6:pieces20:");
        data.extend_from_slice(&[1u8; 20]);
        data.extend_from_slice(b"ee");

        let metainfo = Metainfo::parse(&data).unwrap();
        assert!(!metainfo.info.is_single_file);
        assert_eq!(metainfo.info.total_size, 15);
        assert_eq!(metainfo.info.files[1].offset, 10);
        assert_eq!(metainfo.info.files[0].path, PathBuf::from("a").join("b.bin"));
        assert!(metainfo.webseed_endpoints().is_empty());
    }

    #[test]
    fn test_rejects_traversal_in_file_path() {
        let mut data = Vec::new();
        data.extend_from_slice(b"d4:infod5:filesld6:lengthi5e4:pathl2:..6:escapeee");
        data.extend_from_slice(b"e4:name3:dir12:piece lengthi16e6:pieces20:");
        data.extend_from_slice(&[1u8; 20]);
        data.extend_from_slice(b"ee");
        assert!(Metainfo::parse(&data).is_err());
    }

    #[test]
    fn test_malformed_structures() {
        assert!(Metainfo::parse(b"d8:announce3:urle").is_err());
        // pieces not a multiple of 20
        assert!(Metainfo::parse(b"d4:infod6:lengthi1e4:name1:x12:piece lengthi1e6:pieces3:abcee").is_err());
        // piece count does not cover the length
        let mut data = b"d4:infod6:lengthi100e4:name1:x12:piece lengthi10e6:pieces20:".to_vec();
        data.extend_from_slice(&[0u8; 20]);
        data.extend_from_slice(b"ee");
        let err = Metainfo::parse(&data).unwrap_err();
        assert_eq!(err.kind_label(), "malformed_metadata");
    }

    #[test]
    fn test_magnet_from_metainfo() {
        let metainfo = Metainfo::parse(&single_file_torrent(b"")).unwrap();
        let uri = metainfo.magnet().to_uri();
        assert!(uri.starts_with(&format!(
            "magnet:?xt=urn:btih:{}&dn=test.txt",
            metainfo.info_hash_hex()
        )));
        assert!(uri.contains("&tr=http%3A%2F%2Ftracker.example.com%2Fannounce"));
    }
}
