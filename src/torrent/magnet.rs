//! Magnet URI Parser
//!
//! Magnet locators name a torrent by its info hash alone. The built-in
//! resolver cannot fetch from them (metadata comes from the swarm), but they
//! are parsed so the caller gets a clear error, and produced from metainfo so
//! the content can be shared.
//!
//! Format: `magnet:?xt=urn:btih:<hash>&dn=<name>&tr=<tracker>`

use crate::error::{EngineError, ProtocolErrorKind, Result};

use super::metainfo::Sha1Hash;

/// Parsed magnet URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetUri {
    pub info_hash: Sha1Hash,
    /// Display name (`dn`)
    pub display_name: Option<String>,
    /// Tracker URLs (`tr`)
    pub trackers: Vec<String>,
    /// Web seed URLs (`ws`, BEP 19)
    pub web_seeds: Vec<String>,
    /// Exact length (`xl`)
    pub exact_length: Option<u64>,
}

fn invalid(message: impl Into<String>) -> EngineError {
    EngineError::protocol(ProtocolErrorKind::InvalidMagnet, message)
}

impl MagnetUri {
    /// Parse a magnet URI string
    pub fn parse(uri: &str) -> Result<Self> {
        let query = uri
            .strip_prefix("magnet:?")
            .ok_or_else(|| invalid("URI must start with 'magnet:?'"))?;

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();
        let mut web_seeds = Vec::new();
        let mut exact_length = None;

        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "xt" => {
                    if let Some(hash) = parse_btih(&value) {
                        info_hash = Some(hash);
                    }
                }
                "dn" => display_name = Some(value.into_owned()),
                "tr" if !value.is_empty() => trackers.push(value.into_owned()),
                "ws" if !value.is_empty() => web_seeds.push(value.into_owned()),
                "xl" => exact_length = value.parse().ok(),
                _ => {}
            }
        }

        let info_hash =
            info_hash.ok_or_else(|| invalid("Missing or invalid 'xt' parameter (info hash)"))?;

        Ok(MagnetUri {
            info_hash,
            display_name,
            trackers,
            web_seeds,
            exact_length,
        })
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Display name, or the hex info hash when there is none
    pub fn name(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| self.info_hash_hex())
    }

    /// Convert back to a magnet URI string
    pub fn to_uri(&self) -> String {
        let mut uri = format!("magnet:?xt=urn:btih:{}", self.info_hash_hex());

        if let Some(ref name) = self.display_name {
            uri.push_str("&dn=");
            uri.push_str(&urlencoding::encode(name));
        }
        for tracker in &self.trackers {
            uri.push_str("&tr=");
            uri.push_str(&urlencoding::encode(tracker));
        }
        for ws in &self.web_seeds {
            uri.push_str("&ws=");
            uri.push_str(&urlencoding::encode(ws));
        }
        if let Some(len) = self.exact_length {
            uri.push_str(&format!("&xl={}", len));
        }
        uri
    }
}

impl std::str::FromStr for MagnetUri {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Info hash from an `xt` value, hex (40 chars) or base32 (32 chars)
fn parse_btih(xt: &str) -> Option<Sha1Hash> {
    let hash = xt.strip_prefix("urn:btih:")?;
    match hash.len() {
        40 => {
            let bytes = hex::decode(hash).ok()?;
            bytes.try_into().ok()
        }
        32 => base32_decode(hash),
        _ => None,
    }
}

/// RFC 4648 base32, no padding
fn base32_decode(input: &str) -> Option<Sha1Hash> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    let mut out = [0u8; 20];
    let mut written = 0;
    let mut bits = 0u32;
    let mut bit_count = 0u32;

    for c in input.bytes() {
        let val = ALPHABET
            .iter()
            .position(|&x| x == c.to_ascii_uppercase())? as u32;
        bits = (bits << 5) | val;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            *out.get_mut(written)? = (bits >> bit_count) as u8;
            written += 1;
            bits &= (1 << bit_count) - 1;
        }
    }

    (written == 20).then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH_HEX: &str = "c12fe1c06bba254a9dc9f519b335aa7c1367a88a";

    #[test]
    fn test_parse_hex_magnet() {
        let uri = format!(
            "magnet:?xt=urn:btih:{}&dn=Some+File.iso&tr=udp%3A%2F%2Ftracker.test%3A80&xl=1024",
            HASH_HEX
        );
        let magnet = MagnetUri::parse(&uri).unwrap();
        assert_eq!(magnet.info_hash_hex(), HASH_HEX);
        assert_eq!(magnet.display_name.as_deref(), Some("Some File.iso"));
        assert_eq!(magnet.trackers, vec!["udp://tracker.test:80"]);
        assert_eq!(magnet.exact_length, Some(1024));
    }

    #[test]
    fn test_parse_base32_magnet() {
        // base32 of the same 20 bytes as HASH_HEX
        let magnet = MagnetUri::parse("magnet:?xt=urn:btih:YEX6DQDLXISUVHOJ6UM3GNNKPQJWPKEK").unwrap();
        assert_eq!(magnet.info_hash_hex(), HASH_HEX);
        assert_eq!(magnet.name(), HASH_HEX);
    }

    #[test]
    fn test_invalid_magnets() {
        assert!(MagnetUri::parse("http://example.com").is_err());
        assert!(MagnetUri::parse("magnet:?dn=name").is_err());
        assert!(MagnetUri::parse("magnet:?xt=urn:btih:abc").is_err());
        assert!(MagnetUri::parse("magnet:?xt=urn:btih:zz2fe1c06bba254a9dc9f519b335aa7c1367a88a").is_err());
    }

    #[test]
    fn test_to_uri_parses_back() {
        let magnet = MagnetUri {
            info_hash: hex::decode(HASH_HEX).unwrap().try_into().unwrap(),
            display_name: Some("a b&c".into()),
            trackers: vec!["http://t.test/announce?x=1".into()],
            web_seeds: vec![],
            exact_length: Some(7),
        };
        let parsed = MagnetUri::parse(&magnet.to_uri()).unwrap();
        assert_eq!(parsed, magnet);
    }
}
