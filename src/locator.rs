//! Resource locators
//!
//! What the caller asks for: a direct URL, a torrent metadata file, or a
//! magnet link.

use crate::error::{EngineError, ProtocolErrorKind, Result};
use crate::torrent::MagnetUri;
use std::path::PathBuf;
use std::str::FromStr;

/// A resource to fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// Direct `http://` or `https://` URL
    Url(url::Url),
    /// Path to a `.torrent` file
    Torrent(PathBuf),
    /// Magnet link; metadata must come from an external collaborator
    Magnet(MagnetUri),
}

impl Locator {
    /// Parse a locator string
    ///
    /// `magnet:` links and `http(s)://` URLs are recognized by scheme;
    /// anything else is treated as a path to torrent metadata.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(EngineError::invalid_input("locator", "empty locator"));
        }

        if input.starts_with("magnet:") {
            return MagnetUri::parse(input).map(Self::Magnet);
        }

        if let Some((scheme, _)) = input.split_once("://") {
            return match scheme.to_ascii_lowercase().as_str() {
                "http" | "https" => Ok(Self::Url(url::Url::parse(input)?)),
                "file" => {
                    let url = url::Url::parse(input)?;
                    url.to_file_path().map(Self::Torrent).map_err(|_| {
                        EngineError::protocol(
                            ProtocolErrorKind::InvalidUrl,
                            format!("not a local file URL: {}", input),
                        )
                    })
                }
                other => Err(EngineError::protocol(
                    ProtocolErrorKind::InvalidUrl,
                    format!("unsupported scheme '{}'", other),
                )),
            };
        }

        Ok(Self::Torrent(PathBuf::from(input)))
    }

    pub fn is_url(&self) -> bool {
        matches!(self, Self::Url(_))
    }
}

impl FromStr for Locator {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Url(url) => write!(f, "{}", url),
            Self::Torrent(path) => write!(f, "{}", path.display()),
            Self::Magnet(magnet) => write!(f, "{}", magnet.to_uri()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_url() {
        let locator: Locator = "https://example.com/file.iso".parse().unwrap();
        assert!(locator.is_url());
        assert_eq!(locator.to_string(), "https://example.com/file.iso");
    }

    #[test]
    fn test_parse_torrent_path() {
        assert_eq!(
            Locator::parse("downloads/ubuntu.torrent").unwrap(),
            Locator::Torrent(PathBuf::from("downloads/ubuntu.torrent"))
        );
    }

    #[test]
    fn test_parse_magnet() {
        let locator =
            Locator::parse("magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a&dn=x")
                .unwrap();
        match locator {
            Locator::Magnet(magnet) => assert_eq!(magnet.name(), "x"),
            other => panic!("expected magnet, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(Locator::parse("").is_err());
        assert!(Locator::parse("ftp://example.com/file").is_err());
        assert!(Locator::parse("magnet:?dn=nohash").is_err());
    }
}
