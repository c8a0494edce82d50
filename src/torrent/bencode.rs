//! Bencode decoder
//!
//! Torrent metadata is bencoded. The decoder tracks byte offsets so the exact
//! original bytes of any top-level dictionary value can be recovered; the
//! info hash is computed over those bytes, never over a re-encoding.
//!
//! Bencode format:
//! - Integers:   `i<number>e`        Example: `i42e`
//! - Strings:    `<length>:<data>`   Example: `4:spam`
//! - Lists:      `l<items>e`         Example: `l4:spami42ee`
//! - Dicts:      `d<pairs>e`         Example: `d3:cow3:moo4:spam4:eggse`

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use crate::error::{EngineError, ProtocolErrorKind, Result};

/// Maximum allowed length for a bencode string (100 MiB)
const MAX_STRING_LENGTH: usize = 100 * 1024 * 1024;

/// Maximum nesting of lists and dicts
const MAX_DEPTH: usize = 64;

/// A bencode value
#[derive(Clone, PartialEq, Eq)]
pub enum BencodeValue {
    /// Integer value (can be negative)
    Integer(i64),
    /// Byte string (not necessarily valid UTF-8)
    Bytes(Vec<u8>),
    /// List of values
    List(Vec<BencodeValue>),
    /// Dictionary with byte string keys
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl fmt::Debug for BencodeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(n) => write!(f, "Integer({})", n),
            Self::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) if s.len() <= 50 => write!(f, "Bytes({:?})", s),
                _ => write!(f, "Bytes([{} bytes])", b.len()),
            },
            Self::List(l) => f.debug_tuple("List").field(l).finish(),
            Self::Dict(d) => f
                .debug_map()
                .entries(d.iter().map(|(k, v)| (String::from_utf8_lossy(k), v)))
                .finish(),
        }
    }
}

fn parse_error(message: impl Into<String>) -> EngineError {
    EngineError::protocol(ProtocolErrorKind::BencodeParse, message)
}

/// Cursor over a bencoded buffer
struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            depth: 0,
        }
    }

    fn peek(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| parse_error(format!("Unexpected end of input at byte {}", self.pos)))
    }

    fn value(&mut self) -> Result<BencodeValue> {
        match self.peek()? {
            b'i' => self.integer().map(BencodeValue::Integer),
            b'0'..=b'9' => self.bytes().map(|b| BencodeValue::Bytes(b.to_vec())),
            b'l' => {
                self.enter()?;
                self.pos += 1;
                let mut items = Vec::new();
                while self.peek()? != b'e' {
                    items.push(self.value()?);
                }
                self.pos += 1;
                self.depth -= 1;
                Ok(BencodeValue::List(items))
            }
            b'd' => {
                self.enter()?;
                self.pos += 1;
                let mut items = BTreeMap::new();
                while self.peek()? != b'e' {
                    let key = self.bytes()?.to_vec();
                    let value = self.value()?;
                    if items.insert(key.clone(), value).is_some() {
                        return Err(parse_error(format!(
                            "Duplicate dict key {:?}",
                            String::from_utf8_lossy(&key)
                        )));
                    }
                }
                self.pos += 1;
                self.depth -= 1;
                Ok(BencodeValue::Dict(items))
            }
            c => Err(parse_error(format!(
                "Invalid bencode type marker {:?} at byte {}",
                c as char, self.pos
            ))),
        }
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(parse_error(format!("Nesting deeper than {}", MAX_DEPTH)));
        }
        Ok(())
    }

    fn integer(&mut self) -> Result<i64> {
        let start = self.pos + 1;
        let len = self.data[start..]
            .iter()
            .position(|&c| c == b'e')
            .ok_or_else(|| parse_error("Unterminated integer"))?;
        let digits = std::str::from_utf8(&self.data[start..start + len])
            .map_err(|_| parse_error("Invalid integer encoding"))?;

        let unsigned = digits.strip_prefix('-').unwrap_or(digits);
        if unsigned.is_empty() || !unsigned.bytes().all(|c| c.is_ascii_digit()) {
            return Err(parse_error(format!("Invalid integer {:?}", digits)));
        }
        if unsigned.len() > 1 && unsigned.starts_with('0') {
            return Err(parse_error("Invalid integer: leading zero"));
        }
        if digits == "-0" {
            return Err(parse_error("Invalid integer: negative zero"));
        }

        let value = digits
            .parse::<i64>()
            .map_err(|_| parse_error(format!("Integer out of range: {}", digits)))?;
        self.pos = start + len + 1;
        Ok(value)
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let data = self.data;
        let colon = data[self.pos..]
            .iter()
            .position(|&c| c == b':')
            .ok_or_else(|| parse_error("Expected colon in string"))?;
        let len_str = &data[self.pos..self.pos + colon];
        if len_str.is_empty() || !len_str.iter().all(u8::is_ascii_digit) {
            return Err(parse_error("Invalid string length"));
        }
        if len_str.len() > 1 && len_str[0] == b'0' {
            return Err(parse_error("Invalid string length: leading zero"));
        }
        let len: usize = std::str::from_utf8(len_str)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| parse_error("Invalid string length number"))?;

        if len > MAX_STRING_LENGTH {
            return Err(parse_error(format!(
                "String length {} exceeds maximum allowed {} bytes",
                len, MAX_STRING_LENGTH
            )));
        }

        let start = self.pos + colon + 1;
        let end = start + len;
        if end > data.len() {
            return Err(parse_error(format!(
                "String length {} exceeds available data {}",
                len,
                data.len() - start
            )));
        }
        self.pos = end;
        Ok(&data[start..end])
    }
}

impl BencodeValue {
    /// Parse a complete bencode value, rejecting trailing data
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut decoder = Decoder::new(data);
        let value = decoder.value()?;
        if decoder.pos != data.len() {
            return Err(parse_error(format!(
                "Trailing data: {} bytes",
                data.len() - decoder.pos
            )));
        }
        Ok(value)
    }

    /// Encode to bencode bytes (keys in sorted order)
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_to(&mut buf);
        buf
    }

    /// Encode to an existing buffer
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        match self {
            Self::Integer(n) => {
                buf.push(b'i');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.push(b'e');
            }
            Self::Bytes(b) => encode_bytes(b, buf),
            Self::List(l) => {
                buf.push(b'l');
                for item in l {
                    item.encode_to(buf);
                }
                buf.push(b'e');
            }
            Self::Dict(d) => {
                buf.push(b'd');
                for (k, v) in d {
                    encode_bytes(k, buf);
                    v.encode_to(buf);
                }
                buf.push(b'e');
            }
        }
    }

    /// Get as string (UTF-8)
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::Bytes(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Get as integer
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Get as unsigned integer
    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Self::Integer(n) if *n >= 0 => Some(*n as u64),
            _ => None,
        }
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Get as list
    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    /// Get as dict
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            Self::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Get dict value by key
    pub fn get(&self, key: &str) -> Option<&BencodeValue> {
        match self {
            Self::Dict(d) => d.get(key.as_bytes()),
            _ => None,
        }
    }
}

fn encode_bytes(b: &[u8], buf: &mut Vec<u8>) {
    buf.extend_from_slice(b.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(b);
}

/// Locate the raw bytes of a value in the top-level dictionary
///
/// Walks the root dict key by key, so a key that merely appears inside some
/// string or nested structure is never mistaken for the top-level one.
/// Returns `Ok(None)` when the key is absent.
pub fn top_level_span(data: &[u8], key: &[u8]) -> Result<Option<Range<usize>>> {
    let mut decoder = Decoder::new(data);
    if decoder.peek()? != b'd' {
        return Err(EngineError::malformed("Root is not a dict"));
    }
    decoder.enter()?;
    decoder.pos += 1;

    let mut found = None;
    while decoder.peek()? != b'e' {
        let k = decoder.bytes()?;
        let start = decoder.pos;
        decoder.value()?;
        if k == key {
            if found.is_some() {
                return Err(parse_error(format!(
                    "Duplicate dict key {:?}",
                    String::from_utf8_lossy(key)
                )));
            }
            found = Some(start..decoder.pos);
        }
    }
    decoder.pos += 1;
    if decoder.pos != data.len() {
        return Err(parse_error(format!(
            "Trailing data: {} bytes",
            data.len() - decoder.pos
        )));
    }
    Ok(found)
}

/// Raw bytes of the `info` dictionary, as they appear in the file
pub fn info_dict_bytes(data: &[u8]) -> Result<&[u8]> {
    let span = top_level_span(data, b"info")?
        .ok_or_else(|| EngineError::malformed("Missing 'info' dictionary"))?;
    if data[span.start] != b'd' {
        return Err(EngineError::malformed("'info' is not a dictionary"));
    }
    Ok(&data[span])
}
