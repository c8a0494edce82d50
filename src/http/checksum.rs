//! Checksum computation
//!
//! Incremental hashing for segment blocks as bytes stream in, and whole-file
//! verification once the output is complete.

use crate::error::{EngineError, ProtocolErrorKind, Result, StorageErrorKind};
use crate::protocol::{ChecksumAlgorithm, ExpectedChecksum};
use md5::{Digest, Md5};
use sha1::Sha1;
use sha2::Sha256;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Streaming hasher over any supported algorithm
#[derive(Clone)]
pub enum Hasher {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Md5 => Self::Md5(Md5::new()),
            ChecksumAlgorithm::Sha1 => Self::Sha1(Sha1::new()),
            ChecksumAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(h) => h.update(data),
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
        }
    }

    /// Lowercase hex digest
    pub fn finalize_hex(self) -> String {
        match self {
            Self::Md5(h) => hex::encode(h.finalize()),
            Self::Sha1(h) => hex::encode(h.finalize()),
            Self::Sha256(h) => hex::encode(h.finalize()),
        }
    }
}

/// Verifies a segment block by block against its expected digests
///
/// Each block is `block_size` bytes except possibly the last one, which ends
/// wherever the segment ends.
pub struct BlockVerifier<'a> {
    algorithm: ChecksumAlgorithm,
    block_size: u64,
    digests: &'a [String],
    current: Hasher,
    filled: u64,
    block: usize,
    /// Absolute offset of the segment start, for error messages
    base: u64,
}

impl<'a> BlockVerifier<'a> {
    pub fn new(
        algorithm: ChecksumAlgorithm,
        block_size: u64,
        digests: &'a [String],
        base: u64,
    ) -> Self {
        Self {
            algorithm,
            block_size,
            digests,
            current: Hasher::new(algorithm),
            filled: 0,
            block: 0,
            base,
        }
    }

    /// Feed bytes; fails as soon as a completed block mismatches
    pub fn update(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let room = (self.block_size - self.filled) as usize;
            let take = room.min(data.len());
            self.current.update(&data[..take]);
            self.filled += take as u64;
            data = &data[take..];
            if self.filled == self.block_size {
                self.check_block()?;
            }
        }
        Ok(())
    }

    /// Check the trailing partial block and that every digest was consumed
    pub fn finish(mut self) -> Result<()> {
        if self.filled > 0 {
            self.check_block()?;
        }
        if self.block != self.digests.len() {
            return Err(EngineError::protocol(
                ProtocolErrorKind::ChecksumMismatch,
                format!(
                    "segment at offset {} covered {} of {} blocks",
                    self.base,
                    self.block,
                    self.digests.len()
                ),
            ));
        }
        Ok(())
    }

    fn check_block(&mut self) -> Result<()> {
        let hasher = std::mem::replace(&mut self.current, Hasher::new(self.algorithm));
        let actual = hasher.finalize_hex();
        let offset = self.base + self.block as u64 * self.block_size;
        match self.digests.get(self.block) {
            Some(expected) if expected.eq_ignore_ascii_case(&actual) => {
                self.block += 1;
                self.filled = 0;
                Ok(())
            }
            Some(expected) => Err(checksum_mismatch_error(
                &format!("block at offset {}", offset),
                expected,
                &actual,
            )),
            None => Err(EngineError::protocol(
                ProtocolErrorKind::ChecksumMismatch,
                format!("unexpected data past the last block at offset {}", offset),
            )),
        }
    }
}

/// Verify file checksum against expected value
///
/// Returns `Ok(true)` if checksums match, `Ok(false)` if they don't.
pub async fn verify_checksum(path: &Path, expected: &ExpectedChecksum) -> Result<bool> {
    let computed = compute_checksum(path, expected.algorithm).await?;
    Ok(computed.eq_ignore_ascii_case(&expected.value))
}

/// Compute a file's hex digest
pub async fn compute_checksum(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
    let mut file = File::open(path).await.map_err(|e| {
        EngineError::storage(
            StorageErrorKind::Io,
            path,
            format!("Failed to open file for checksum: {}", e),
        )
    })?;

    // 64KB buffer for efficient reading
    let mut buffer = vec![0u8; 64 * 1024];
    let mut hasher = Hasher::new(algorithm);
    loop {
        let n = file.read(&mut buffer).await.map_err(|e| {
            EngineError::storage(
                StorageErrorKind::Io,
                path,
                format!("Failed to read file for checksum: {}", e),
            )
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize_hex())
}

/// Create a checksum mismatch error
pub fn checksum_mismatch_error(what: &str, expected: &str, actual: &str) -> EngineError {
    EngineError::protocol(
        ProtocolErrorKind::ChecksumMismatch,
        format!(
            "Checksum verification failed for {}: expected {}, got {}",
            what, expected, actual
        ),
    )
}
