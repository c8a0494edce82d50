//! JSON sidecar ledger
//!
//! The ledger lives at `<output_dir>/<name>.rfstate`. Every save writes a
//! temp file, syncs it, then renames it over the previous ledger, so a crash
//! leaves either the old or the new ledger, never a torn one.

use super::{ResumeState, ResumeStore};
use crate::error::{EngineError, Result, StorageErrorKind};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Extension of the ledger file
pub const SIDECAR_EXTENSION: &str = "rfstate";

/// Ledger stored as a JSON file next to the output
#[derive(Debug, Clone)]
pub struct SidecarStore {
    path: PathBuf,
}

impl SidecarStore {
    /// Ledger for the output file `name` in `dir`
    pub fn new(dir: &Path, name: &str) -> Self {
        Self {
            path: dir.join(format!("{}.{}", name, SIDECAR_EXTENSION)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn io_error(&self, action: &str, err: std::io::Error) -> EngineError {
        EngineError::storage(
            StorageErrorKind::Io,
            &self.path,
            format!("Failed to {} resume ledger: {}", action, err),
        )
    }
}

#[async_trait]
impl ResumeStore for SidecarStore {
    async fn load(&self) -> Result<Option<ResumeState>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error("read", e)),
        };

        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| EngineError::resume_corrupt(&self.path, format!("unreadable ledger: {}", e)))
    }

    async fn save(&self, state: &ResumeState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state)?;
        let temp = self.temp_path();

        let mut file = tokio::fs::File::create(&temp)
            .await
            .map_err(|e| self.io_error("create", e))?;
        file.write_all(&json)
            .await
            .map_err(|e| self.io_error("write", e))?;
        file.sync_all()
            .await
            .map_err(|e| self.io_error("sync", e))?;
        drop(file);

        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| self.io_error("replace", e))?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        for path in [self.path.clone(), self.temp_path()] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(self.io_error("remove", e)),
            }
        }
        Ok(())
    }
}
