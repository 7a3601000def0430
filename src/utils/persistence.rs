//! JSON snapshot files.
//!
//! Snapshots are written to a sibling temp file and renamed into place so a
//! crash mid-write never leaves a truncated snapshot behind.

use crate::{Result, WalletError};
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let file = File::open(&self.path)
            .map_err(|e| WalletError::Persistence(format!("Failed to open {:?}: {}", self.path, e)))?;
        let value = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| WalletError::Persistence(format!("Corrupt snapshot {:?}: {}", self.path, e)))?;
        Ok(Some(value))
    }

    pub fn save<T: Serialize>(&self, value: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    WalletError::Persistence(format!("Failed to create directory {:?}: {}", parent, e))
                })?;
            }
        }
        let serialized = serde_json::to_vec_pretty(value)?;
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)
                .map_err(|e| WalletError::Persistence(format!("Failed to create {:?}: {}", tmp, e)))?;
            file.write_all(&serialized)
                .map_err(|e| WalletError::Persistence(format!("Failed to write {:?}: {}", tmp, e)))?;
            file.sync_all()
                .map_err(|e| WalletError::Persistence(format!("Failed to sync {:?}: {}", tmp, e)))?;
        }
        fs::rename(&tmp, &self.path)
            .map_err(|e| WalletError::Persistence(format!("Failed to replace {:?}: {}", self.path, e)))?;
        log::debug!("Snapshot written to {:?} ({} bytes)", self.path, serialized.len());
        Ok(())
    }
}
