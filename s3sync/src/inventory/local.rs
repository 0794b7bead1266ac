//! Inventory of a local sync root.

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info};

use super::{FileRecord, Inventory, InventorySource, PathFilter};
use crate::fs::fingerprint::hash_file;
use crate::fs::walker::{walk_files, FileInfo, WalkOptions};
use crate::utils::errors::{Result, SyncError};

/// A local directory scanned into an [`Inventory`].
#[derive(Debug, Clone)]
pub struct LocalTree {
    root: PathBuf,
    filter: PathFilter,
}

impl LocalTree {
    pub fn new(root: impl Into<PathBuf>, filter: PathFilter) -> Self {
        Self {
            root: root.into(),
            filter,
        }
    }

    /// Walk and hash the tree on the current thread.
    pub fn scan_blocking(&self) -> Result<Inventory> {
        let options = WalkOptions {
            filter: self.filter.clone(),
        };

        let mut inventory = Inventory::new();
        for file in walk_files(&self.root, options)? {
            let record = self.fingerprint(file?)?;
            debug!("Scanned {} ({} bytes)", record.relative_path, record.size);
            inventory.insert(record);
        }

        Ok(inventory)
    }

    fn fingerprint(&self, file: FileInfo) -> Result<FileRecord> {
        let content_fingerprint = hash_file(&file.path).map_err(|e| {
            SyncError::source_unavailable(
                self.root.display().to_string(),
                format!("failed to hash {}: {}", file.path.display(), e),
            )
        })?;

        Ok(FileRecord {
            relative_path: file.relative_path,
            size: file.size,
            modified_at: file.modified,
            content_fingerprint,
        })
    }
}

#[async_trait]
impl InventorySource for LocalTree {
    async fn list(&self) -> Result<Inventory> {
        let tree = self.clone();
        let inventory = tokio::task::spawn_blocking(move || tree.scan_blocking())
            .await
            .map_err(|e| {
                SyncError::source_unavailable(self.root.display().to_string(), e)
            })??;

        info!(
            "Scanned local root {}: {} files, {} bytes",
            self.root.display(),
            inventory.len(),
            inventory.total_bytes()
        );
        Ok(inventory)
    }
}
