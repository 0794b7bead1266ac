//! Remote object stores.
//!
//! A remote store is both an [`InventorySource`] (it can list itself) and a
//! [`Transfer`] collaborator (it can move single files in and out). The sync
//! engine only talks to these traits; [`S3Store`] is the production
//! implementation and [`MemoryStore`] backs tests.

pub mod memory;
pub mod s3;

use async_trait::async_trait;
use std::path::Path;

use crate::inventory::{Destination, InventorySource, RelPath};
use crate::utils::errors::Result;

pub use memory::MemoryStore;
pub use s3::{build_client, list_buckets, ClientOptions, S3Store, S3StoreConfig};

/// User metadata key carrying the local content fingerprint of an uploaded object.
pub const CONTENT_DIGEST_METADATA: &str = "content-sha256";

/// Moves single files between the local root and the remote store.
///
/// Both operations fail with `TransferFailed` naming the offending path.
#[async_trait]
pub trait Transfer: Send + Sync {
    /// Upload `local_path` as `key`, tagging the object with `fingerprint`.
    async fn put(&self, local_path: &Path, key: &RelPath, fingerprint: &str) -> Result<()>;

    /// Download `key` into `local_path`, creating parent directories.
    ///
    /// Returns the content fingerprint of the bytes written. An object that
    /// lacked [`CONTENT_DIGEST_METADATA`] is tagged with it when the store
    /// permits, so later listings report the same fingerprint.
    async fn get(&self, key: &RelPath, local_path: &Path) -> Result<String>;
}

/// A listable, transferable remote sync root.
#[async_trait]
pub trait RemoteStore: InventorySource + Transfer {
    fn destination(&self) -> &Destination;

    /// Fail with `SourceUnavailable` when the bucket is missing or forbidden.
    async fn ensure_accessible(&self) -> Result<()>;
}

/// How remote fingerprints are obtained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RemoteFingerprint {
    /// The ETag from the listing, as-is.
    Etag,
    /// The `content-sha256` metadata written on upload, falling back to the ETag.
    #[default]
    ContentDigest,
}

/// Hidden sibling path used while a download is in flight.
pub(crate) fn partial_path(local_path: &Path) -> std::path::PathBuf {
    let mut name = std::ffi::OsString::from(".");
    if let Some(file_name) = local_path.file_name() {
        name.push(file_name);
    }
    name.push(".s3sync-part");
    local_path.with_file_name(name)
}

/// Create the parent directory of a download target.
pub(crate) async fn prepare_parent(key: &RelPath, local_path: &Path) -> Result<()> {
    if let Some(parent) = local_path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            crate::utils::errors::SyncError::transfer_failed(
                key.as_str(),
                format!("failed to create {}: {}", parent.display(), e),
            )
        })?;
    }
    Ok(())
}
