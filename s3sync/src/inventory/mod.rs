//! Inventory data model.
//!
//! An [`Inventory`] is the snapshot of one side of a sync (local tree,
//! remote bucket, or the last-known manifest): a map from relative path to
//! [`FileRecord`], plus the destination it was captured against.

pub mod filter;
pub mod local;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::utils::errors::{Result, SyncError};

pub use filter::PathFilter;
pub use local::LocalTree;

/// Relative path of a synchronized file, always `/`-separated.
///
/// Never empty, never absolute, and free of `.`/`..`/empty segments, so the
/// same value addresses both the local file and the remote object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelPath(String);

impl RelPath {
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if path.is_empty() {
            return Err(SyncError::InvalidPath("empty path".to_string()));
        }
        if path.starts_with('/') || path.contains('\\') || is_drive_prefixed(&path) {
            return Err(SyncError::InvalidPath(path));
        }
        if path
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
        {
            return Err(SyncError::InvalidPath(path));
        }
        Ok(Self(path))
    }

    /// Build from a native path relative to a sync root.
    pub fn from_relative_path(path: &Path) -> Result<Self> {
        let mut segments = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(part) => segments.push(
                    part.to_str()
                        .ok_or_else(|| SyncError::InvalidPath(path.display().to_string()))?
                        .to_string(),
                ),
                Component::CurDir => {}
                _ => return Err(SyncError::InvalidPath(path.display().to_string())),
            }
        }
        Self::new(segments.join("/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last segment of the path.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Resolve against a local sync root.
    pub fn to_local_path(&self, root: &Path) -> PathBuf {
        let mut path = root.to_path_buf();
        path.extend(self.0.split('/'));
        path
    }
}

fn is_drive_prefixed(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

impl TryFrom<String> for RelPath {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<RelPath> for String {
    fn from(value: RelPath) -> Self {
        value.0
    }
}

impl fmt::Display for RelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metadata for one synchronized file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub relative_path: RelPath,

    /// Size in bytes
    pub size: u64,

    pub modified_at: DateTime<Utc>,

    /// Content identity: `sha256:<hex>` locally, the store's tag remotely.
    /// Equal fingerprints are trusted to mean equal bytes.
    pub content_fingerprint: String,
}

/// Remote identity an inventory was captured against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

impl Destination {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: None,
        }
    }

    /// Set the key prefix. Empty or `/`-only prefixes mean "bucket root".
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let trimmed = prefix.trim_matches('/');
        self.prefix = if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        };
        self
    }

    /// Full object key for a relative path.
    pub fn object_key(&self, path: &RelPath) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix, path),
            None => path.to_string(),
        }
    }

    /// Listing prefix, with a trailing slash when a prefix is set.
    pub fn list_prefix(&self) -> Option<String> {
        self.prefix.as_ref().map(|p| format!("{}/", p))
    }

    /// Relative part of an object key, or `None` if the key lies outside the prefix.
    pub fn relative_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        match &self.prefix {
            Some(prefix) => key.strip_prefix(prefix.as_str())?.strip_prefix('/'),
            None => Some(key),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.prefix {
            Some(prefix) => write!(f, "s3://{}/{}", self.bucket, prefix),
            None => write!(f, "s3://{}", self.bucket),
        }
    }
}

/// Mapping of relative path to file record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    files: BTreeMap<RelPath, FileRecord>,
    destination: Option<Destination>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_destination(mut self, destination: Destination) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn set_destination(&mut self, destination: Option<Destination>) {
        self.destination = destination;
    }

    pub fn destination(&self) -> Option<&Destination> {
        self.destination.as_ref()
    }

    /// Insert a record, replacing any previous record for the same path.
    pub fn insert(&mut self, record: FileRecord) -> Option<FileRecord> {
        self.files.insert(record.relative_path.clone(), record)
    }

    pub fn get(&self, path: &RelPath) -> Option<&FileRecord> {
        self.files.get(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &RelPath> {
        self.files.keys()
    }

    pub fn records(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.values()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.values().map(|r| r.size).sum()
    }
}

impl FromIterator<FileRecord> for Inventory {
    fn from_iter<I: IntoIterator<Item = FileRecord>>(iter: I) -> Self {
        let mut inventory = Inventory::new();
        for record in iter {
            inventory.insert(record);
        }
        inventory
    }
}

/// Anything that can enumerate a sync root into an [`Inventory`].
///
/// Implementations fail with [`SyncError::SourceUnavailable`] and never
/// return a partial inventory.
#[async_trait]
pub trait InventorySource: Send + Sync {
    async fn list(&self) -> Result<Inventory>;
}
