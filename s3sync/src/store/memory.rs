//! In-memory object store.
//!
//! Behaves like a bucket: objects carry an ETag-style tag, an optional
//! content digest and a modification time. Used by tests and for dry
//! experiments without S3 access.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use super::{partial_path, prepare_parent, RemoteFingerprint, RemoteStore, Transfer};
use crate::fs::fingerprint::hash_bytes;
use crate::inventory::{Destination, FileRecord, Inventory, InventorySource, PathFilter, RelPath};
use crate::utils::errors::{Result, SyncError};

#[derive(Debug, Clone)]
struct MemoryObject {
    data: Vec<u8>,
    modified_at: DateTime<Utc>,
    etag: String,
    content_digest: Option<String>,
}

impl MemoryObject {
    fn new(data: Vec<u8>, modified_at: DateTime<Utc>, content_digest: Option<String>) -> Self {
        // Store-native tag, never in the local fingerprint format
        let etag = format!("{:x}", Sha256::digest(&data))[..32].to_string();
        Self {
            data,
            modified_at,
            etag,
            content_digest,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    /// Keyed by full object key (prefix included)
    objects: BTreeMap<String, MemoryObject>,
    failing: HashSet<RelPath>,
    accessible: bool,
    puts: usize,
    gets: usize,
}

/// A bucket held in memory.
#[derive(Debug)]
pub struct MemoryStore {
    destination: Destination,
    filter: PathFilter,
    fingerprint: RemoteFingerprint,
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new(destination: Destination) -> Self {
        Self {
            destination,
            filter: PathFilter::default(),
            fingerprint: RemoteFingerprint::default(),
            state: Mutex::new(State {
                accessible: true,
                ..State::default()
            }),
        }
    }

    pub fn with_filter(mut self, filter: PathFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: RemoteFingerprint) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        // Poisoning only means another caller panicked mid-update
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed an object as if it had been uploaded by s3sync.
    pub fn insert(&self, key: &str, data: &[u8], modified_at: DateTime<Utc>) {
        let digest = hash_bytes(data);
        self.insert_raw(key, data, modified_at, Some(digest));
    }

    /// Seed an object written by another tool (no content digest metadata).
    pub fn insert_foreign(&self, key: &str, data: &[u8], modified_at: DateTime<Utc>) {
        self.insert_raw(key, data, modified_at, None);
    }

    fn insert_raw(&self, key: &str, data: &[u8], modified_at: DateTime<Utc>, digest: Option<String>) {
        self.state()
            .objects
            .insert(key.to_string(), MemoryObject::new(data.to_vec(), modified_at, digest));
    }

    pub fn remove(&self, key: &str) -> bool {
        self.state().objects.remove(key).is_some()
    }

    /// Content of an object by full key.
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state().objects.get(key).map(|o| o.data.clone())
    }

    /// Content digest metadata of an object by full key.
    pub fn content_digest(&self, key: &str) -> Option<String> {
        self.state().objects.get(key).and_then(|o| o.content_digest.clone())
    }

    /// Make every transfer of `path` fail.
    pub fn fail_transfers_for(&self, path: &RelPath) {
        self.state().failing.insert(path.clone());
    }

    pub fn set_accessible(&self, accessible: bool) {
        self.state().accessible = accessible;
    }

    /// Number of completed (put, get) calls.
    pub fn transfer_counts(&self) -> (usize, usize) {
        let state = self.state();
        (state.puts, state.gets)
    }

    fn check_failure(&self, key: &RelPath) -> Result<()> {
        if self.state().failing.contains(key) {
            return Err(SyncError::transfer_failed(key.as_str(), "injected failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl InventorySource for MemoryStore {
    async fn list(&self) -> Result<Inventory> {
        let state = self.state();
        if !state.accessible {
            return Err(SyncError::source_unavailable(
                self.destination.to_string(),
                "bucket does not exist or is not accessible",
            ));
        }

        let mut inventory = Inventory::new().with_destination(self.destination.clone());
        for (key, object) in &state.objects {
            let Some(relative) = self.destination.relative_key(key) else {
                continue;
            };
            if relative.is_empty() || relative.ends_with('/') || self.filter.excludes_key(relative) {
                continue;
            }
            let Ok(relative_path) = RelPath::new(relative) else {
                continue;
            };

            let content_fingerprint = match (self.fingerprint, &object.content_digest) {
                (RemoteFingerprint::ContentDigest, Some(digest)) => digest.clone(),
                _ => object.etag.clone(),
            };

            inventory.insert(FileRecord {
                relative_path,
                size: object.data.len() as u64,
                modified_at: object.modified_at,
                content_fingerprint,
            });
        }

        Ok(inventory)
    }
}

#[async_trait]
impl Transfer for MemoryStore {
    async fn put(&self, local_path: &Path, key: &RelPath, fingerprint: &str) -> Result<()> {
        self.check_failure(key)?;

        let data = tokio::fs::read(local_path)
            .await
            .map_err(|e| SyncError::transfer_failed(key.as_str(), e))?;

        let object_key = self.destination.object_key(key);
        let mut state = self.state();
        state.objects.insert(
            object_key,
            MemoryObject::new(data, Utc::now(), Some(fingerprint.to_string())),
        );
        state.puts += 1;
        Ok(())
    }

    async fn get(&self, key: &RelPath, local_path: &Path) -> Result<String> {
        self.check_failure(key)?;

        let object_key = self.destination.object_key(key);
        let data = self
            .state()
            .objects
            .get(&object_key)
            .map(|o| o.data.clone())
            .ok_or_else(|| SyncError::transfer_failed(key.as_str(), "no such key"))?;

        prepare_parent(key, local_path).await?;
        let partial = partial_path(local_path);
        tokio::fs::write(&partial, &data)
            .await
            .map_err(|e| SyncError::transfer_failed(key.as_str(), e))?;
        tokio::fs::rename(&partial, local_path)
            .await
            .map_err(|e| SyncError::transfer_failed(key.as_str(), e))?;

        let digest = hash_bytes(&data);
        let mut state = self.state();
        // Tagging rewrites the object, as a self copy does on S3
        if let Some(object) = state.objects.get_mut(&object_key) {
            if object.content_digest.as_deref() != Some(digest.as_str()) {
                *object = MemoryObject::new(data, Utc::now(), Some(digest.clone()));
            }
        }
        state.gets += 1;
        Ok(digest)
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn destination(&self) -> &Destination {
        &self.destination
    }

    async fn ensure_accessible(&self) -> Result<()> {
        if self.state().accessible {
            Ok(())
        } else {
            Err(SyncError::source_unavailable(
                self.destination.to_string(),
                "bucket does not exist or is not accessible",
            ))
        }
    }
}
