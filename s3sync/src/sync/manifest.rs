//! Persisted last-known state of a sync root.
//!
//! The manifest lives at `<root>/.s3sync/manifest.json` and records every
//! file as it was when the last run committed. It is written atomically
//! (temp file + rename) so a crash can only ever leave the previous
//! manifest behind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::inventory::{Destination, FileRecord, Inventory, RelPath};
use crate::utils::errors::{Result, SyncError};

/// Directory under the sync root holding sync state.
pub const STATE_DIR: &str = ".s3sync";
pub const MANIFEST_FILE: &str = "manifest.json";

/// On-disk manifest document.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifestDocument {
    captured_at: DateTime<Utc>,
    #[serde(default)]
    bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    prefix: Option<String>,
    #[serde(default)]
    files: BTreeMap<RelPath, ManifestEntry>,
}

/// Metadata for a single file in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub size: u64,
    pub modified_at: DateTime<Utc>,
    pub checksum: String,
}

/// Last-known inventory plus the time it was committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestSnapshot {
    /// `None` when no manifest has been committed yet
    pub captured_at: Option<DateTime<Utc>>,
    pub inventory: Inventory,
}

impl ManifestSnapshot {
    pub fn empty() -> Self {
        Self {
            captured_at: None,
            inventory: Inventory::new(),
        }
    }

    pub fn is_first_run(&self) -> bool {
        self.captured_at.is_none()
    }

    fn from_document(doc: ManifestDocument) -> Self {
        let destination = if doc.bucket.is_empty() {
            None
        } else {
            let dest = Destination::new(doc.bucket);
            Some(match doc.prefix {
                Some(prefix) => dest.with_prefix(prefix),
                None => dest,
            })
        };

        let mut inventory: Inventory = doc
            .files
            .into_iter()
            .map(|(relative_path, entry)| FileRecord {
                relative_path,
                size: entry.size,
                modified_at: entry.modified_at,
                content_fingerprint: entry.checksum,
            })
            .collect();
        inventory.set_destination(destination);

        Self {
            captured_at: Some(doc.captured_at),
            inventory,
        }
    }
}

impl ManifestDocument {
    fn new(inventory: &Inventory, captured_at: DateTime<Utc>) -> Self {
        let destination = inventory.destination();
        Self {
            captured_at,
            bucket: destination.map(|d| d.bucket.clone()).unwrap_or_default(),
            prefix: destination.and_then(|d| d.prefix.clone()),
            files: inventory
                .records()
                .map(|r| {
                    (
                        r.relative_path.clone(),
                        ManifestEntry {
                            size: r.size,
                            modified_at: r.modified_at,
                            checksum: r.content_fingerprint.clone(),
                        },
                    )
                })
                .collect(),
        }
    }
}

/// What to do when the manifest exists but cannot be parsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CorruptManifestPolicy {
    /// Surface `ManifestCorrupt` to the caller.
    #[default]
    Fail,
    /// Log a warning and continue as if no manifest existed. Every path then
    /// reconciles as untracked, so deletions since the last run are not
    /// recognised.
    TreatAsEmpty,
}

/// Loads and commits the manifest of one sync root.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
}

impl ManifestStore {
    pub fn for_root(root: &Path) -> Self {
        Self {
            path: root.join(STATE_DIR).join(MANIFEST_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the manifest; a missing manifest is an empty snapshot.
    pub fn load(&self) -> Result<ManifestSnapshot> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No manifest at {}, starting fresh", self.path.display());
                return Ok(ManifestSnapshot::empty());
            }
            Err(e) => return Err(e.into()),
        };

        let doc: ManifestDocument =
            serde_json::from_slice(&data).map_err(|source| SyncError::ManifestCorrupt {
                path: self.path.clone(),
                source,
            })?;

        let snapshot = ManifestSnapshot::from_document(doc);
        debug!(
            "Loaded manifest {} ({} files)",
            self.path.display(),
            snapshot.inventory.len()
        );
        Ok(snapshot)
    }

    pub fn load_with(&self, policy: CorruptManifestPolicy) -> Result<ManifestSnapshot> {
        match (self.load(), policy) {
            (Err(SyncError::ManifestCorrupt { path, source }), CorruptManifestPolicy::TreatAsEmpty) => {
                warn!(
                    "Ignoring corrupt manifest {}: {}; treating as first run",
                    path.display(),
                    source
                );
                Ok(ManifestSnapshot::empty())
            }
            (result, _) => result,
        }
    }

    /// Replace the manifest with `inventory`, stamped with the current time.
    pub fn save(&self, inventory: &Inventory) -> Result<ManifestSnapshot> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| SyncError::Config(format!("invalid manifest path {}", self.path.display())))?;
        std::fs::create_dir_all(dir)?;

        let captured_at = Utc::now();
        let json = serde_json::to_vec_pretty(&ManifestDocument::new(inventory, captured_at))?;

        let mut temp = NamedTempFile::new_in(dir)?;
        temp.write_all(&json)?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path).map_err(|e| SyncError::Io(e.error))?;

        info!(
            "Committed manifest {} ({} files)",
            self.path.display(),
            inventory.len()
        );

        Ok(ManifestSnapshot {
            captured_at: Some(captured_at),
            inventory: inventory.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn sample_inventory() -> Inventory {
        let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut inventory = Inventory::new()
            .with_destination(Destination::new("photos").with_prefix("laptop"));
        inventory.insert(FileRecord {
            relative_path: RelPath::new("2024/a.jpg").unwrap(),
            size: 42,
            modified_at: at,
            content_fingerprint: "sha256:abc".to_string(),
        });
        inventory.insert(FileRecord {
            relative_path: RelPath::new("b.txt").unwrap(),
            size: 0,
            modified_at: at,
            content_fingerprint: "d41d8cd98f00b204e9800998ecf8427e".to_string(),
        });
        inventory
    }

    #[test]
    fn test_missing_manifest_is_empty() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let snapshot = ManifestStore::for_root(temp_dir.path()).load()?;

        assert!(snapshot.is_first_run());
        assert!(snapshot.inventory.is_empty());
        Ok(())
    }

    #[test]
    fn test_save_then_load() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ManifestStore::for_root(temp_dir.path());
        let inventory = sample_inventory();

        let saved = store.save(&inventory)?;
        let loaded = store.load()?;

        assert_eq!(loaded, saved);
        assert_eq!(loaded.inventory, inventory);
        assert!(!loaded.is_first_run());
        Ok(())
    }

    #[test]
    fn test_save_replaces_previous_and_leaves_no_temp_files() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ManifestStore::for_root(temp_dir.path());

        store.save(&sample_inventory())?;
        store.save(&Inventory::new())?;

        assert!(store.load()?.inventory.is_empty());
        let entries: Vec<_> = std::fs::read_dir(temp_dir.path().join(STATE_DIR))?
            .map(|e| e.map(|e| e.file_name()))
            .collect::<std::io::Result<_>>()?;
        assert_eq!(entries, vec![std::ffi::OsString::from(MANIFEST_FILE)]);
        Ok(())
    }

    #[test]
    fn test_wire_format() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ManifestStore::for_root(temp_dir.path());
        store.save(&sample_inventory())?;

        let value: serde_json::Value = serde_json::from_slice(&std::fs::read(store.path())?)?;
        assert_eq!(value["bucket"], "photos");
        assert_eq!(value["prefix"], "laptop");
        assert!(value["captured_at"].is_string());
        assert_eq!(value["files"]["2024/a.jpg"]["size"], 42);
        assert_eq!(value["files"]["2024/a.jpg"]["checksum"], "sha256:abc");
        assert!(value["files"]["2024/a.jpg"]["modified_at"].is_string());
        Ok(())
    }

    #[test]
    fn test_unknown_fields_tolerated() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ManifestStore::for_root(temp_dir.path());
        std::fs::create_dir_all(temp_dir.path().join(STATE_DIR))?;
        std::fs::write(
            store.path(),
            r#"{
                "captured_at": "2024-05-01T10:00:00Z",
                "bucket": "b",
                "schema": 7,
                "files": {
                    "x.txt": {"size": 3, "modified_at": "2024-05-01T09:00:00Z", "checksum": "c", "mode": 420}
                }
            }"#,
        )?;

        let snapshot = store.load()?;
        let record = snapshot.inventory.get(&RelPath::new("x.txt")?).unwrap();
        assert_eq!(record.size, 3);
        assert_eq!(record.content_fingerprint, "c");
        assert_eq!(snapshot.inventory.destination(), Some(&Destination::new("b")));
        Ok(())
    }

    #[test]
    fn test_corrupt_manifest_policy() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ManifestStore::for_root(temp_dir.path());
        std::fs::create_dir_all(temp_dir.path().join(STATE_DIR))?;
        std::fs::write(store.path(), b"{\"captured_at\": ")?;

        assert!(matches!(
            store.load_with(CorruptManifestPolicy::Fail),
            Err(SyncError::ManifestCorrupt { .. })
        ));

        let recovered = store.load_with(CorruptManifestPolicy::TreatAsEmpty)?;
        assert!(recovered.is_first_run());
        Ok(())
    }

    #[test]
    fn test_invalid_path_in_manifest_is_corrupt() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = ManifestStore::for_root(temp_dir.path());
        std::fs::create_dir_all(temp_dir.path().join(STATE_DIR))?;
        std::fs::write(
            store.path(),
            r#"{"captured_at": "2024-05-01T10:00:00Z", "files": {"/etc/passwd": {"size": 1, "modified_at": "2024-05-01T10:00:00Z", "checksum": "c"}}}"#,
        )?;

        assert!(matches!(store.load(), Err(SyncError::ManifestCorrupt { .. })));
        Ok(())
    }
}
