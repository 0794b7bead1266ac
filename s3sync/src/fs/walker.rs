//! Directory traversal for building local inventories.
//!
//! The walker only discovers files and their metadata; content hashing is a
//! separate step (see [`super::fingerprint`]) so callers decide when and
//! where to hash.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

use crate::inventory::{PathFilter, RelPath};
use crate::utils::errors::{Result, SyncError};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Hidden-file and pattern exclusion
    pub filter: PathFilter,
}

/// A regular file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// Path relative to the walk root
    pub relative_path: RelPath,

    /// File size in bytes
    pub size: u64,

    /// Last modification time
    pub modified: DateTime<Utc>,
}

impl FileInfo {
    /// Create FileInfo from a DirEntry.
    /// Symlinks are resolved to their target; links to directories and
    /// broken links yield `None`.
    fn from_entry(entry: &DirEntry, root: &Path) -> std::io::Result<Option<Self>> {
        let path = entry.path().to_path_buf();
        let metadata = if entry.path_is_symlink() {
            match std::fs::metadata(&path) {
                Ok(resolved) if resolved.is_file() => resolved,
                _ => return Ok(None),
            }
        } else {
            entry.metadata()?
        };

        if !metadata.is_file() {
            return Ok(None);
        }

        let relative = path.strip_prefix(root).unwrap_or(&path);
        let relative_path = match RelPath::from_relative_path(relative) {
            Ok(rel) => rel,
            Err(e) => {
                tracing::warn!("Skipping {}: {}", path.display(), e);
                return Ok(None);
            }
        };

        Ok(Some(Self {
            relative_path,
            size: metadata.len(),
            modified: DateTime::<Utc>::from(metadata.modified()?),
            path,
        }))
    }
}

/// Lazily walk the regular files under `root`.
///
/// Fails up front with `SourceUnavailable` if the root is missing or not a
/// directory; later I/O failures surface as items of the iterator.
pub fn walk_files(
    root: &Path,
    options: WalkOptions,
) -> Result<impl Iterator<Item = Result<FileInfo>>> {
    let root_display = root.display().to_string();
    match std::fs::metadata(root) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(SyncError::source_unavailable(root_display, "not a directory"));
        }
        Err(e) => return Err(SyncError::source_unavailable(root_display, e)),
    }

    let walker = WalkDir::new(root).sort_by_file_name();

    let root_owned = root.to_path_buf();
    let filter = options.filter;
    let entry_root = root_owned.clone();

    let files = walker
        .into_iter()
        .filter_entry(move |entry| entry.depth() == 0 || !should_exclude(entry, &entry_root, &filter))
        .filter_map(move |entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => return Some(Err(SyncError::source_unavailable(root_display.clone(), e))),
            };

            if entry.file_type().is_dir() {
                return None;
            }

            FileInfo::from_entry(&entry, &root_owned)
                .map_err(|e| {
                    SyncError::source_unavailable(
                        root_display.clone(),
                        format!("{}: {}", entry.path().display(), e),
                    )
                })
                .transpose()
        });

    Ok(files)
}

/// Walk a directory tree and collect all files
pub fn walk_directory(root: &Path, options: WalkOptions) -> Result<Vec<FileInfo>> {
    walk_files(root, options)?.collect()
}

/// Check if a directory entry should be excluded
fn should_exclude(entry: &DirEntry, root: &Path, filter: &PathFilter) -> bool {
    let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
    filter.excludes(relative, entry.file_type().is_dir())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn names(files: &[FileInfo]) -> Vec<&str> {
        files.iter().map(|f| f.relative_path.as_str()).collect()
    }

    #[test]
    fn test_walk_empty_directory() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let files = walk_directory(temp_dir.path(), WalkOptions::default())?;
        assert_eq!(files.len(), 0);
        Ok(())
    }

    #[test]
    fn test_walk_with_subdirectories() -> Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("subdir"))?;
        fs::write(temp_dir.path().join("file1.txt"), b"content1")?;
        fs::write(temp_dir.path().join("subdir/file2.txt"), b"content22")?;

        let files = walk_directory(temp_dir.path(), WalkOptions::default())?;
        assert_eq!(names(&files), vec!["file1.txt", "subdir/file2.txt"]);
        assert_eq!(files[1].size, 9);

        Ok(())
    }

    #[test]
    fn test_hidden_entries_and_manifest_dir_skipped() -> Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir_all(temp_dir.path().join(".s3sync"))?;
        fs::write(temp_dir.path().join(".s3sync/manifest.json"), b"{}")?;
        fs::write(temp_dir.path().join(".DS_Store"), b"junk")?;
        fs::write(temp_dir.path().join("keep.txt"), b"keep")?;

        let files = walk_directory(temp_dir.path(), WalkOptions::default())?;
        assert_eq!(names(&files), vec!["keep.txt"]);

        Ok(())
    }

    #[test]
    fn test_exclude_patterns() -> Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("node_modules"))?;
        fs::write(temp_dir.path().join("node_modules/dep.js"), b"x")?;
        fs::write(temp_dir.path().join("Thumbs.db"), b"x")?;
        fs::write(temp_dir.path().join("main.js"), b"x")?;

        let options = WalkOptions {
            filter: PathFilter::new(&["node_modules/", "Thumbs.db"])?,
        };
        let files = walk_directory(temp_dir.path(), options)?;
        assert_eq!(names(&files), vec!["main.js"]);

        Ok(())
    }

    #[test]
    fn test_missing_root_is_source_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("nope");

        let err = walk_directory(&missing, WalkOptions::default()).unwrap_err();
        assert!(matches!(err, SyncError::SourceUnavailable { .. }));
    }

    #[test]
    fn test_file_root_is_source_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("file.txt");
        fs::write(&file, b"x").unwrap();

        assert!(matches!(
            walk_directory(&file, WalkOptions::default()),
            Err(SyncError::SourceUnavailable { .. })
        ));
    }
}
