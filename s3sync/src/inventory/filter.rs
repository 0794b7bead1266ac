//! Path exclusion shared by the local and remote inventory producers.

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use std::path::Path;

use crate::utils::errors::{Result, SyncError};

/// Leaf names starting with this character are hidden/system artifacts.
pub const HIDDEN_MARKER: char = '.';

/// Decides which relative paths take part in a sync.
///
/// A path is excluded when any of its segments is hidden or when it matches
/// one of the configured gitignore-style patterns.
#[derive(Debug, Clone)]
pub struct PathFilter {
    matcher: Gitignore,
}

impl PathFilter {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut builder = GitignoreBuilder::new("");
        for pattern in patterns {
            let pattern = pattern.as_ref();
            builder.add_line(None, pattern).map_err(|e| {
                SyncError::Config(format!("invalid exclude pattern {:?}: {}", pattern, e))
            })?;
        }
        let matcher = builder
            .build()
            .map_err(|e| SyncError::Config(format!("invalid exclude patterns: {}", e)))?;

        Ok(Self { matcher })
    }

    /// Filter that only drops hidden paths.
    pub fn hidden_only() -> Self {
        Self {
            matcher: Gitignore::empty(),
        }
    }

    pub fn is_hidden(name: &str) -> bool {
        name.starts_with(HIDDEN_MARKER)
    }

    /// Check a path relative to the sync root.
    pub fn excludes(&self, relative: &Path, is_dir: bool) -> bool {
        let hidden = relative
            .components()
            .any(|c| Self::is_hidden(&c.as_os_str().to_string_lossy()));
        if hidden {
            return true;
        }

        self.matcher
            .matched_path_or_any_parents(relative, is_dir)
            .is_ignore()
    }

    /// Check a `/`-separated object key relative to the remote root.
    pub fn excludes_key(&self, relative_key: &str) -> bool {
        self.excludes(Path::new(relative_key), false)
    }
}

impl Default for PathFilter {
    fn default() -> Self {
        Self::hidden_only()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_segments_excluded() {
        let filter = PathFilter::hidden_only();

        assert!(filter.excludes_key(".DS_Store"));
        assert!(filter.excludes_key("photos/.thumbs/a.jpg"));
        assert!(filter.excludes_key(".s3sync/manifest.json"));
        assert!(!filter.excludes_key("photos/a.jpg"));
    }

    #[test]
    fn test_patterns() {
        let filter = PathFilter::new(&["Thumbs.db", "*.log", "build/"]).unwrap();

        assert!(filter.excludes_key("Thumbs.db"));
        assert!(filter.excludes_key("nested/dir/Thumbs.db"));
        assert!(filter.excludes_key("server.log"));
        assert!(filter.excludes_key("build/out.bin"));
        assert!(filter.excludes(Path::new("build"), true));
        assert!(!filter.excludes_key("src/build.rs"));
        assert!(!filter.excludes_key("notes.txt"));
    }

    #[test]
    fn test_invalid_pattern_is_config_error() {
        let err = PathFilter::new(&["a[b"]).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }
}
