//! Error types for the sync engine and its collaborators.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// An inventory could not be built (root missing, unreadable, bucket inaccessible).
    #[error("Source unavailable: {root}: {reason}")]
    SourceUnavailable { root: String, reason: String },

    /// The persisted manifest exists but cannot be parsed.
    #[error("Manifest corrupt: {}: {source}", path.display())]
    ManifestCorrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// A single upload or download failed.
    #[error("Transfer failed for {path}: {reason}")]
    TransferFailed { path: String, reason: String },

    #[error("Invalid relative path: {0}")]
    InvalidPath(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SyncError {
    pub fn source_unavailable(root: impl Into<String>, reason: impl ToString) -> Self {
        SyncError::SourceUnavailable {
            root: root.into(),
            reason: reason.to_string(),
        }
    }

    pub fn transfer_failed(path: impl Into<String>, reason: impl ToString) -> Self {
        SyncError::TransferFailed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
