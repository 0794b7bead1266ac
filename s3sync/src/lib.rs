//! s3sync library
//!
//! Manifest-based three-way sync between a local directory and an S3 bucket.
//! Local and remote inventories are reconciled against the last committed
//! manifest so that deletions and edits on either side are told apart.

pub mod config;
pub mod executor;
pub mod fs;
pub mod inventory;
pub mod store;
pub mod sync;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use inventory::{Destination, FileRecord, Inventory, InventorySource, RelPath};
pub use utils::errors::{Result, SyncError};
