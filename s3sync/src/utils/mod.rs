//! Shared utilities.

pub mod errors;
pub mod format;
pub mod logger;

pub use errors::{Result, SyncError};
