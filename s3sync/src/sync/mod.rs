//! Sync engine: manifest persistence, reconciliation and run orchestration.

pub mod manifest;
pub mod reconcile;
pub mod session;

pub use manifest::{CorruptManifestPolicy, ManifestSnapshot, ManifestStore};
pub use reconcile::{reconcile, Reason, SyncAction, SyncOp, SyncSummary};
pub use session::{RunMode, RunOutcome, SessionOptions, SessionPlan, SyncSession};
