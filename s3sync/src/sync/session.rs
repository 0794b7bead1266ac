//! One sync run: inventory, reconcile, execute, commit.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use super::manifest::{CorruptManifestPolicy, ManifestSnapshot, ManifestStore};
use super::reconcile::{reconcile, Reason, SyncAction, SyncOp, SyncSummary};
use crate::executor::{ActionExecutor, ExecutionReport};
use crate::inventory::{FileRecord, Inventory, InventorySource, RelPath};
use crate::store::RemoteStore;
use crate::utils::errors::Result;

/// Which directions a run applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Uploads only
    Push,
    /// Downloads only
    Pull,
    /// Both directions
    Sync,
}

impl RunMode {
    /// Whether actions of kind `op` are applied in this mode. Skips always are.
    pub fn applies(&self, op: SyncOp) -> bool {
        match (self, op) {
            (_, SyncOp::Skip) => true,
            (RunMode::Sync, _) => true,
            (RunMode::Push, SyncOp::Upload) => true,
            (RunMode::Pull, SyncOp::Download) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Push => f.write_str("push"),
            RunMode::Pull => f.write_str("pull"),
            RunMode::Sync => f.write_str("sync"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub concurrency_budget: u32,
    pub corrupt_manifest: CorruptManifestPolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            concurrency_budget: 16,
            corrupt_manifest: CorruptManifestPolicy::Fail,
        }
    }
}

/// Reconciled actions of a run together with the inventories they came from.
#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub mode: RunMode,
    /// One action per path, sorted by path
    pub actions: Vec<SyncAction>,
    local: Inventory,
    remote: Inventory,
    last_known: ManifestSnapshot,
}

impl SessionPlan {
    /// Actions this run applies.
    pub fn selected(&self) -> impl Iterator<Item = &SyncAction> {
        self.actions.iter().filter(|a| self.mode.applies(a.op))
    }

    /// Actions of the other direction, reported but not executed.
    pub fn deferred(&self) -> impl Iterator<Item = &SyncAction> {
        self.actions.iter().filter(|a| !self.mode.applies(a.op))
    }

    pub fn summary(&self) -> SyncSummary {
        SyncSummary::from_actions(self.selected())
    }

    pub fn is_first_run(&self) -> bool {
        self.last_known.is_first_run()
    }

    /// State to commit once every selected action has been applied.
    ///
    /// Applied transfers contribute the record of the side that was copied;
    /// a download carries the fingerprint of the bytes written in `fetched`.
    /// Skips contribute the agreed state. Deferred actions keep whatever the
    /// last run committed for that path.
    fn committed_inventory(&self, fetched: &BTreeMap<RelPath, String>) -> Inventory {
        let mut committed = Inventory::new();
        committed.set_destination(self.remote.destination().cloned());

        for action in &self.actions {
            let record = if self.mode.applies(action.op) {
                match (action.op, action.reason) {
                    (SyncOp::Skip, Reason::DeletedLocally) => self.remote.get(&action.relative_path).cloned(),
                    (SyncOp::Skip, _) => self.local.get(&action.relative_path).cloned(),
                    (SyncOp::Download, _) => Some(downloaded_record(&action.record, fetched)),
                    _ => Some(action.record.clone()),
                }
            } else {
                self.last_known.inventory.get(&action.relative_path).cloned()
            };

            if let Some(record) = record {
                committed.insert(record);
            }
        }

        committed
    }
}

fn downloaded_record(remote: &FileRecord, fetched: &BTreeMap<RelPath, String>) -> FileRecord {
    let mut record = remote.clone();
    if let Some(fingerprint) = fetched.get(&remote.relative_path) {
        record.content_fingerprint = fingerprint.clone();
    }
    record
}

/// Result of an executed run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub summary: SyncSummary,
    pub report: ExecutionReport,
    pub deferred: usize,
    pub manifest: ManifestSnapshot,
}

/// Sync between one local root and one remote destination.
pub struct SyncSession<L, R> {
    local_root: PathBuf,
    local: L,
    remote: Arc<R>,
    manifest: ManifestStore,
    options: SessionOptions,
}

impl<L, R> SyncSession<L, R>
where
    L: InventorySource,
    R: RemoteStore + 'static,
{
    pub fn new(
        local_root: impl Into<PathBuf>,
        local: L,
        remote: Arc<R>,
        manifest: ManifestStore,
        options: SessionOptions,
    ) -> Self {
        Self {
            local_root: local_root.into(),
            local,
            remote,
            manifest,
            options,
        }
    }

    pub fn manifest_path(&self) -> &Path {
        self.manifest.path()
    }

    /// Build both inventories, load the manifest and reconcile.
    ///
    /// Fails before anything is transferred if either side is unavailable.
    pub async fn plan(&self, mode: RunMode) -> Result<SessionPlan> {
        let (local, remote) = tokio::try_join!(self.local.list(), self.remote.list())?;
        let mut last_known = self.manifest.load_with(self.options.corrupt_manifest)?;

        let destination = self.remote.destination();
        if let Some(recorded) = last_known.inventory.destination() {
            if recorded != destination {
                warn!(
                    "Manifest {} was recorded against {}, not {}; treating as first run",
                    self.manifest.path().display(),
                    recorded,
                    destination
                );
                last_known = ManifestSnapshot::empty();
            }
        }

        let actions = reconcile(&local, &remote, &last_known.inventory);
        let plan = SessionPlan {
            mode,
            actions,
            local,
            remote,
            last_known,
        };

        info!(
            "Planned {} {} <-> {}: {} ({} deferred)",
            mode,
            self.local_root.display(),
            destination,
            plan.summary(),
            plan.deferred().count()
        );
        Ok(plan)
    }

    /// Apply the selected actions, then commit the manifest.
    ///
    /// Nothing is committed if any transfer fails.
    pub async fn execute(&self, plan: SessionPlan) -> Result<RunOutcome> {
        let selected: Vec<SyncAction> = plan.selected().cloned().collect();
        let executor = ActionExecutor::new(
            self.remote.clone(),
            self.local_root.clone(),
            self.options.concurrency_budget,
        );
        let report = executor.execute(&selected).await?;

        let manifest = self.manifest.save(&plan.committed_inventory(&report.fetched))?;

        Ok(RunOutcome {
            summary: plan.summary(),
            report,
            deferred: plan.deferred().count(),
            manifest,
        })
    }

    pub async fn run(&self, mode: RunMode) -> Result<RunOutcome> {
        let plan = self.plan(mode).await?;
        self.execute(plan).await
    }
}
