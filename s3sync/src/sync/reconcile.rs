//! Three-way reconciliation.
//!
//! Compares the local tree, the remote bucket and the last-known manifest and
//! decides, per path, whether to upload, download or skip. Pure computation:
//! no I/O and no failure modes.

use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

use crate::inventory::{FileRecord, Inventory, RelPath};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOp {
    Upload,
    Download,
    Skip,
}

impl SyncOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOp::Upload => "upload",
            SyncOp::Download => "download",
            SyncOp::Skip => "skip",
        }
    }
}

impl fmt::Display for SyncOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an action was chosen. Diagnostic only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    NewLocal,
    DeletedRemotely,
    DeletedLocally,
    NewRemote,
    Identical,
    LocalModified,
    RemoteModified,
    /// Both sides changed since the last sync, local is newer
    LocalNewer,
    /// Both sides changed since the last sync, remote is newer
    RemoteNewer,
    /// Differing copies with no sync history, local is newer
    LocalNewerUntracked,
    /// Differing copies with no sync history, remote is newer
    RemoteNewerUntracked,
    /// Conflicting copies with identical timestamps; local wins
    TimestampTie,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::NewLocal => "new local file",
            Reason::DeletedRemotely => "deleted remotely, exists locally",
            Reason::DeletedLocally => "deleted locally",
            Reason::NewRemote => "new remote file",
            Reason::Identical => "files identical",
            Reason::LocalModified => "local file modified",
            Reason::RemoteModified => "remote file modified",
            Reason::LocalNewer => "local file newer (conflict resolution)",
            Reason::RemoteNewer => "remote file newer (conflict resolution)",
            Reason::LocalNewerUntracked => "local file newer",
            Reason::RemoteNewerUntracked => "remote file newer",
            Reason::TimestampTie => "timestamps equal, local preferred (conflict resolution)",
        }
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision for a single path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncAction {
    pub op: SyncOp,
    pub relative_path: RelPath,
    /// Record of the side being acted on
    pub record: FileRecord,
    pub reason: Reason,
}

impl SyncAction {
    pub fn new(op: SyncOp, record: &FileRecord, reason: Reason) -> Self {
        Self {
            op,
            relative_path: record.relative_path.clone(),
            record: record.clone(),
            reason,
        }
    }

    pub fn upload(local: &FileRecord, reason: Reason) -> Self {
        Self::new(SyncOp::Upload, local, reason)
    }

    pub fn download(remote: &FileRecord, reason: Reason) -> Self {
        Self::new(SyncOp::Download, remote, reason)
    }

    pub fn skip(record: &FileRecord, reason: Reason) -> Self {
        Self::new(SyncOp::Skip, record, reason)
    }
}

/// Compute one action for every path present locally or remotely.
///
/// Output is sorted by path and fully determined by the inputs. Paths known
/// only to `last_known` produce nothing. Pass `Inventory::default()` for a
/// side that has no data (e.g. the first run has no manifest).
pub fn reconcile(local: &Inventory, remote: &Inventory, last_known: &Inventory) -> Vec<SyncAction> {
    let paths: BTreeSet<&RelPath> = local.paths().chain(remote.paths()).collect();

    paths
        .into_iter()
        .filter_map(|path| {
            decide(local.get(path), remote.get(path), last_known.get(path))
        })
        .collect()
}

fn decide(
    local: Option<&FileRecord>,
    remote: Option<&FileRecord>,
    last_known: Option<&FileRecord>,
) -> Option<SyncAction> {
    let action = match (local, remote) {
        (Some(local), None) => match last_known {
            None => SyncAction::upload(local, Reason::NewLocal),
            // Local presence beats a remote deletion
            Some(_) => SyncAction::upload(local, Reason::DeletedRemotely),
        },
        (None, Some(remote)) => match last_known {
            // Never bring back a file the user removed
            Some(_) => SyncAction::skip(remote, Reason::DeletedLocally),
            None => SyncAction::download(remote, Reason::NewRemote),
        },
        (Some(local), Some(remote)) => {
            if local.content_fingerprint == remote.content_fingerprint {
                SyncAction::skip(local, Reason::Identical)
            } else {
                resolve_conflict(local, remote, last_known)
            }
        }
        (None, None) => return None,
    };

    Some(action)
}

/// Both sides hold different content for the same path.
fn resolve_conflict(
    local: &FileRecord,
    remote: &FileRecord,
    last_known: Option<&FileRecord>,
) -> SyncAction {
    let changed = |side: &FileRecord| {
        last_known.map_or(true, |known| known.content_fingerprint != side.content_fingerprint)
    };

    match (changed(local), changed(remote)) {
        (true, false) => SyncAction::upload(local, Reason::LocalModified),
        (false, true) => SyncAction::download(remote, Reason::RemoteModified),
        _ => newer_wins(local, remote, last_known.is_some()),
    }
}

fn newer_wins(local: &FileRecord, remote: &FileRecord, tracked: bool) -> SyncAction {
    use std::cmp::Ordering;

    match local.modified_at.cmp(&remote.modified_at) {
        Ordering::Greater if tracked => SyncAction::upload(local, Reason::LocalNewer),
        Ordering::Greater => SyncAction::upload(local, Reason::LocalNewerUntracked),
        Ordering::Less if tracked => SyncAction::download(remote, Reason::RemoteNewer),
        Ordering::Less => SyncAction::download(remote, Reason::RemoteNewerUntracked),
        Ordering::Equal => SyncAction::upload(local, Reason::TimestampTie),
    }
}

/// Upload/download/skip counts of an action list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub to_upload: usize,
    pub to_download: usize,
    pub to_skip: usize,
}

impl SyncSummary {
    pub fn from_actions<'a>(actions: impl IntoIterator<Item = &'a SyncAction>) -> Self {
        let mut summary = SyncSummary::default();
        for action in actions {
            match action.op {
                SyncOp::Upload => summary.to_upload += 1,
                SyncOp::Download => summary.to_download += 1,
                SyncOp::Skip => summary.to_skip += 1,
            }
        }
        summary
    }

    pub fn transfers(&self) -> usize {
        self.to_upload + self.to_download
    }
}

impl fmt::Display for SyncSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to upload, {} to download, {} to skip",
            self.to_upload, self.to_download, self.to_skip
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn rec(path: &str, fp: &str, at: i64) -> FileRecord {
        FileRecord {
            relative_path: RelPath::new(path).unwrap(),
            size: fp.len() as u64,
            modified_at: t(at),
            content_fingerprint: fp.to_string(),
        }
    }

    fn inv(records: &[FileRecord]) -> Inventory {
        records.iter().cloned().collect()
    }

    fn decisions(actions: &[SyncAction]) -> Vec<(SyncOp, &str, &str)> {
        actions
            .iter()
            .map(|a| (a.op, a.relative_path.as_str(), a.reason.as_str()))
            .collect()
    }

    #[test]
    fn test_new_local_file() {
        let actions = reconcile(&inv(&[rec("a", "fp1", 1)]), &Inventory::default(), &Inventory::default());
        assert_eq!(decisions(&actions), vec![(SyncOp::Upload, "a", "new local file")]);
    }

    #[test]
    fn test_identical_short_circuits_timestamps() {
        let actions = reconcile(
            &inv(&[rec("a", "fp1", 1)]),
            &inv(&[rec("a", "fp1", 1)]),
            &inv(&[rec("a", "fp1", 0)]),
        );
        assert_eq!(decisions(&actions), vec![(SyncOp::Skip, "a", "files identical")]);

        // Timestamps are irrelevant once content matches
        let actions = reconcile(
            &inv(&[rec("a", "fp1", 1)]),
            &inv(&[rec("a", "fp1", 99)]),
            &Inventory::default(),
        );
        assert_eq!(actions[0].op, SyncOp::Skip);
    }

    #[test]
    fn test_local_modified() {
        let actions = reconcile(
            &inv(&[rec("a", "fp2", 2)]),
            &inv(&[rec("a", "fp1", 1)]),
            &inv(&[rec("a", "fp1", 0)]),
        );
        assert_eq!(decisions(&actions), vec![(SyncOp::Upload, "a", "local file modified")]);
        assert_eq!(actions[0].record.content_fingerprint, "fp2");
    }

    #[test]
    fn test_remote_modified_even_if_local_is_newer() {
        let actions = reconcile(
            &inv(&[rec("a", "fp1", 9)]),
            &inv(&[rec("a", "fp2", 1)]),
            &inv(&[rec("a", "fp1", 0)]),
        );
        assert_eq!(decisions(&actions), vec![(SyncOp::Download, "a", "remote file modified")]);
        assert_eq!(actions[0].record.content_fingerprint, "fp2");
    }

    #[test]
    fn test_deleted_locally_is_respected() {
        let actions = reconcile(
            &Inventory::default(),
            &inv(&[rec("a", "fp1", 1)]),
            &inv(&[rec("a", "fp1", 0)]),
        );
        assert_eq!(decisions(&actions), vec![(SyncOp::Skip, "a", "deleted locally")]);
    }

    #[test]
    fn test_deleted_remotely_is_resurrected() {
        let actions = reconcile(
            &inv(&[rec("a", "fp1", 1)]),
            &Inventory::default(),
            &inv(&[rec("a", "fp1", 0)]),
        );
        assert_eq!(
            decisions(&actions),
            vec![(SyncOp::Upload, "a", "deleted remotely, exists locally")]
        );
    }

    #[test]
    fn test_new_remote_file() {
        let actions = reconcile(&Inventory::default(), &inv(&[rec("a", "fp1", 1)]), &Inventory::default());
        assert_eq!(decisions(&actions), vec![(SyncOp::Download, "a", "new remote file")]);
    }

    #[test]
    fn test_both_changed_newer_wins() {
        let local_newer = reconcile(
            &inv(&[rec("a", "fp2", 3)]),
            &inv(&[rec("a", "fp3", 2)]),
            &inv(&[rec("a", "fp1", 1)]),
        );
        assert_eq!(
            decisions(&local_newer),
            vec![(SyncOp::Upload, "a", "local file newer (conflict resolution)")]
        );

        let remote_newer = reconcile(
            &inv(&[rec("a", "fp2", 2)]),
            &inv(&[rec("a", "fp3", 3)]),
            &inv(&[rec("a", "fp1", 1)]),
        );
        assert_eq!(
            decisions(&remote_newer),
            vec![(SyncOp::Download, "a", "remote file newer (conflict resolution)")]
        );
    }

    #[test]
    fn test_untracked_conflict_uses_timestamps() {
        let actions = reconcile(
            &inv(&[rec("a", "fp1", 1), rec("b", "fp1", 5)]),
            &inv(&[rec("a", "fp2", 5), rec("b", "fp2", 1)]),
            &Inventory::default(),
        );
        assert_eq!(
            decisions(&actions),
            vec![
                (SyncOp::Download, "a", "remote file newer"),
                (SyncOp::Upload, "b", "local file newer"),
            ]
        );
    }

    #[test]
    fn test_timestamp_tie_prefers_local() {
        let actions = reconcile(
            &inv(&[rec("a", "fp2", 4)]),
            &inv(&[rec("a", "fp3", 4)]),
            &inv(&[rec("a", "fp1", 1)]),
        );
        assert_eq!(actions[0].op, SyncOp::Upload);
        assert_eq!(actions[0].reason, Reason::TimestampTie);
    }

    #[test]
    fn test_one_action_per_path_sorted() {
        let local = inv(&[rec("c", "x", 1), rec("a", "x", 1)]);
        let remote = inv(&[rec("b", "y", 1), rec("a", "x", 1)]);
        let last_known = inv(&[rec("gone", "z", 1)]);

        let actions = reconcile(&local, &remote, &last_known);
        let paths: Vec<&str> = actions.iter().map(|a| a.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_deterministic() {
        let local = inv(&[rec("a", "1", 1), rec("b", "2", 2), rec("d", "4", 4)]);
        let remote = inv(&[rec("a", "9", 3), rec("c", "3", 3), rec("d", "4", 0)]);
        let last_known = inv(&[rec("a", "1", 0), rec("c", "3", 0)]);

        let first = reconcile(&local, &remote, &last_known);
        let second = reconcile(&local, &remote, &last_known);
        assert_eq!(first, second);
    }

    #[test]
    fn test_idempotent_after_commit() {
        // After converging, the agreed state becomes the manifest and a rerun skips everything
        let local = inv(&[rec("a", "1", 1), rec("b", "2", 2)]);
        let remote = local.clone();

        let actions = reconcile(&local, &remote, &local);
        assert!(actions.iter().all(|a| a.op == SyncOp::Skip));
    }

    #[test]
    fn test_convergence_from_empty_history() {
        let local = inv(&[rec("a", "L", 5), rec("b", "shared", 1), rec("c", "Lc", 1)]);
        let remote = inv(&[rec("a", "R", 1), rec("b", "shared", 9), rec("d", "Rd", 1)]);

        let actions = reconcile(&local, &remote, &Inventory::default());

        // Apply actions to both sides the way the executor would
        let mut new_local = local.clone();
        let mut new_remote = remote.clone();
        for action in &actions {
            match action.op {
                SyncOp::Upload => {
                    new_remote.insert(action.record.clone());
                }
                SyncOp::Download => {
                    new_local.insert(action.record.clone());
                }
                SyncOp::Skip => {}
            }
        }

        assert_eq!(new_local.len(), new_remote.len());
        for record in new_local.records() {
            let other = new_remote.get(&record.relative_path).unwrap();
            assert_eq!(record.content_fingerprint, other.content_fingerprint);
        }
    }

    #[test]
    fn test_fingerprint_is_the_trust_boundary() {
        // Equal tags are taken as equal bytes even when sizes disagree
        let mut local = rec("a", "same-tag", 1);
        local.size = 10;
        let mut remote = rec("a", "same-tag", 2);
        remote.size = 20;

        let actions = reconcile(&inv(&[local]), &inv(&[remote]), &Inventory::default());
        assert_eq!(actions[0].reason, Reason::Identical);
    }

    #[test]
    fn test_summary_counts() {
        let actions = reconcile(
            &inv(&[rec("up", "1", 1), rec("same", "s", 1)]),
            &inv(&[rec("down", "2", 1), rec("same", "s", 1), rec("gone", "g", 1)]),
            &inv(&[rec("gone", "g", 0)]),
        );
        let summary = SyncSummary::from_actions(&actions);

        assert_eq!(
            summary,
            SyncSummary {
                to_upload: 1,
                to_download: 1,
                to_skip: 2
            }
        );
        assert_eq!(summary.transfers(), 2);
        assert_eq!(summary.to_string(), "1 to upload, 1 to download, 2 to skip");
    }
}
