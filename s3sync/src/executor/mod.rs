//! Action executor - applies reconciled actions through a transfer collaborator.
//!
//! Transfers run as parallel tokio tasks gated by a weighted semaphore, so
//! many small files move concurrently while large files share bandwidth with
//! fewer neighbours. The first failed transfer cancels everything that has
//! not started yet.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::inventory::RelPath;
use crate::store::Transfer;
use crate::sync::reconcile::{SyncAction, SyncOp};
use crate::utils::errors::{Result, SyncError};
use crate::utils::format::{format_bytes, format_duration, format_rate};

/// Effective concurrency per size tier when the budget is large enough.
///
/// | File size       | Max concurrent |
/// |-----------------|----------------|
/// | < 10 MB         | 64             |
/// | 10 – 100 MB     | 32             |
/// | 100 – 500 MB    | 4              |
/// | 500 MB – 1 GB   | 2              |
/// | > 1 GB          | 1              |
fn tier_concurrency(file_size: u64) -> u32 {
    match file_size {
        0..=10_485_759 => 64,
        10_485_760..=104_857_599 => 32,
        104_857_600..=524_287_999 => 4,
        524_288_000..=1_073_741_823 => 2,
        _ => 1,
    }
}

/// Number of semaphore permits a transfer of `file_size` bytes acquires
/// out of `budget`. Always in `1..=budget`.
pub fn concurrency_weight(file_size: u64, budget: u32) -> u32 {
    let budget = budget.max(1);
    budget.div_ceil(tier_concurrency(file_size)).clamp(1, budget)
}

/// Counts of an executed action list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub uploaded: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub bytes_transferred: u64,
    pub duration: Duration,
    /// Content fingerprint of every downloaded file, as written locally
    pub fetched: BTreeMap<RelPath, String>,
}

/// How a spawned transfer task ended.
enum TaskEnd {
    Cancelled,
    Uploaded,
    Downloaded(String),
}

/// Applies upload and download actions under a local root.
pub struct ActionExecutor {
    transfer: Arc<dyn Transfer>,
    local_root: PathBuf,
    budget: u32,
}

impl ActionExecutor {
    pub fn new(transfer: Arc<dyn Transfer>, local_root: impl Into<PathBuf>, budget: u32) -> Self {
        Self {
            transfer,
            local_root: local_root.into(),
            budget: budget.max(1),
        }
    }

    /// Execute every action; `Skip` is a no-op.
    ///
    /// Returns the first `TransferFailed` if any transfer fails. Transfers
    /// already in flight at that point are allowed to finish.
    pub async fn execute(&self, actions: &[SyncAction]) -> Result<ExecutionReport> {
        let start_time = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.budget as usize));
        let cancel = CancellationToken::new();

        let uploaded = Arc::new(AtomicUsize::new(0));
        let downloaded = Arc::new(AtomicUsize::new(0));
        let bytes_transferred = Arc::new(AtomicU64::new(0));

        let mut skipped = 0usize;
        let mut handles = Vec::with_capacity(actions.len());

        for action in actions {
            if action.op == SyncOp::Skip {
                skipped += 1;
                continue;
            }

            let action = action.clone();
            let path = action.relative_path.clone();
            let transfer = Arc::clone(&self.transfer);
            let local_path = action.relative_path.to_local_path(&self.local_root);
            let sem = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let weight = concurrency_weight(action.record.size, self.budget);
            let uploaded = Arc::clone(&uploaded);
            let downloaded = Arc::clone(&downloaded);
            let bytes_transferred = Arc::clone(&bytes_transferred);

            let handle = tokio::spawn(async move {
                let permit = tokio::select! {
                    result = sem.acquire_many(weight) => {
                        result.map_err(|e| SyncError::transfer_failed(action.relative_path.as_str(), e))?
                    }
                    _ = cancel.cancelled() => return Ok(TaskEnd::Cancelled),
                };

                if cancel.is_cancelled() {
                    return Ok(TaskEnd::Cancelled);
                }

                debug!("{} {} ({})", action.op, action.relative_path, action.reason);
                let result = match action.op {
                    SyncOp::Upload => transfer
                        .put(&local_path, &action.relative_path, &action.record.content_fingerprint)
                        .await
                        .map(|()| TaskEnd::Uploaded),
                    SyncOp::Download => transfer
                        .get(&action.relative_path, &local_path)
                        .await
                        .map(TaskEnd::Downloaded),
                    SyncOp::Skip => Ok(TaskEnd::Cancelled),
                };

                // Cancel before the permit is released so no queued task starts
                if let Err(e) = &result {
                    error!("Failed to {} {}: {}", action.op, action.relative_path, e);
                    cancel.cancel();
                }
                drop(permit);

                match &result {
                    Ok(TaskEnd::Uploaded) => {
                        uploaded.fetch_add(1, Ordering::Relaxed);
                        bytes_transferred.fetch_add(action.record.size, Ordering::Relaxed);
                    }
                    Ok(TaskEnd::Downloaded(_)) => {
                        downloaded.fetch_add(1, Ordering::Relaxed);
                        bytes_transferred.fetch_add(action.record.size, Ordering::Relaxed);
                    }
                    _ => {}
                }
                result
            });

            handles.push((path, handle));
        }

        info!(
            "Executing {} transfers ({} skipped), concurrency budget {}",
            handles.len(),
            skipped,
            self.budget
        );

        let mut first_error: Option<SyncError> = None;
        let mut not_started = 0usize;
        let mut fetched = BTreeMap::new();
        for (path, handle) in handles {
            match handle.await {
                Ok(Ok(TaskEnd::Downloaded(fingerprint))) => {
                    fetched.insert(path, fingerprint);
                }
                Ok(Ok(TaskEnd::Uploaded)) => {}
                Ok(Ok(TaskEnd::Cancelled)) => not_started += 1,
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    cancel.cancel();
                    first_error.get_or_insert(SyncError::transfer_failed(path.as_str(), e));
                }
            }
        }

        if let Some(e) = first_error {
            info!("Aborted run: {} transfers not started", not_started);
            return Err(e);
        }

        let report = ExecutionReport {
            uploaded: uploaded.load(Ordering::Relaxed),
            downloaded: downloaded.load(Ordering::Relaxed),
            skipped,
            bytes_transferred: bytes_transferred.load(Ordering::Relaxed),
            duration: start_time.elapsed(),
            fetched,
        };

        info!(
            "Transferred {} in {} ({}): {} uploaded, {} downloaded, {} skipped",
            format_bytes(report.bytes_transferred),
            format_duration(report.duration),
            format_rate(report.bytes_transferred, report.duration),
            report.uploaded,
            report.downloaded,
            report.skipped
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::fingerprint::hash_bytes;
    use crate::inventory::{Destination, FileRecord, RelPath};
    use crate::store::MemoryStore;
    use crate::sync::reconcile::Reason;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(path: &str, data: &[u8]) -> FileRecord {
        FileRecord {
            relative_path: RelPath::new(path).unwrap(),
            size: data.len() as u64,
            modified_at: Utc::now(),
            content_fingerprint: hash_bytes(data),
        }
    }

    #[test]
    fn test_concurrency_weight() {
        assert_eq!(concurrency_weight(0, 64), 1);
        assert_eq!(concurrency_weight(50 * 1024 * 1024, 64), 2);
        assert_eq!(concurrency_weight(200 * 1024 * 1024, 64), 16);
        assert_eq!(concurrency_weight(600 * 1024 * 1024, 64), 32);
        assert_eq!(concurrency_weight(2 * 1024 * 1024 * 1024, 64), 64);

        assert_eq!(concurrency_weight(50 * 1024 * 1024, 16), 1);
        assert_eq!(concurrency_weight(200 * 1024 * 1024, 16), 4);
        assert_eq!(concurrency_weight(2 * 1024 * 1024 * 1024, 16), 16);
        assert_eq!(concurrency_weight(2 * 1024 * 1024 * 1024, 1), 1);
    }

    #[tokio::test]
    async fn test_execute_uploads_downloads_and_skips() -> Result<()> {
        let temp_dir = TempDir::new()?;
        std::fs::write(temp_dir.path().join("up.txt"), b"local")?;

        let store = Arc::new(MemoryStore::new(Destination::new("bucket")));
        store.insert("down/file.txt", b"remote", Utc::now());

        let actions = vec![
            SyncAction::download(&record("down/file.txt", b"remote"), Reason::NewRemote),
            SyncAction::skip(&record("same.txt", b"x"), Reason::Identical),
            SyncAction::upload(&record("up.txt", b"local"), Reason::NewLocal),
        ];

        let executor = ActionExecutor::new(store.clone(), temp_dir.path(), 4);
        let report = executor.execute(&actions).await?;

        assert_eq!(report.uploaded, 1);
        assert_eq!(report.downloaded, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.bytes_transferred, 11);
        assert_eq!(store.object("up.txt").as_deref(), Some(&b"local"[..]));
        assert_eq!(std::fs::read(temp_dir.path().join("down/file.txt"))?, b"remote");
        assert_eq!(
            report.fetched.get(&RelPath::new("down/file.txt")?),
            Some(&hash_bytes(b"remote"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_reports_failing_path() -> Result<()> {
        let temp_dir = TempDir::new()?;
        std::fs::write(temp_dir.path().join("ok.txt"), b"fine")?;
        std::fs::write(temp_dir.path().join("bad.txt"), b"broken")?;

        let store = Arc::new(MemoryStore::new(Destination::new("bucket")));
        store.fail_transfers_for(&RelPath::new("bad.txt")?);

        let actions = vec![
            SyncAction::upload(&record("bad.txt", b"broken"), Reason::NewLocal),
            SyncAction::upload(&record("ok.txt", b"fine"), Reason::NewLocal),
        ];

        let executor = ActionExecutor::new(store.clone(), temp_dir.path(), 1);
        let err = executor.execute(&actions).await.unwrap_err();

        match err {
            SyncError::TransferFailed { path, .. } => assert_eq!(path, "bad.txt"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(store.object("bad.txt").is_none());
        // Queued behind the failure, so never started
        assert!(store.object("ok.txt").is_none());
        assert_eq!(store.transfer_counts(), (0, 0));
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_action_list() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = Arc::new(MemoryStore::new(Destination::new("bucket")));

        let report = ActionExecutor::new(store, temp_dir.path(), 8).execute(&[]).await?;
        assert_eq!(report.uploaded + report.downloaded + report.skipped, 0);
        Ok(())
    }
}
