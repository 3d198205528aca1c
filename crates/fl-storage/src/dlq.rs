//! Dead-letter queue
//!
//! Durable parking lot for batches the writer could not persist. Batches
//! land in an in-memory queue first (enqueue never blocks a producer) and a
//! background task flushes them to one JSON file per batch, either on a 30s
//! timer or immediately once the queue grows past a threshold. Files that
//! fail to parse on load are moved to an `errors/` sibling directory, never
//! silently dropped.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use fl_common::{DeviceReading, FailedBatch};

use crate::writer::StorageError;

/// Cadence of the background persistence sweep.
const PERSIST_INTERVAL: Duration = Duration::from_secs(30);
/// Queue depth that triggers an immediate flush instead of waiting for the
/// timer.
const IMMEDIATE_FLUSH_THRESHOLD: usize = 1000;

pub struct DeadLetterQueue {
    dir: PathBuf,
    errors_dir: PathBuf,
    pending: Mutex<VecDeque<FailedBatch>>,
    /// Serializes all file-system work; the in-memory queue has its own lock.
    disk_lock: tokio::sync::Mutex<()>,
    flush_now: Notify,
    cancel: CancellationToken,
    persist_task: Mutex<Option<JoinHandle<()>>>,
}

impl DeadLetterQueue {
    /// Open (creating directories as needed) and start the persistence task.
    pub fn open(dir: impl AsRef<Path>) -> Result<Arc<Self>, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        let errors_dir = dir.join("errors");
        std::fs::create_dir_all(&dir)?;
        std::fs::create_dir_all(&errors_dir)?;

        let queue = Arc::new(Self {
            dir,
            errors_dir,
            pending: Mutex::new(VecDeque::new()),
            disk_lock: tokio::sync::Mutex::new(()),
            flush_now: Notify::new(),
            cancel: CancellationToken::new(),
            persist_task: Mutex::new(None),
        });

        let task = tokio::spawn(run_persistence(Arc::clone(&queue)));
        *queue.persist_task.lock() = Some(task);

        info!(dir = %queue.dir.display(), "Dead-letter queue opened");
        Ok(queue)
    }

    /// Park a failed batch. Infallible and non-blocking; durability comes
    /// from the background flush.
    pub fn enqueue(&self, readings: Vec<DeviceReading>, error: impl Into<String>, retry_attempts: u32) {
        let batch = FailedBatch::new(readings, error, retry_attempts);
        let depth = {
            let mut pending = self.pending.lock();
            pending.push_back(batch);
            pending.len()
        };
        if depth > IMMEDIATE_FLUSH_THRESHOLD {
            self.flush_now.notify_one();
        }
    }

    /// Rewrite a batch on disk, typically after a replay attempt bumped its
    /// retry counter.
    pub async fn requeue(&self, batch: FailedBatch) -> Result<(), StorageError> {
        let _guard = self.disk_lock.lock().await;
        self.write_batch_file(&batch).await
    }

    /// Flush the in-memory queue to disk.
    pub async fn persist_pending(&self) -> Result<(), StorageError> {
        let drained: Vec<FailedBatch> = {
            let mut pending = self.pending.lock();
            pending.drain(..).collect()
        };
        if drained.is_empty() {
            return Ok(());
        }
        let _guard = self.disk_lock.lock().await;
        let count = drained.len();
        for batch in drained {
            self.write_batch_file(&batch).await?;
        }
        debug!(count, "Persisted dead-letter batches");
        Ok(())
    }

    /// Everything currently parked: the in-memory queue is persisted first,
    /// then every file is read back. Corrupt files are moved aside and
    /// logged.
    pub async fn snapshot(&self) -> Result<Vec<FailedBatch>, StorageError> {
        self.persist_pending().await?;

        let _guard = self.disk_lock.lock().await;
        let mut batches = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<FailedBatch>(&bytes) {
                Ok(batch) => batches.push(batch),
                Err(err) => {
                    let file_name = path.file_name().unwrap_or_default().to_os_string();
                    let target = self.errors_dir.join(&file_name);
                    warn!(
                        file = %path.display(),
                        %err,
                        "Unparseable dead-letter file, moving aside"
                    );
                    if let Err(err) = tokio::fs::rename(&path, &target).await {
                        warn!(file = %path.display(), %err, "Could not quarantine file");
                    }
                }
            }
        }
        batches.sort_by_key(|b| b.timestamp);
        Ok(batches)
    }

    /// Delete a batch's file after a successful replay.
    pub async fn mark_processed(&self, id: Uuid) -> bool {
        let _guard = self.disk_lock.lock().await;
        let path = self.batch_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => true,
            Err(err) => {
                debug!(%id, %err, "Dead-letter file not removed");
                false
            }
        }
    }

    /// In-memory depth plus on-disk file count.
    pub async fn size(&self) -> usize {
        let in_memory = self.pending.lock().len();
        let _guard = self.disk_lock.lock().await;
        let mut on_disk = 0usize;
        if let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if entry.path().extension().and_then(|e| e.to_str()) == Some("json") {
                    on_disk += 1;
                }
            }
        }
        in_memory + on_disk
    }

    /// Best-effort purge; operator use only.
    pub async fn clear(&self) {
        self.pending.lock().clear();
        let _guard = self.disk_lock.lock().await;
        if let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) == Some("json") {
                    let _ = tokio::fs::remove_file(path).await;
                }
            }
        }
        info!("Dead-letter queue cleared");
    }

    /// Stop the persistence task and write out everything still queued.
    /// Batches are on disk before the queue counts as closed.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.persist_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        if let Err(err) = self.persist_pending().await {
            warn!(%err, "Final dead-letter persist failed");
        }
    }

    fn batch_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    async fn write_batch_file(&self, batch: &FailedBatch) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec_pretty(batch)?;
        tokio::fs::write(self.batch_path(batch.id), bytes).await?;
        Ok(())
    }
}

/// Timer-and-threshold flush loop. The cancellation token gates every
/// iteration so no new disk work starts once disposal is requested.
async fn run_persistence(queue: Arc<DeadLetterQueue>) {
    loop {
        tokio::select! {
            _ = queue.cancel.cancelled() => break,
            _ = queue.flush_now.notified() => {}
            _ = sleep(PERSIST_INTERVAL) => {}
        }
        if let Err(err) = queue.persist_pending().await {
            warn!(%err, "Dead-letter persistence sweep failed");
        }
    }
    debug!("Dead-letter persistence task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use fl_common::Quality;

    fn reading(device: &str, raw: i64) -> DeviceReading {
        DeviceReading::new(device, 0, raw)
    }

    #[tokio::test]
    async fn enqueue_then_snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = DeadLetterQueue::open(dir.path()).unwrap();

        dlq.enqueue(vec![reading("adam-01", 42)], "connection reset", 0);
        let batches = dlq.snapshot().await.unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].error, "connection reset");
        assert_eq!(batches[0].readings[0].raw_value, 42);
        assert_eq!(batches[0].readings[0].quality, Quality::Good);
        assert!(batches[0].should_retry());

        // The batch survived to disk as <uuid>.json.
        let path = dir.path().join(format!("{}.json", batches[0].id));
        assert!(path.exists());
        dlq.shutdown().await;
    }

    #[tokio::test]
    async fn mark_processed_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = DeadLetterQueue::open(dir.path()).unwrap();
        dlq.enqueue(vec![reading("adam-01", 1)], "oops", 0);
        let batch = dlq.snapshot().await.unwrap().remove(0);

        assert!(dlq.mark_processed(batch.id).await);
        assert_eq!(dlq.size().await, 0);
        assert!(!dlq.mark_processed(batch.id).await);
        dlq.shutdown().await;
    }

    #[tokio::test]
    async fn corrupt_files_are_quarantined() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = DeadLetterQueue::open(dir.path()).unwrap();
        std::fs::write(dir.path().join("not-a-batch.json"), b"{broken").unwrap();

        let batches = dlq.snapshot().await.unwrap();
        assert!(batches.is_empty());
        assert!(!dir.path().join("not-a-batch.json").exists());
        assert!(dir.path().join("errors").join("not-a-batch.json").exists());
        dlq.shutdown().await;
    }

    #[tokio::test]
    async fn size_spans_memory_and_disk() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = DeadLetterQueue::open(dir.path()).unwrap();
        dlq.enqueue(vec![reading("a", 1)], "e", 0);
        dlq.persist_pending().await.unwrap();
        dlq.enqueue(vec![reading("b", 2)], "e", 0);
        assert_eq!(dlq.size().await, 2);
        dlq.shutdown().await;
    }

    #[tokio::test]
    async fn requeue_overwrites_with_new_attempt_count() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = DeadLetterQueue::open(dir.path()).unwrap();
        dlq.enqueue(vec![reading("a", 1)], "first failure", 0);
        let mut batch = dlq.snapshot().await.unwrap().remove(0);

        batch.retry_attempts += 1;
        batch.error = "second failure".to_string();
        dlq.requeue(batch.clone()).await.unwrap();

        let batches = dlq.snapshot().await.unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].retry_attempts, 1);
        assert_eq!(batches[0].error, "second failure");
        dlq.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_persists_whatever_is_queued() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = DeadLetterQueue::open(dir.path()).unwrap();
        dlq.enqueue(vec![reading("a", 1)], "e", 0);
        dlq.shutdown().await;

        let files: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().and_then(|x| x.to_str()) == Some("json"))
            .collect();
        assert_eq!(files.len(), 1);
    }

    #[tokio::test]
    async fn clear_purges_everything() {
        let dir = tempfile::tempdir().unwrap();
        let dlq = DeadLetterQueue::open(dir.path()).unwrap();
        dlq.enqueue(vec![reading("a", 1)], "e", 0);
        dlq.persist_pending().await.unwrap();
        dlq.enqueue(vec![reading("b", 2)], "e", 0);
        dlq.clear().await;
        assert_eq!(dlq.size().await, 0);
        dlq.shutdown().await;
    }
}
