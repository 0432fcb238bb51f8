use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::state::{QueueLimits, QueueMetrics, QueueState, Snapshot};
use super::store::QueueStore;
use crate::models::{AgentId, Message, MessageId, MessageStatus};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl PersistenceError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        PersistenceError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone)]
struct SnapshotPaths {
    queue: PathBuf,
    acknowledged: PathBuf,
    failed: PathBuf,
}

impl SnapshotPaths {
    fn new(data_dir: &Path, name: &str) -> Self {
        Self {
            queue: data_dir.join(format!("{name}_queue.json")),
            acknowledged: data_dir.join(format!("{name}_acknowledged.json")),
            failed: data_dir.join(format!("{name}_failed.json")),
        }
    }
}

/// Queue store backed by JSON snapshots in a data directory.
///
/// Every content change is written back under the store lock. Reservations
/// are persisted as pending, so a crash mid-delivery re-delivers on restart.
pub struct FileQueueStore {
    state: Mutex<QueueState>,
    paths: SnapshotPaths,
    cleanup_interval: Duration,
}

impl FileQueueStore {
    /// Open (or create) the store named `name` under `data_dir`.
    ///
    /// Corrupt or unreadable records are skipped and counted in
    /// `load_errors`; only failing to create the directory is an error.
    pub async fn open(
        data_dir: impl AsRef<Path>,
        name: &str,
        limits: QueueLimits,
        cleanup_interval: Duration,
    ) -> Result<Self, PersistenceError> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)
            .await
            .map_err(|e| PersistenceError::io(data_dir, e))?;

        let paths = SnapshotPaths::new(data_dir, name);
        let mut load_errors = 0u64;

        let pending = match read_optional(&paths.queue).await {
            Some(Ok(raw)) => {
                let (records, errors) = parse_records(&raw);
                load_errors += errors;
                records
            }
            Some(Err(e)) => {
                warn!("Failed to read {}: {}", paths.queue.display(), e);
                load_errors += 1;
                Vec::new()
            }
            None => Vec::new(),
        };
        let (acknowledged, errors) = load_ids(&paths.acknowledged).await;
        load_errors += errors;
        let (failed, errors) = load_ids(&paths.failed).await;
        load_errors += errors;

        let mut state = QueueState::new(limits);
        let report = state.restore(
            Snapshot {
                pending,
                acknowledged,
                failed,
            },
            Utc::now(),
        );
        state.record_load_errors(load_errors);

        info!(
            "Opened queue '{}': {} pending restored, {} expired dropped, {} already complete, {} load errors",
            name, report.restored, report.expired, report.already_terminal, load_errors
        );

        Ok(Self {
            state: Mutex::new(state),
            paths,
            cleanup_interval,
        })
    }

    async fn persist(&self, state: &mut QueueState) {
        if !state.take_dirty() {
            return;
        }
        let snapshot = state.snapshot();
        if let Err(e) = self.write_snapshot(&snapshot).await {
            error!("Failed to persist queue snapshot: {}", e);
            state.record_persistence_error();
            state.mark_dirty();
        }
    }

    async fn write_snapshot(&self, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        write_json_atomic(&self.paths.queue, &snapshot.pending).await?;
        write_json_atomic(&self.paths.acknowledged, &snapshot.acknowledged).await?;
        write_json_atomic(&self.paths.failed, &snapshot.failed).await?;
        debug!(
            "Persisted snapshot: {} pending, {} acknowledged, {} failed",
            snapshot.pending.len(),
            snapshot.acknowledged.len(),
            snapshot.failed.len()
        );
        Ok(())
    }
}

async fn read_optional(path: &Path) -> Option<Result<String, PersistenceError>> {
    match fs::read_to_string(path).await {
        Ok(raw) => Some(Ok(raw)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => Some(Err(PersistenceError::io(path, e))),
    }
}

/// Parse a message array record by record, counting the ones that fail.
fn parse_records(raw: &str) -> (Vec<Message>, u64) {
    let values: Vec<serde_json::Value> = match serde_json::from_str(raw) {
        Ok(values) => values,
        Err(e) => {
            warn!("Queue snapshot is not a JSON array, ignoring it: {}", e);
            return (Vec::new(), 1);
        }
    };

    let mut errors = 0;
    let records = values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<Message>(value) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("Skipping unparseable queue record: {}", e);
                errors += 1;
                None
            }
        })
        .collect();
    (records, errors)
}

async fn load_ids(path: &Path) -> (Vec<MessageId>, u64) {
    let raw = match read_optional(path).await {
        Some(Ok(raw)) => raw,
        Some(Err(e)) => {
            warn!("Failed to read {}: {}", path.display(), e);
            return (Vec::new(), 1);
        }
        None => return (Vec::new(), 0),
    };

    match serde_json::from_str::<Vec<serde_json::Value>>(&raw) {
        Ok(values) => {
            let total = values.len();
            let ids: Vec<MessageId> = values
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            let errors = (total - ids.len()) as u64;
            if errors > 0 {
                warn!("Skipped {} malformed ids in {}", errors, path.display());
            }
            (ids, errors)
        }
        Err(e) => {
            warn!("Ignoring corrupt id set {}: {}", path.display(), e);
            (Vec::new(), 1)
        }
    }
}

async fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), PersistenceError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)
        .await
        .map_err(|e| PersistenceError::io(&tmp, e))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| PersistenceError::io(path, e))?;
    Ok(())
}

#[async_trait]
impl QueueStore for FileQueueStore {
    async fn enqueue(&self, message: Message) -> bool {
        let mut state = self.state.lock().await;
        let accepted = state.enqueue(message, Utc::now());
        self.persist(&mut state).await;
        accepted
    }

    async fn dequeue(&self, agent_id: &str) -> Option<Message> {
        let mut state = self.state.lock().await;
        let message = state.dequeue(agent_id, Utc::now());
        self.persist(&mut state).await;
        message
    }

    async fn next_interrupting(&self, agent_id: &str) -> Option<Message> {
        let mut state = self.state.lock().await;
        let message = state.next_interrupting(agent_id, Utc::now());
        self.persist(&mut state).await;
        message
    }

    async fn acknowledge(&self, message_id: &str) -> bool {
        let mut state = self.state.lock().await;
        let done = state.acknowledge(message_id, Utc::now());
        self.persist(&mut state).await;
        done
    }

    async fn mark_failed(&self, message_id: &str, reason: &str) -> bool {
        let mut state = self.state.lock().await;
        let done = state.mark_failed(message_id, reason, Utc::now());
        self.persist(&mut state).await;
        done
    }

    async fn release(&self, message_id: &str) -> bool {
        self.state.lock().await.release(message_id)
    }

    async fn get_queue_size(&self) -> usize {
        self.state.lock().await.queue_size()
    }

    async fn get_agent_queue_size(&self, agent_id: &str) -> usize {
        self.state.lock().await.agent_queue_size(agent_id)
    }

    async fn pending_targets(&self) -> Vec<AgentId> {
        self.state.lock().await.pending_targets()
    }

    async fn message_status(&self, message_id: &str) -> Option<MessageStatus> {
        self.state.lock().await.message_status(message_id)
    }

    async fn failure_reason(&self, message_id: &str) -> Option<String> {
        self.state.lock().await.failure_reason(message_id)
    }

    async fn metrics(&self) -> QueueMetrics {
        self.state.lock().await.metrics()
    }

    async fn prune_history(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state.lock().await;
        let removed = state.prune_history(now);
        self.persist(&mut state).await;
        removed
    }

    fn spawn_maintenance(self: Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let period = self.cleanup_interval;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = self.prune_history(Utc::now()).await;
                        if removed > 0 {
                            debug!("Pruned {} history entries", removed);
                        }
                    }
                }
            }
            debug!("Queue maintenance stopped");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MessagePriority;
    use tempfile::TempDir;

    async fn open(dir: &TempDir) -> FileQueueStore {
        FileQueueStore::open(
            dir.path(),
            "test",
            QueueLimits::default(),
            Duration::from_secs(300),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn pending_survives_reopen_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let low = Message::new("s", "a", "low").with_priority(MessagePriority::Low);
        let high = Message::new("s", "a", "high").with_priority(MessagePriority::High);

        {
            let store = open(&temp_dir).await;
            assert!(store.enqueue(low.clone()).await);
            assert!(store.enqueue(high.clone()).await);
        }

        let store = open(&temp_dir).await;
        assert_eq!(store.get_queue_size().await, 2);
        assert_eq!(store.dequeue("a").await.unwrap().id, high.id);
        assert_eq!(store.dequeue("a").await.unwrap().id, low.id);
        assert_eq!(store.metrics().await.load_errors, 0);
    }

    #[tokio::test]
    async fn snapshot_files_use_queue_name() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(&temp_dir).await;
        let m = Message::new("s", "a", "x");
        store.enqueue(m.clone()).await;
        store.dequeue("a").await;
        store.acknowledge(&m.id).await;

        for file in ["test_queue.json", "test_acknowledged.json", "test_failed.json"] {
            assert!(temp_dir.path().join(file).exists(), "{file} missing");
        }
        assert!(!temp_dir.path().join("test_queue.json.tmp").exists());

        let raw = std::fs::read_to_string(temp_dir.path().join("test_acknowledged.json")).unwrap();
        let ids: Vec<String> = serde_json::from_str(&raw).unwrap();
        assert_eq!(ids, vec![m.id]);
    }

    #[tokio::test]
    async fn in_flight_reservations_are_redelivered_after_restart() {
        let temp_dir = TempDir::new().unwrap();
        let m = Message::new("s", "a", "mid-delivery");
        {
            let store = open(&temp_dir).await;
            store.enqueue(m.clone()).await;
            assert!(store.dequeue("a").await.is_some());
        }

        let store = open(&temp_dir).await;
        assert_eq!(store.message_status(&m.id).await, Some(MessageStatus::Queued));
        assert_eq!(store.dequeue("a").await.unwrap().id, m.id);
    }

    #[tokio::test]
    async fn completed_messages_are_not_replayed() {
        let temp_dir = TempDir::new().unwrap();
        let done = Message::new("s", "a", "done");
        let failed = Message::new("s", "a", "failed");
        {
            let store = open(&temp_dir).await;
            store.enqueue(done.clone()).await;
            store.enqueue(failed.clone()).await;
            store.dequeue("a").await;
            store.dequeue("a").await;
            store.acknowledge(&done.id).await;
            store.mark_failed(&failed.id, "window closed").await;
        }

        let store = open(&temp_dir).await;
        assert_eq!(store.get_queue_size().await, 0);
        assert_eq!(store.message_status(&done.id).await, Some(MessageStatus::Delivered));
        assert_eq!(store.message_status(&failed.id).await, Some(MessageStatus::Failed));
    }

    #[tokio::test]
    async fn reload_drops_expired_and_counts_corrupt_records() {
        let temp_dir = TempDir::new().unwrap();
        let keep = Message::new("s", "a", "keep");
        let stale = Message::new("s", "a", "stale")
            .with_expires_at(Utc::now() - chrono::Duration::seconds(10));
        let records = serde_json::json!([
            serde_json::to_value(&keep).unwrap(),
            serde_json::to_value(&stale).unwrap(),
            {"id": "msg-broken", "content": 42},
        ]);
        std::fs::write(
            temp_dir.path().join("test_queue.json"),
            serde_json::to_string(&records).unwrap(),
        )
        .unwrap();
        std::fs::write(temp_dir.path().join("test_failed.json"), "not json").unwrap();

        let store = open(&temp_dir).await;
        assert_eq!(store.get_queue_size().await, 1);
        assert_eq!(store.message_status(&keep.id).await, Some(MessageStatus::Queued));
        assert_eq!(store.message_status(&stale.id).await, None);
        assert_eq!(store.metrics().await.load_errors, 2);
    }

    #[tokio::test]
    async fn open_creates_missing_directory() {
        let temp_dir = TempDir::new().unwrap();
        let nested = temp_dir.path().join("data").join("queues");
        let store = FileQueueStore::open(&nested, "q", QueueLimits::default(), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(nested.is_dir());
        assert_eq!(store.get_queue_size().await, 0);
    }

    #[tokio::test]
    async fn maintenance_task_stops_on_cancel() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(
            FileQueueStore::open(
                temp_dir.path(),
                "test",
                QueueLimits::default(),
                Duration::from_millis(10),
            )
            .await
            .unwrap(),
        );
        let cancel = CancellationToken::new();
        let handle = Arc::clone(&store)
            .spawn_maintenance(cancel.clone())
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio_test::assert_ok!(tokio::time::timeout(Duration::from_secs(1), handle).await);
    }
}
