//! Change events and the reindex task queue.
//!
//! Every committed write to a customer or one of its dependent records ends
//! with an explicit [`ChangePublisher::publish`] call. The default publisher
//! is [`TaskQueue`], which hands the event to the reindex workers and tracks
//! its progress in a [`TaskRegistry`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use uuid::Uuid;

use crate::index::BulkSummary;
use crate::{Error, Result};

/// How long finished task records stay queryable.
pub const DEFAULT_TASK_RETENTION: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl ChangeKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChangeKind {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "updated" => Ok(Self::Updated),
            "deleted" => Ok(Self::Deleted),
            _ => Err(Error::corrupt("change_kind", s)),
        }
    }
}

/// Which record's write produced the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeCause {
    Customer,
    Metrics,
    Feedback,
    Meeting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub kind: ChangeKind,
    pub cause: ChangeCause,
    pub occurred_at: DateTime<Utc>,
}

impl ChangeEvent {
    #[must_use]
    pub fn new(customer_id: Uuid, kind: ChangeKind, cause: ChangeCause) -> Self {
        Self {
            id: Uuid::now_v7(),
            customer_id,
            kind,
            cause,
            occurred_at: Utc::now(),
        }
    }

    /// Dependent-record writes always update the owning customer's index entry.
    #[must_use]
    pub fn dependent(customer_id: Uuid, cause: ChangeCause) -> Self {
        Self::new(customer_id, ChangeKind::Updated, cause)
    }
}

/// Receives change events after the write they describe has committed.
#[async_trait]
pub trait ChangePublisher: Send + Sync {
    /// Returns the id of the task that will process the event.
    async fn publish(&self, event: ChangeEvent) -> Result<Uuid>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Retrying,
    Succeeded,
    Failed,
}

impl TaskStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReindexJob {
    Change(ChangeEvent),
    Bulk { batch_size: usize },
}

impl ReindexJob {
    #[must_use]
    pub const fn customer_id(&self) -> Option<Uuid> {
        match self {
            Self::Change(event) => Some(event.customer_id),
            Self::Bulk { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReindexTask {
    pub id: Uuid,
    pub job: ReindexJob,
    /// Attempts already made.
    pub attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub job: ReindexJob,
    pub status: TaskStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Counts from the latest attempt of a bulk job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<BulkSummary>,
    pub updated_at: DateTime<Utc>,
}

/// A reindex task that ran out of attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReindexFailure {
    pub id: Uuid,
    pub task_id: Uuid,
    /// Nil for bulk runs.
    pub customer_id: Uuid,
    pub kind: ChangeKind,
    pub attempts: u32,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Default)]
struct Board {
    tasks: HashMap<Uuid, TaskRecord>,
    /// Terminal tasks, oldest first.
    finished: VecDeque<(Instant, Uuid)>,
}

impl Board {
    fn evict_expired(&mut self, retention: Duration) {
        while let Some(&(at, id)) = self.finished.front() {
            if at.elapsed() < retention {
                break;
            }
            self.finished.pop_front();
            self.tasks.remove(&id);
        }
    }
}

/// In-process status board for reindex tasks. Terminal records are evicted
/// once they are older than the retention window.
#[derive(Clone)]
pub struct TaskRegistry {
    board: Arc<RwLock<Board>>,
    retention: Duration,
    generation: Arc<watch::Sender<u64>>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_TASK_RETENTION)
    }

    #[must_use]
    pub fn with_retention(retention: Duration) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            board: Arc::new(RwLock::new(Board::default())),
            retention,
            generation: Arc::new(generation),
        }
    }

    pub async fn register(&self, id: Uuid, job: ReindexJob) {
        let record = TaskRecord {
            id,
            job,
            status: TaskStatus::Queued,
            attempts: 0,
            last_error: None,
            summary: None,
            updated_at: Utc::now(),
        };
        {
            let mut board = self.board.write().await;
            board.evict_expired(self.retention);
            board.tasks.insert(id, record);
        }
        self.bump();
    }

    pub async fn update(
        &self,
        id: Uuid,
        status: TaskStatus,
        attempts: u32,
        last_error: Option<String>,
    ) {
        {
            let mut board = self.board.write().await;
            board.evict_expired(self.retention);
            let Board { tasks, finished } = &mut *board;
            if let Some(record) = tasks.get_mut(&id) {
                if status.is_terminal() && !record.status.is_terminal() {
                    finished.push_back((Instant::now(), id));
                }
                record.status = status;
                record.attempts = attempts;
                if last_error.is_some() {
                    record.last_error = last_error;
                }
                record.updated_at = Utc::now();
            }
        }
        self.bump();
    }

    /// Stores the counts of a bulk attempt. Call before the terminal update
    /// so waiters see both together.
    pub async fn attach_summary(&self, id: Uuid, summary: BulkSummary) {
        if let Some(record) = self.board.write().await.tasks.get_mut(&id) {
            record.summary = Some(summary);
        }
    }

    pub async fn get(&self, id: Uuid) -> Option<TaskRecord> {
        self.board.read().await.tasks.get(&id).cloned()
    }

    /// Records currently held, live and finished.
    pub async fn record_count(&self) -> usize {
        self.board.read().await.tasks.len()
    }

    pub async fn pending(&self) -> usize {
        self.board
            .read()
            .await
            .tasks
            .values()
            .filter(|r| !r.status.is_terminal())
            .count()
    }

    /// Waits until the task reaches a terminal status. Returns `None` on
    /// timeout or for an unknown or evicted task.
    pub async fn wait(&self, id: Uuid, timeout: Duration) -> Option<TaskRecord> {
        let mut rx = self.generation.subscribe();
        tokio::time::timeout(timeout, async {
            loop {
                match self.get(id).await {
                    Some(record) if record.status.is_terminal() => return Some(record),
                    None => return None,
                    Some(_) => {}
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        })
        .await
        .ok()
        .flatten()
    }

    /// Waits until no task is queued, running or retrying. Returns false on
    /// timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let mut rx = self.generation.subscribe();
        tokio::time::timeout(timeout, async {
            while self.pending().await > 0 {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok()
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g = g.wrapping_add(1));
    }
}

/// Sending half of the reindex queue. Cheap to clone.
#[derive(Clone)]
pub struct TaskQueue {
    sender: mpsc::UnboundedSender<ReindexTask>,
    registry: TaskRegistry,
}

/// Receiving half, shared by every worker.
pub type TaskReceiver = Arc<Mutex<mpsc::UnboundedReceiver<ReindexTask>>>;

impl TaskQueue {
    #[must_use]
    pub fn channel() -> (Self, TaskReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = Self {
            sender,
            registry: TaskRegistry::new(),
        };
        (queue, Arc::new(Mutex::new(receiver)))
    }

    #[must_use]
    pub const fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub async fn enqueue(&self, job: ReindexJob) -> Result<Uuid> {
        let id = Uuid::now_v7();
        self.registry.register(id, job.clone()).await;
        self.send(ReindexTask {
            id,
            job,
            attempts: 0,
        })?;
        Ok(id)
    }

    /// Puts a task back on the queue after `delay` without holding a worker.
    pub fn requeue_after(&self, task: ReindexTask, delay: Duration) {
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let (id, attempts) = (task.id, task.attempts);
            if queue.send(task).is_err() {
                tracing::warn!(task_id = %id, "Reindex queue closed before retry");
                queue
                    .registry
                    .update(id, TaskStatus::Failed, attempts, Some("queue closed".into()))
                    .await;
            }
        });
    }

    fn send(&self, task: ReindexTask) -> Result<()> {
        self.sender.send(task).map_err(|_| Error::QueueClosed)
    }
}

#[async_trait]
impl ChangePublisher for TaskQueue {
    async fn publish(&self, event: ChangeEvent) -> Result<Uuid> {
        tracing::debug!(
            customer_id = %event.customer_id,
            kind = %event.kind,
            "Publishing change event"
        );
        self.enqueue(ReindexJob::Change(event)).await
    }
}

/// Keeps published events in memory. Useful where no workers run.
#[derive(Default)]
pub struct RecordingPublisher {
    events: Mutex<Vec<ChangeEvent>>,
}

impl RecordingPublisher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<ChangeEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl ChangePublisher for RecordingPublisher {
    async fn publish(&self, event: ChangeEvent) -> Result<Uuid> {
        self.events.lock().await.push(event);
        Ok(Uuid::now_v7())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_registers_queued_task() {
        let (queue, receiver) = TaskQueue::channel();
        let customer_id = Uuid::now_v7();
        let task_id = queue
            .publish(ChangeEvent::new(customer_id, ChangeKind::Created, ChangeCause::Customer))
            .await
            .unwrap();

        let record = queue.registry().get(task_id).await.unwrap();
        assert_eq!(record.status, TaskStatus::Queued);
        assert_eq!(record.job.customer_id(), Some(customer_id));

        let task = receiver.lock().await.recv().await.unwrap();
        assert_eq!(task.id, task_id);
        assert_eq!(task.attempts, 0);
    }

    #[tokio::test]
    async fn test_wait_returns_terminal_record() {
        let registry = TaskRegistry::new();
        let id = Uuid::now_v7();
        registry.register(id, ReindexJob::Bulk { batch_size: 10 }).await;

        let waiter = registry.clone();
        let handle = tokio::spawn(async move { waiter.wait(id, Duration::from_secs(5)).await });

        registry.update(id, TaskStatus::Running, 1, None).await;
        registry.update(id, TaskStatus::Succeeded, 1, None).await;

        let record = handle.await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Succeeded);
        assert!(registry.wait_idle(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_wait_times_out_on_pending_task() {
        let registry = TaskRegistry::new();
        let id = Uuid::now_v7();
        registry.register(id, ReindexJob::Bulk { batch_size: 10 }).await;

        assert!(registry.wait(id, Duration::from_millis(20)).await.is_none());
        assert!(!registry.wait_idle(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_expired_terminal_records_are_evicted() {
        let registry = TaskRegistry::with_retention(Duration::from_millis(50));
        let old = Uuid::now_v7();
        registry.register(old, ReindexJob::Bulk { batch_size: 10 }).await;
        registry.update(old, TaskStatus::Succeeded, 1, None).await;
        let stuck = Uuid::now_v7();
        registry.register(stuck, ReindexJob::Bulk { batch_size: 10 }).await;
        registry.update(stuck, TaskStatus::Retrying, 1, Some("timeout".into())).await;

        tokio::time::sleep(Duration::from_millis(120)).await;

        let live = Uuid::now_v7();
        registry.register(live, ReindexJob::Bulk { batch_size: 10 }).await;
        assert!(registry.get(old).await.is_none());
        assert_eq!(registry.get(stuck).await.unwrap().status, TaskStatus::Retrying);
        assert_eq!(registry.record_count().await, 2);

        let waiter = registry.clone();
        let handle = tokio::spawn(async move { waiter.wait(live, Duration::from_secs(5)).await });
        registry.update(live, TaskStatus::Running, 1, None).await;
        registry.update(live, TaskStatus::Failed, 1, Some("boom".into())).await;
        let record = handle.await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(registry.get(live).await.unwrap().last_error.as_deref(), Some("boom"));
        assert!(registry.wait(old, Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn test_requeue_after_delay() {
        let (queue, receiver) = TaskQueue::channel();
        let task = ReindexTask {
            id: Uuid::now_v7(),
            job: ReindexJob::Bulk { batch_size: 5 },
            attempts: 1,
        };
        queue.requeue_after(task.clone(), Duration::from_millis(10));

        let received = receiver.lock().await.recv().await.unwrap();
        assert_eq!(received.id, task.id);
        assert_eq!(received.attempts, 1);
    }

    #[tokio::test]
    async fn test_recording_publisher_keeps_events() {
        let publisher = RecordingPublisher::new();
        let customer_id = Uuid::now_v7();
        publisher
            .publish(ChangeEvent::dependent(customer_id, ChangeCause::Feedback))
            .await
            .unwrap();

        let events = publisher.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Updated);
    }
}
