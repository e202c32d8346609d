//! Reindex workers draining the shared task queue.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::bulk::{BulkReindexer, BulkSummary};
use super::reindexer::Reindexer;
use super::IndexResult;
use crate::events::{
    ChangeKind, ReindexFailure, ReindexJob, ReindexTask, TaskQueue, TaskReceiver, TaskStatus,
};
use crate::retry::{RetryPolicies, RetryPolicy};

struct WorkerContext {
    queue: TaskQueue,
    receiver: TaskReceiver,
    reindexer: Reindexer,
    bulk: BulkReindexer,
    policies: RetryPolicies,
}

pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Starts `workers` tasks (at least one) pulling from `receiver`.
    #[must_use]
    pub fn spawn(
        workers: usize,
        queue: TaskQueue,
        receiver: TaskReceiver,
        reindexer: Reindexer,
        policies: RetryPolicies,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let context = Arc::new(WorkerContext {
            queue,
            receiver,
            bulk: BulkReindexer::new(reindexer.clone()),
            reindexer,
            policies,
        });

        let handles = (0..workers.max(1))
            .map(|worker| {
                tokio::spawn(worker_loop(worker, context.clone(), shutdown_rx.clone()))
            })
            .collect();

        tracing::info!(workers = workers.max(1), "Reindex workers started");
        Self { shutdown, handles }
    }

    /// Stops taking new tasks and waits for in-flight ones to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Reindex worker ended abnormally");
            }
        }
        tracing::info!("Reindex workers stopped");
    }
}

#[tracing::instrument(level = "debug", skip(context, shutdown))]
async fn worker_loop(
    worker: usize,
    context: Arc<WorkerContext>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let task = tokio::select! {
            _ = shutdown.changed() => break,
            task = async { context.receiver.lock().await.recv().await } => task,
        };
        let Some(task) = task else {
            break;
        };
        process(&context, task).await;
        if *shutdown.borrow() {
            break;
        }
    }
    tracing::debug!(worker, "Reindex worker exiting");
}

fn policy_for(policies: &RetryPolicies, job: &ReindexJob) -> RetryPolicy {
    match job {
        ReindexJob::Change(event) => policies.for_kind(event.kind),
        ReindexJob::Bulk { .. } => policies.bulk,
    }
}

/// Result of one attempt. Bulk attempts always carry their counts, and one
/// that left any customer unindexed also carries an error.
struct Outcome {
    summary: Option<BulkSummary>,
    error: Option<String>,
}

async fn run_job(context: &WorkerContext, job: &ReindexJob) -> Outcome {
    let result = match job {
        ReindexJob::Change(event) if event.kind == ChangeKind::Deleted => {
            context.reindexer.remove_customer(event.customer_id).await
        }
        ReindexJob::Change(event) => context
            .reindexer
            .index_customer(event.customer_id)
            .await
            .map(|_| ()),
        ReindexJob::Bulk { batch_size } => {
            return match context.bulk.run(*batch_size).await {
                Ok(summary) => Outcome {
                    error: summary.failure_message(),
                    summary: Some(summary),
                },
                Err(e) => Outcome {
                    summary: None,
                    error: Some(e.to_string()),
                },
            };
        }
    };
    Outcome {
        summary: None,
        error: result.err().map(|e| e.to_string()),
    }
}

async fn process(context: &WorkerContext, mut task: ReindexTask) {
    let registry = context.queue.registry();
    task.attempts += 1;
    registry
        .update(task.id, TaskStatus::Running, task.attempts, None)
        .await;

    let outcome = run_job(context, &task.job).await;
    if let Some(summary) = outcome.summary {
        registry.attach_summary(task.id, summary).await;
    }
    let Some(error) = outcome.error else {
        registry
            .update(task.id, TaskStatus::Succeeded, task.attempts, None)
            .await;
        return;
    };

    let policy = policy_for(&context.policies, &task.job);
    if policy.should_retry(task.attempts) {
        let delay = policy.delay_for(task.attempts);
        tracing::warn!(
            task_id = %task.id,
            attempts = task.attempts,
            retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %error,
            "Reindex attempt failed, retrying"
        );
        registry
            .update(task.id, TaskStatus::Retrying, task.attempts, Some(error))
            .await;
        context.queue.requeue_after(task, delay);
        return;
    }

    let (customer_id, kind) = match &task.job {
        ReindexJob::Change(event) => (event.customer_id, event.kind),
        ReindexJob::Bulk { .. } => (Uuid::nil(), ChangeKind::Updated),
    };
    tracing::error!(
        task_id = %task.id,
        %customer_id,
        attempts = task.attempts,
        error = %error,
        "Reindex task exhausted its retries"
    );

    let failure = ReindexFailure {
        id: Uuid::now_v7(),
        task_id: task.id,
        customer_id,
        kind,
        attempts: task.attempts,
        last_error: error.clone(),
        failed_at: Utc::now(),
    };
    if let Err(e) = context
        .reindexer
        .storage()
        .insert_reindex_failure(&failure)
        .await
    {
        tracing::error!(task_id = %task.id, error = %e, "Failed to record reindex failure");
    }
    registry
        .update(task.id, TaskStatus::Failed, task.attempts, Some(error))
        .await;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::customer::Customer;
    use crate::events::{ChangeCause, ChangeEvent, ChangePublisher};
    use crate::index::embedding::EmbeddingProvider;
    use crate::index::vector_store::{MetadataFilter, VectorMatch, VectorRecord, VectorStore};
    use crate::index::{vector_id, HashingEmbedder, IndexError, InMemoryVectorStore};
    use crate::storage::Storage;

    /// Fails the first `failures` calls.
    struct FlakyEmbedder {
        inner: HashingEmbedder,
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyEmbedder {
        async fn embed(&self, text: &str) -> IndexResult<Vec<f32>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(IndexError::Embedding("rate limited".into()));
            }
            self.inner.embed(text).await
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        fn model_name(&self) -> &str {
            "flaky"
        }
    }

    /// Rejects the first `failures` upserts.
    struct FailingStore {
        inner: InMemoryVectorStore,
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl VectorStore for FailingStore {
        async fn upsert(&self, records: Vec<VectorRecord>) -> IndexResult<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(IndexError::VectorStore("index unavailable".into()));
            }
            self.inner.upsert(records).await
        }

        async fn query(
            &self,
            vector: Vec<f32>,
            top_k: usize,
            filter: Option<MetadataFilter>,
        ) -> IndexResult<Vec<VectorMatch>> {
            self.inner.query(vector, top_k, filter).await
        }

        async fn delete(&self, ids: Vec<String>) -> IndexResult<()> {
            self.inner.delete(ids).await
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }
    }

    fn spawn_pool(reindexer: Reindexer) -> (TaskQueue, WorkerPool) {
        let (queue, receiver) = TaskQueue::channel();
        let pool = WorkerPool::spawn(
            2,
            queue.clone(),
            receiver,
            reindexer,
            RetryPolicies::with_delay(Duration::from_millis(5)),
        );
        (queue, pool)
    }

    async fn setup(failures: usize) -> (Storage, InMemoryVectorStore, TaskQueue, WorkerPool) {
        let storage = Storage::open_memory().await.unwrap();
        let store = InMemoryVectorStore::new(32);
        let embedder = FlakyEmbedder {
            inner: HashingEmbedder::new(32),
            failures,
            calls: AtomicUsize::new(0),
        };
        let reindexer = Reindexer::new(storage.clone(), Arc::new(embedder), Arc::new(store.clone()));
        let (queue, pool) = spawn_pool(reindexer);
        (storage, store, queue, pool)
    }

    async fn setup_failing_store(
        upsert_failures: usize,
    ) -> (Storage, InMemoryVectorStore, TaskQueue, WorkerPool) {
        let storage = Storage::open_memory().await.unwrap();
        let inner = InMemoryVectorStore::new(32);
        let store = FailingStore {
            inner: inner.clone(),
            failures: upsert_failures,
            calls: AtomicUsize::new(0),
        };
        let reindexer = Reindexer::new(
            storage.clone(),
            Arc::new(HashingEmbedder::new(32)),
            Arc::new(store),
        );
        let (queue, pool) = spawn_pool(reindexer);
        (storage, inner, queue, pool)
    }

    async fn insert(storage: &Storage) -> Customer {
        let customer = Customer::new("Initech".into(), Utc::now().date_naive());
        let mut tx = storage.transaction().await.unwrap();
        tx.insert_customer(&customer).await.unwrap();
        tx.commit().await.unwrap();
        customer
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let (storage, store, queue, pool) = setup(1).await;
        let customer = insert(&storage).await;

        let task_id = queue
            .publish(ChangeEvent::new(customer.id, ChangeKind::Created, ChangeCause::Customer))
            .await
            .unwrap();
        let record = queue.registry().wait(task_id, Duration::from_secs(5)).await.unwrap();

        assert_eq!(record.status, TaskStatus::Succeeded);
        assert_eq!(record.attempts, 2);
        assert!(store.contains(&vector_id(customer.id)).await);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_exhausted_task_is_recorded() {
        let (storage, _store, queue, pool) = setup(usize::MAX).await;
        let customer = insert(&storage).await;

        let task_id = queue
            .publish(ChangeEvent::new(customer.id, ChangeKind::Updated, ChangeCause::Customer))
            .await
            .unwrap();
        let record = queue.registry().wait(task_id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.attempts, 3);

        let failures = storage.reindex_failures(10).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].task_id, task_id);
        assert_eq!(failures[0].customer_id, customer.id);
        assert!(failures[0].last_error.contains("rate limited"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_deleted_event_removes_entry() {
        let (storage, store, queue, pool) = setup(0).await;
        let customer = insert(&storage).await;
        let created = queue
            .publish(ChangeEvent::new(customer.id, ChangeKind::Created, ChangeCause::Customer))
            .await
            .unwrap();
        queue.registry().wait(created, Duration::from_secs(5)).await.unwrap();
        assert_eq!(store.len().await, 1);

        let deleted = queue
            .publish(ChangeEvent::new(customer.id, ChangeKind::Deleted, ChangeCause::Customer))
            .await
            .unwrap();
        let record = queue.registry().wait(deleted, Duration::from_secs(5)).await.unwrap();
        assert_eq!(record.status, TaskStatus::Succeeded);
        assert!(store.is_empty().await);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_bulk_job_runs_on_worker() {
        let (storage, store, queue, pool) = setup(0).await;
        for _ in 0..3 {
            insert(&storage).await;
        }
        let task_id = queue.enqueue(ReindexJob::Bulk { batch_size: 2 }).await.unwrap();
        let record = queue.registry().wait(task_id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(record.status, TaskStatus::Succeeded);
        assert_eq!(store.len().await, 3);
        let summary = record.summary.unwrap();
        assert_eq!((summary.succeeded, summary.failed), (3, 0));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_bulk_job_with_every_upsert_failing_is_failed() {
        let (storage, store, queue, pool) = setup_failing_store(usize::MAX).await;
        for _ in 0..3 {
            insert(&storage).await;
        }
        let task_id = queue.enqueue(ReindexJob::Bulk { batch_size: 2 }).await.unwrap();
        let record = queue.registry().wait(task_id, Duration::from_secs(5)).await.unwrap();

        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.attempts, 2);
        let error = record.last_error.unwrap();
        assert!(error.contains("3 of 3 customers failed"), "{error}");
        assert!(error.contains("index unavailable"), "{error}");

        let summary = record.summary.unwrap();
        assert_eq!((summary.succeeded, summary.failed), (0, 3));
        assert_eq!(summary.batches.len(), 2);
        assert_eq!(summary.batches[0].failed, 2);
        assert_eq!(summary.batches[1].failed, 1);
        assert!(store.is_empty().await);

        let failures = storage.reindex_failures(10).await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].task_id, task_id);
        assert!(failures[0].customer_id.is_nil());
        assert!(failures[0].last_error.contains("3 of 3"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_partial_bulk_failure_is_retried() {
        let (storage, store, queue, pool) = setup_failing_store(1).await;
        for _ in 0..3 {
            insert(&storage).await;
        }
        let task_id = queue.enqueue(ReindexJob::Bulk { batch_size: 2 }).await.unwrap();
        let record = queue.registry().wait(task_id, Duration::from_secs(5)).await.unwrap();

        assert_eq!(record.status, TaskStatus::Succeeded);
        assert_eq!(record.attempts, 2);
        // The failed first attempt stays visible on the record.
        assert!(record.last_error.unwrap().contains("2 of 3"));
        let summary = record.summary.unwrap();
        assert_eq!((summary.succeeded, summary.failed), (3, 0));
        assert_eq!(store.len().await, 3);
        assert!(storage.reindex_failures(10).await.unwrap().is_empty());
        pool.shutdown().await;
    }
}
