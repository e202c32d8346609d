//! The assembled system: one store, one reindex queue with its workers, and
//! an orchestrator per configured source.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::activity::{CustomerMetrics, Feedback, Meeting};
use crate::config::{Config, ConfigError, EmbeddingKind, VectorStoreKind};
use crate::events::{
    ChangeCause, ChangeEvent, ChangeKind, ChangePublisher, ReindexFailure, ReindexJob,
    TaskQueue, TaskRecord, TaskStatus,
};
use crate::index::{
    EmbeddingProvider, HashingEmbedder, IndexError, IndexResult, InMemoryVectorStore,
    MetadataFilter, OpenAiEmbedder, PineconeStore, Reindexer, SimilarCustomer, VectorStore,
    WorkerPool,
};
use crate::retry::{RetryPolicies, RetryPolicy};
use crate::scheduler::{ScheduledSync, Scheduler};
use crate::source::SourceType;
use crate::sources::{build_fetcher, FetchError, SourceClient, SourceFetcher};
use crate::storage::Storage;
use crate::sync::{SyncFilters, SyncOrchestrator, SyncSummary};
use crate::{Error, Result};

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReindexTarget {
    Customer(Uuid),
    All { batch_size: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReindexTicket {
    pub task_id: Uuid,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WipeSummary {
    pub customers_deleted: usize,
    pub deletion_events: usize,
}

struct SourceEntry {
    orchestrator: Arc<SyncOrchestrator>,
    interval: Duration,
}

pub struct CustomerSync {
    storage: Storage,
    queue: TaskQueue,
    reindexer: Reindexer,
    sources: HashMap<SourceType, SourceEntry>,
    fetch_retry: RetryPolicy,
    workers: WorkerPool,
}

impl CustomerSync {
    /// Starts `workers` reindex workers. Sources are added with
    /// [`Self::with_source`].
    #[must_use]
    pub fn new(
        storage: Storage,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
        workers: usize,
        policies: RetryPolicies,
    ) -> Self {
        let (queue, receiver) = TaskQueue::channel();
        let reindexer = Reindexer::new(storage.clone(), embedder, store);
        let workers = WorkerPool::spawn(
            workers,
            queue.clone(),
            receiver,
            reindexer.clone(),
            policies,
        );
        Self {
            storage,
            queue,
            reindexer,
            sources: HashMap::new(),
            fetch_retry: RetryPolicy::source_fetch(3),
            workers,
        }
    }

    /// Applies to sources added afterwards.
    #[must_use]
    pub const fn with_fetch_retry(mut self, policy: RetryPolicy) -> Self {
        self.fetch_retry = policy;
        self
    }

    #[must_use]
    pub fn with_source(mut self, fetcher: Arc<dyn SourceFetcher>, interval: Duration) -> Self {
        let source = fetcher.source_type();
        let publisher: Arc<dyn ChangePublisher> = Arc::new(self.queue.clone());
        let orchestrator = SyncOrchestrator::new(self.storage.clone(), fetcher, publisher)
            .with_fetch_retry(self.fetch_retry);
        self.sources.insert(
            source,
            SourceEntry {
                orchestrator: Arc::new(orchestrator),
                interval,
            },
        );
        self
    }

    /// Builds providers and fetchers from `config`. Disabled sources are
    /// left out.
    pub fn from_config(config: &Config, storage: Storage) -> std::result::Result<Self, SetupError> {
        config.validate()?;
        let client = SourceClient::new(config.client.clone())?;
        let dimension = config.vector_store.dimension;

        let embedder: Arc<dyn EmbeddingProvider> = match config.embedding.kind {
            EmbeddingKind::Hashing => Arc::new(HashingEmbedder::new(dimension)),
            EmbeddingKind::OpenAi => Arc::new(
                OpenAiEmbedder::new(
                    client.clone(),
                    &config.embedding.base_url,
                    config.embedding.api_key.clone().unwrap_or_default(),
                    dimension,
                )?
                .with_model(config.embedding.model.clone()),
            ),
        };

        let store: Arc<dyn VectorStore> = match config.vector_store.kind {
            VectorStoreKind::Memory => Arc::new(InMemoryVectorStore::new(dimension)),
            VectorStoreKind::Pinecone => Arc::new(
                PineconeStore::new(
                    client.clone(),
                    config.vector_store.index_host.as_deref().unwrap_or_default(),
                    config.vector_store.api_key.clone().unwrap_or_default(),
                    dimension,
                )?
                .with_namespace(config.vector_store.namespace.clone()),
            ),
        };

        let mut fetchers = Vec::new();
        for source in SourceType::ALL {
            let section = config.source(source);
            if !section.enabled {
                tracing::info!(%source, "Source disabled");
                continue;
            }
            let fetcher = build_fetcher(source, section, client.clone(), config.page_size)?;
            fetchers.push((fetcher, Duration::from_secs(section.interval_secs)));
        }

        let service = Self::new(
            storage,
            embedder,
            store,
            config.workers,
            config.reindex_retry,
        )
        .with_fetch_retry(RetryPolicy::source_fetch(config.sync_retries));

        Ok(fetchers
            .into_iter()
            .fold(service, |service, (fetcher, interval)| {
                service.with_source(fetcher, interval)
            }))
    }

    #[must_use]
    pub const fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Sources with an orchestrator, in declaration order.
    #[must_use]
    pub fn sources(&self) -> Vec<SourceType> {
        SourceType::ALL
            .into_iter()
            .filter(|s| self.sources.contains_key(s))
            .collect()
    }

    /// Starts periodic runs for every configured source.
    #[must_use]
    pub fn start_scheduler(&self, retry_delay: Duration) -> Scheduler {
        let schedule = self
            .sources
            .values()
            .map(|entry| ScheduledSync::new(entry.orchestrator.clone(), entry.interval))
            .collect();
        Scheduler::spawn(schedule, retry_delay)
    }

    pub async fn sync(&self, source: SourceType, filters: &SyncFilters) -> Result<SyncSummary> {
        let entry = self
            .sources
            .get(&source)
            .ok_or(Error::SourceNotConfigured(source))?;
        entry.orchestrator.run(filters).await
    }

    pub async fn recent_sync_runs(
        &self,
        source: Option<SourceType>,
        limit: usize,
    ) -> Result<Vec<SyncSummary>> {
        self.storage.recent_sync_runs(source, limit).await
    }

    /// Queues a reindex and returns immediately.
    pub async fn reindex(&self, target: ReindexTarget) -> Result<ReindexTicket> {
        let job = match target {
            ReindexTarget::Customer(id) => {
                self.storage.get_customer(id).await?;
                ReindexJob::Change(ChangeEvent::new(id, ChangeKind::Updated, ChangeCause::Customer))
            }
            ReindexTarget::All { batch_size } => {
                if batch_size == 0 {
                    return Err(Error::Validation("batch size must be > 0".into()));
                }
                ReindexJob::Bulk { batch_size }
            }
        };
        let task_id = self.queue.enqueue(job).await?;
        Ok(ReindexTicket {
            task_id,
            status: TaskStatus::Queued,
        })
    }

    pub async fn find_similar(
        &self,
        customer_id: Uuid,
        top_k: usize,
        filter: Option<MetadataFilter>,
    ) -> IndexResult<Vec<SimilarCustomer>> {
        self.reindexer.find_similar(customer_id, top_k, filter).await
    }

    pub async fn task_status(&self, task_id: Uuid) -> Option<TaskRecord> {
        self.queue.registry().get(task_id).await
    }

    /// Waits for a task to succeed or fail. `None` on timeout.
    pub async fn wait_for_task(&self, task_id: Uuid, timeout: Duration) -> Option<TaskRecord> {
        self.queue.registry().wait(task_id, timeout).await
    }

    /// Waits until the reindex queue is drained. False on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        self.queue.registry().wait_idle(timeout).await
    }

    pub async fn reindex_failures(&self, limit: usize) -> Result<Vec<ReindexFailure>> {
        self.storage.reindex_failures(limit).await
    }

    /// Deletes every customer and queues removal of their index entries.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn wipe_all(&self) -> Result<WipeSummary> {
        let ids = self.storage.wipe_all().await?;
        let mut deletion_events = 0;
        for id in &ids {
            let event = ChangeEvent::new(*id, ChangeKind::Deleted, ChangeCause::Customer);
            match self.queue.publish(event).await {
                Ok(_) => deletion_events += 1,
                Err(e) => tracing::warn!(customer_id = %id, error = %e, "Failed to queue deletion"),
            }
        }
        tracing::warn!(customers = ids.len(), "Wiped all customers");
        Ok(WipeSummary {
            customers_deleted: ids.len(),
            deletion_events,
        })
    }

    /// Stores feedback and returns the reindex task it triggered.
    pub async fn record_feedback(&self, feedback: &Feedback) -> Result<Uuid> {
        self.storage.get_customer(feedback.customer_id).await?;
        self.storage.insert_feedback(feedback).await?;
        self.queue
            .publish(ChangeEvent::dependent(feedback.customer_id, ChangeCause::Feedback))
            .await
    }

    /// Replaces the customer's metrics and returns the reindex task it
    /// triggered.
    pub async fn upsert_metrics(&self, metrics: &CustomerMetrics) -> Result<Uuid> {
        metrics.validate()?;
        self.storage.get_customer(metrics.customer_id).await?;
        self.storage.upsert_metrics(metrics).await?;
        self.queue
            .publish(ChangeEvent::dependent(metrics.customer_id, ChangeCause::Metrics))
            .await
    }

    /// Stores a meeting and returns the reindex task it triggered.
    pub async fn record_meeting(&self, meeting: &Meeting) -> Result<Uuid> {
        self.storage.get_customer(meeting.customer_id).await?;
        self.storage.upsert_meeting(meeting).await?;
        self.queue
            .publish(ChangeEvent::dependent(meeting.customer_id, ChangeCause::Meeting))
            .await
    }

    /// Stops the workers after their current tasks. Queued tasks are dropped.
    pub async fn shutdown(self) {
        self.workers.shutdown().await;
    }
}
