pub mod activity;
pub mod config;
pub mod customer;
pub mod error;
pub mod events;
pub mod health;
pub mod index;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod source;
pub mod sources;
pub mod storage;
pub mod sync;

pub use activity::{CustomerMetrics, Feedback, FeedbackStatus, Meeting, Sentiment, UsageTrend};
pub use config::{Config, ConfigError, EmbeddingKind, SourceConfig, VectorStoreKind};
pub use customer::{Arr, Customer, HealthScore, Industry, SyncState};
pub use error::{Error, Result};
pub use events::{
    ChangeCause, ChangeEvent, ChangeKind, ChangePublisher, RecordingPublisher, ReindexFailure,
    ReindexJob, TaskQueue, TaskRecord, TaskStatus,
};
pub use health::{HealthInput, HealthRules, Lifecycle};
pub use index::{
    BulkReindexer, BulkSummary, EmbeddingProvider, HashingEmbedder, InMemoryVectorStore,
    MetadataFilter, Reindexer, SimilarCustomer, VectorStore,
};
pub use retry::{Backoff, RetryPolicies, RetryPolicy, RetryPolicyError};
pub use scheduler::Scheduler;
pub use service::{CustomerSync, ReindexTarget, ReindexTicket, SetupError, WipeSummary};
pub use source::{FieldValue, SourceConnector, SourceMetadata, SourceType};
pub use sources::{FetchError, Page, SourceClient, SourceFetcher};
pub use storage::Storage;
pub use sync::{SyncFilters, SyncOrchestrator, SyncStatus, SyncSummary};
