//! Similarity index derived from canonical customers.
//!
//! The index is a cache: it can always be rebuilt from storage. A customer's
//! entry is keyed by [`vector_id`] and built from [`customer_text`], which
//! is used unchanged for both indexing and querying.

pub mod bulk;
pub mod embedding;
pub mod reindexer;
pub mod vector_store;
pub mod worker;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::activity::{CustomerMetrics, Feedback, Meeting};
use crate::customer::Customer;
use crate::sources::FetchError;

pub use bulk::{BatchResult, BulkReindexer, BulkSummary};
pub use embedding::{EmbeddingProvider, HashingEmbedder, OpenAiEmbedder};
pub use reindexer::{Reindexer, SimilarCustomer};
pub use vector_store::{
    InMemoryVectorStore, MetadataFilter, PineconeStore, VectorMatch, VectorRecord, VectorStore,
};
pub use worker::WorkerPool;

/// Feedback titles included in the text summary.
pub const FEEDBACK_CONTEXT: usize = 3;
/// Meeting summaries included in the text summary.
pub const MEETING_CONTEXT: usize = 2;
const MEETING_SUMMARY_CHARS: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Embedding provider error: {0}")]
    Embedding(String),
    #[error("Vector store error: {0}")]
    VectorStore(String),
    #[error("Provider request failed: {0}")]
    Request(#[from] FetchError),
    #[error(transparent)]
    Storage(#[from] crate::Error),
}

pub type IndexResult<T> = Result<T, IndexError>;

/// A customer with the dependent records its index entry is built from.
#[derive(Debug, Clone)]
pub struct CustomerContext {
    pub customer: Customer,
    pub metrics: Option<CustomerMetrics>,
    /// Newest first.
    pub feedback: Vec<Feedback>,
    /// Newest first.
    pub meetings: Vec<Meeting>,
}

impl CustomerContext {
    #[must_use]
    pub const fn new(customer: Customer) -> Self {
        Self {
            customer,
            metrics: None,
            feedback: Vec::new(),
            meetings: Vec::new(),
        }
    }
}

#[must_use]
pub fn vector_id(customer_id: Uuid) -> String {
    format!("customer_{customer_id}")
}

/// The fixed-order text summary of a customer.
#[must_use]
pub fn customer_text(context: &CustomerContext) -> String {
    let customer = &context.customer;
    let mut parts = vec![
        format!("Company: {}", customer.name),
        format!("Industry: {}", customer.industry),
        format!("Annual Recurring Revenue: {}", customer.arr),
        format!("Health Score: {}", customer.health_score),
        format!("Renewal Date: {}", customer.renewal_date),
    ];
    if !customer.products.is_empty() {
        parts.push(format!("Products: {}", customer.products.join(", ")));
    }

    if let Some(ref metrics) = context.metrics {
        parts.push(format!("Net Promoter Score: {}", metrics.nps));
        parts.push(format!("Usage Trend: {}", metrics.usage_trend.as_str()));
        parts.push(format!("Active Users: {}", metrics.active_users));
        parts.push(format!("Renewal Rate: {}%", metrics.renewal_rate));
        parts.push(format!("Seat Utilization: {}%", metrics.seat_utilization));
        parts.push(format!(
            "Response Usage: {:.1}%",
            metrics.response_usage_percentage()
        ));
    }

    let titles: Vec<&str> = context
        .feedback
        .iter()
        .take(FEEDBACK_CONTEXT)
        .map(|f| f.title.as_str())
        .collect();
    if !titles.is_empty() {
        parts.push(format!("Recent Feedback: {}", titles.join(", ")));
    }

    let summaries: Vec<String> = context
        .meetings
        .iter()
        .take(MEETING_CONTEXT)
        .filter(|m| !m.summary.is_empty())
        .map(|m| m.summary.chars().take(MEETING_SUMMARY_CHARS).collect())
        .collect();
    if !summaries.is_empty() {
        parts.push(format!("Recent Meetings: {}", summaries.join("; ")));
    }

    parts.join(" | ")
}

/// Metadata stored next to a customer's vector.
#[must_use]
pub fn customer_metadata(context: &CustomerContext) -> Map<String, Value> {
    let customer = &context.customer;
    let mut metadata = Map::new();
    metadata.insert("customer_id".into(), customer.id.to_string().into());
    metadata.insert("name".into(), customer.name.clone().into());
    metadata.insert("industry".into(), customer.industry.as_str().into());
    metadata.insert("arr".into(), customer.arr.as_f64().into());
    metadata.insert("health_score".into(), customer.health_score.as_str().into());
    metadata.insert("renewal_date".into(), customer.renewal_date.to_string().into());
    metadata.insert("last_updated".into(), customer.updated_at.to_rfc3339().into());
    metadata.insert("created_at".into(), customer.created_at.to_rfc3339().into());

    if let Some(ref metrics) = context.metrics {
        metadata.insert("nps".into(), metrics.nps.into());
        metadata.insert("usage_trend".into(), metrics.usage_trend.as_str().into());
        metadata.insert("active_users".into(), metrics.active_users.into());
        metadata.insert("renewal_rate".into(), metrics.renewal_rate.into());
        metadata.insert("seat_utilization".into(), metrics.seat_utilization.into());
    }

    metadata
}

/// Truncates or zero-pads `vector` to `dimension`.
#[must_use]
pub fn fit_dimension(mut vector: Vec<f32>, dimension: usize) -> Vec<f32> {
    vector.resize(dimension, 0.0);
    vector
}
