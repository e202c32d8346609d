use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::embedding::EmbeddingProvider;
use super::vector_store::{MetadataFilter, VectorMatch, VectorRecord, VectorStore};
use super::{
    customer_metadata, customer_text, fit_dimension, vector_id, CustomerContext, IndexResult,
    FEEDBACK_CONTEXT, MEETING_CONTEXT,
};
use crate::customer::Customer;
use crate::storage::Storage;
use crate::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    Indexed,
    /// The customer no longer exists and its entry was deleted.
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarCustomer {
    pub customer_id: Option<Uuid>,
    pub name: Option<String>,
    pub score: f32,
    pub metadata: Map<String, Value>,
}

impl From<VectorMatch> for SimilarCustomer {
    fn from(m: VectorMatch) -> Self {
        Self {
            customer_id: m
                .metadata
                .get("customer_id")
                .and_then(Value::as_str)
                .and_then(|s| Uuid::parse_str(s).ok()),
            name: m
                .metadata
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string),
            score: m.score,
            metadata: m.metadata,
        }
    }
}

/// Recomputes a customer's index entry from current storage state.
#[derive(Clone)]
pub struct Reindexer {
    storage: Storage,
    embedder: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn VectorStore>,
}

impl Reindexer {
    #[must_use]
    pub fn new(
        storage: Storage,
        embedder: Arc<dyn EmbeddingProvider>,
        store: Arc<dyn VectorStore>,
    ) -> Self {
        Self {
            storage,
            embedder,
            store,
        }
    }

    #[must_use]
    pub const fn storage(&self) -> &Storage {
        &self.storage
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub async fn load_context(&self, customer_id: Uuid) -> IndexResult<Option<CustomerContext>> {
        match self.storage.find_customer(customer_id).await? {
            Some(customer) => Ok(Some(self.context_for(customer).await?)),
            None => Ok(None),
        }
    }

    /// Latest metrics and the most recent feedback and meetings.
    pub async fn context_for(&self, customer: Customer) -> IndexResult<CustomerContext> {
        let id = customer.id;
        Ok(CustomerContext {
            metrics: self.storage.get_metrics(id).await?,
            feedback: self.storage.recent_feedback(id, FEEDBACK_CONTEXT).await?,
            meetings: self.storage.recent_meetings(id, MEETING_CONTEXT).await?,
            customer,
        })
    }

    pub async fn embed_text(&self, text: &str) -> IndexResult<Vec<f32>> {
        let vector = self.embedder.embed(text).await?;
        Ok(fit_dimension(vector, self.store.dimension()))
    }

    pub async fn build_record(&self, context: &CustomerContext) -> IndexResult<VectorRecord> {
        let text = customer_text(context);
        Ok(VectorRecord {
            id: vector_id(context.customer.id),
            values: self.embed_text(&text).await?,
            metadata: customer_metadata(context),
        })
    }

    /// Upserts the customer's current entry, or deletes it when the customer
    /// is gone.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn index_customer(&self, customer_id: Uuid) -> IndexResult<IndexOutcome> {
        let Some(context) = self.load_context(customer_id).await? else {
            self.remove_customer(customer_id).await?;
            return Ok(IndexOutcome::Removed);
        };
        let record = self.build_record(&context).await?;
        self.store.upsert(vec![record]).await?;
        Ok(IndexOutcome::Indexed)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn remove_customer(&self, customer_id: Uuid) -> IndexResult<()> {
        self.store.delete(vec![vector_id(customer_id)]).await
    }

    /// Customers whose entries are closest to this customer's current text.
    /// The customer itself is never returned.
    pub async fn find_similar(
        &self,
        customer_id: Uuid,
        top_k: usize,
        filter: Option<MetadataFilter>,
    ) -> IndexResult<Vec<SimilarCustomer>> {
        let context = self
            .load_context(customer_id)
            .await?
            .ok_or(Error::CustomerNotFound(customer_id))?;

        let exclude_self = MetadataFilter::ne("customer_id", customer_id.to_string());
        let filter = match filter {
            Some(filter) => filter.and(exclude_self),
            None => exclude_self,
        };

        let matches = self
            .query_text(&customer_text(&context), top_k, Some(filter))
            .await?;
        Ok(matches.into_iter().map(SimilarCustomer::from).collect())
    }

    pub async fn query_text(
        &self,
        text: &str,
        top_k: usize,
        filter: Option<MetadataFilter>,
    ) -> IndexResult<Vec<VectorMatch>> {
        let vector = self.embed_text(text).await?;
        self.store.query(vector, top_k, filter).await
    }
}
