use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use url::Url;

use super::{IndexError, IndexResult};
use crate::sources::SourceClient;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub values: Vec<f32>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMatch {
    pub id: String,
    pub score: f32,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Metadata predicate applied to query results.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataFilter {
    Eq(String, Value),
    Ne(String, Value),
    In(String, Vec<Value>),
    And(Vec<MetadataFilter>),
}

impl MetadataFilter {
    #[must_use]
    pub fn eq(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(key.into(), value.into())
    }

    #[must_use]
    pub fn ne(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ne(key.into(), value.into())
    }

    #[must_use]
    pub fn and(self, other: Self) -> Self {
        match self {
            Self::And(mut filters) => {
                filters.push(other);
                Self::And(filters)
            }
            first => Self::And(vec![first, other]),
        }
    }

    #[must_use]
    pub fn matches(&self, metadata: &Map<String, Value>) -> bool {
        match self {
            Self::Eq(key, value) => metadata.get(key) == Some(value),
            Self::Ne(key, value) => metadata.get(key) != Some(value),
            Self::In(key, values) => metadata.get(key).is_some_and(|v| values.contains(v)),
            Self::And(filters) => filters.iter().all(|f| f.matches(metadata)),
        }
    }

    /// Mongo-style filter document used by Pinecone.
    #[must_use]
    pub fn to_document(&self) -> Value {
        match self {
            Self::Eq(key, value) => json!({ key: { "$eq": value } }),
            Self::Ne(key, value) => json!({ key: { "$ne": value } }),
            Self::In(key, values) => json!({ key: { "$in": values } }),
            Self::And(filters) => {
                json!({ "$and": filters.iter().map(Self::to_document).collect::<Vec<_>>() })
            }
        }
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, records: Vec<VectorRecord>) -> IndexResult<()>;

    /// Highest score first.
    async fn query(
        &self,
        vector: Vec<f32>,
        top_k: usize,
        filter: Option<MetadataFilter>,
    ) -> IndexResult<Vec<VectorMatch>>;

    async fn delete(&self, ids: Vec<String>) -> IndexResult<()>;

    fn dimension(&self) -> usize;
}

/// Cosine-similarity store held in process memory.
#[derive(Debug, Clone)]
pub struct InMemoryVectorStore {
    dimension: usize,
    items: Arc<RwLock<HashMap<String, (Vec<f32>, Map<String, Value>)>>>,
}

impl InMemoryVectorStore {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            items: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.items.read().await.contains_key(id)
    }

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let mut dot = 0.0;
        let mut na = 0.0;
        let mut nb = 0.0;
        for (x, y) in a.iter().zip(b.iter()) {
            dot += x * y;
            na += x * x;
            nb += y * y;
        }
        if na == 0.0 || nb == 0.0 {
            0.0
        } else {
            dot / (na.sqrt() * nb.sqrt())
        }
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    #[tracing::instrument(level = "debug", skip_all, fields(count = records.len()))]
    async fn upsert(&self, records: Vec<VectorRecord>) -> IndexResult<()> {
        if let Some(bad) = records.iter().find(|r| r.values.len() != self.dimension) {
            return Err(IndexError::VectorStore(format!(
                "vector {} has dimension {}, expected {}",
                bad.id,
                bad.values.len(),
                self.dimension
            )));
        }
        let mut items = self.items.write().await;
        for record in records {
            items.insert(record.id, (record.values, record.metadata));
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn query(
        &self,
        vector: Vec<f32>,
        top_k: usize,
        filter: Option<MetadataFilter>,
    ) -> IndexResult<Vec<VectorMatch>> {
        let items = self.items.read().await;
        let mut matches: Vec<VectorMatch> = items
            .iter()
            .filter(|(_, (_, meta))| filter.as_ref().is_none_or(|f| f.matches(meta)))
            .map(|(id, (values, meta))| VectorMatch {
                id: id.clone(),
                score: Self::cosine(&vector, values),
                metadata: meta.clone(),
            })
            .collect();
        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        matches.truncate(top_k);
        Ok(matches)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn delete(&self, ids: Vec<String>) -> IndexResult<()> {
        let mut items = self.items.write().await;
        for id in ids {
            items.remove(&id);
        }
        Ok(())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Pinecone-compatible REST data plane.
pub struct PineconeStore {
    client: SourceClient,
    host: Url,
    api_key: String,
    namespace: Option<String>,
    dimension: usize,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<VectorMatch>,
}

impl PineconeStore {
    pub fn new(
        client: SourceClient,
        index_host: &str,
        api_key: String,
        dimension: usize,
    ) -> IndexResult<Self> {
        let host = if index_host.contains("://") {
            index_host.to_string()
        } else {
            format!("https://{index_host}")
        };
        Ok(Self {
            client,
            host: SourceClient::base_url(&host)?,
            api_key,
            namespace: None,
            dimension,
        })
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace.filter(|n| !n.is_empty());
        self
    }

    fn with_namespace_field(&self, mut body: Value) -> Value {
        if let (Some(ns), Some(obj)) = (&self.namespace, body.as_object_mut()) {
            obj.insert("namespace".into(), Value::String(ns.clone()));
        }
        body
    }

    async fn post(&self, path: &str, body: Value) -> IndexResult<Value> {
        let url = SourceClient::endpoint(&self.host, path)?;
        let request = self
            .client
            .request(Method::POST, url)
            .header("Api-Key", &self.api_key)
            .json(&self.with_namespace_field(body));
        Ok(self.client.send_json(request).await?)
    }
}

#[async_trait]
impl VectorStore for PineconeStore {
    #[tracing::instrument(level = "debug", skip_all, fields(count = records.len()))]
    async fn upsert(&self, records: Vec<VectorRecord>) -> IndexResult<()> {
        if records.is_empty() {
            return Ok(());
        }
        self.post("vectors/upsert", json!({ "vectors": records }))
            .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn query(
        &self,
        vector: Vec<f32>,
        top_k: usize,
        filter: Option<MetadataFilter>,
    ) -> IndexResult<Vec<VectorMatch>> {
        let mut body = json!({
            "vector": vector,
            "topK": top_k,
            "includeMetadata": true,
        });
        if let (Some(filter), Some(obj)) = (filter, body.as_object_mut()) {
            obj.insert("filter".into(), filter.to_document());
        }
        let response = self.post("query", body).await?;
        let parsed: QueryResponse = serde_json::from_value(response)
            .map_err(|e| IndexError::VectorStore(e.to_string()))?;
        Ok(parsed.matches)
    }

    #[tracing::instrument(level = "debug", skip_all)]
    async fn delete(&self, ids: Vec<String>) -> IndexResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.post("vectors/delete", json!({ "ids": ids })).await?;
        Ok(())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::ClientConfig;

    fn record(id: &str, values: Vec<f32>, industry: &str) -> VectorRecord {
        let mut metadata = Map::new();
        metadata.insert("industry".into(), industry.into());
        metadata.insert("customer_id".into(), id.into());
        VectorRecord {
            id: id.to_string(),
            values,
            metadata,
        }
    }

    #[tokio::test]
    async fn test_query_ranks_by_cosine() {
        let store = InMemoryVectorStore::new(2);
        store
            .upsert(vec![
                record("a", vec![1.0, 0.0], "retail"),
                record("b", vec![0.7, 0.7], "finance"),
                record("c", vec![0.0, 1.0], "retail"),
            ])
            .await
            .unwrap();

        let matches = store.query(vec![1.0, 0.1], 2, None).await.unwrap();
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].id, "a");
        assert_eq!(matches[1].id, "b");
    }

    #[tokio::test]
    async fn test_filter_and_delete() {
        let store = InMemoryVectorStore::new(2);
        store
            .upsert(vec![
                record("a", vec![1.0, 0.0], "retail"),
                record("b", vec![0.9, 0.1], "finance"),
            ])
            .await
            .unwrap();

        let filter = MetadataFilter::eq("industry", "retail").and(MetadataFilter::ne("customer_id", "x"));
        let matches = store.query(vec![1.0, 0.0], 5, Some(filter)).await.unwrap();
        assert_eq!(matches.len(), 1);

        store.delete(vec!["a".into()]).await.unwrap();
        assert!(!store.contains("a").await);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let store = InMemoryVectorStore::new(3);
        let err = store.upsert(vec![record("a", vec![1.0], "retail")]).await;
        assert!(matches!(err, Err(IndexError::VectorStore(_))));
        assert!(store.is_empty().await);
    }

    #[test]
    fn test_filter_document() {
        let filter = MetadataFilter::ne("customer_id", "42");
        assert_eq!(filter.to_document(), json!({"customer_id": {"$ne": "42"}}));
        let any = MetadataFilter::In("industry".into(), vec![json!("retail")]);
        assert_eq!(any.to_document(), json!({"industry": {"$in": ["retail"]}}));
    }

    #[test]
    fn test_pinecone_host_without_scheme() {
        let client = SourceClient::new(ClientConfig::default()).unwrap();
        let store = PineconeStore::new(client, "customers-abc.svc.pinecone.io", "k".into(), 1024)
            .unwrap()
            .with_namespace(Some("prod".into()));
        assert_eq!(store.host.scheme(), "https");
        let body = store.with_namespace_field(json!({"ids": []}));
        assert_eq!(body["namespace"], "prod");
    }
}
