//! Runtime configuration read from `CUSTSYNC_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::index::embedding::DEFAULT_EMBEDDING_MODEL;
use crate::retry::{RetryPolicies, RetryPolicyError};
use crate::source::SourceType;
use crate::sources::ClientConfig;

const DEFAULT_SOURCE_ROOT: &str = "http://localhost:3001/mock-apis";
const DEFAULT_EMBEDDING_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Seconds between scheduled runs.
    pub interval_secs: u64,
    pub enabled: bool,
}

impl SourceConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: None,
            interval_secs: 300,
            enabled: true,
        }
    }

    fn default_for(source: SourceType) -> Self {
        let vendor = match source {
            SourceType::Deal => "salesforce",
            SourceType::Health => "gainsight",
            SourceType::Calls => "gong",
        };
        Self::new(format!("{DEFAULT_SOURCE_ROOT}/{vendor}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingKind {
    /// Local feature hashing, no network.
    Hashing,
    OpenAi,
}

impl FromStr for EmbeddingKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hashing" => Ok(Self::Hashing),
            "openai" => Ok(Self::OpenAi),
            _ => Err(ConfigError::UnknownEmbedding(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub kind: EmbeddingKind,
    pub base_url: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub model: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            kind: EmbeddingKind::Hashing,
            base_url: DEFAULT_EMBEDDING_URL.to_string(),
            api_key: None,
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VectorStoreKind {
    Memory,
    Pinecone,
}

impl FromStr for VectorStoreKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "pinecone" => Ok(Self::Pinecone),
            _ => Err(ConfigError::UnknownVectorStore(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    pub kind: VectorStoreKind,
    pub index_host: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub namespace: Option<String>,
    pub dimension: usize,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            kind: VectorStoreKind::Memory,
            index_host: None,
            api_key: None,
            namespace: None,
            dimension: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database_path: PathBuf,
    pub deal: SourceConfig,
    pub health: SourceConfig,
    pub calls: SourceConfig,
    /// Records requested per page from offset-paginated sources.
    pub page_size: usize,
    pub client: ClientConfig,
    pub embedding: EmbeddingConfig,
    pub vector_store: VectorStoreConfig,
    pub workers: usize,
    /// Whole-run fetch attempts before a sync is marked failed.
    pub sync_retries: u32,
    pub reindex_retry: RetryPolicies,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            deal: SourceConfig::default_for(SourceType::Deal),
            health: SourceConfig::default_for(SourceType::Health),
            calls: SourceConfig::default_for(SourceType::Calls),
            page_size: 200,
            client: ClientConfig::default(),
            embedding: EmbeddingConfig::default(),
            vector_store: VectorStoreConfig::default(),
            workers: 4,
            sync_retries: 3,
            reindex_retry: RetryPolicies::default(),
        }
    }
}

#[must_use]
pub fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("custsync")
        .join("custsync.db")
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable lookup. Unset or empty
    /// variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(path) = get("CUSTSYNC_DB") {
            config.database_path = PathBuf::from(path);
        }

        for source in SourceType::ALL {
            let prefix = format!("CUSTSYNC_{}", source.as_str());
            let section = config.source_mut(source);
            if let Some(url) = get(&format!("{prefix}_URL")) {
                section.base_url = url;
            }
            section.api_key = get(&format!("{prefix}_API_KEY"));
            parse_into(&get, &format!("{prefix}_INTERVAL_SECS"), &mut section.interval_secs)?;
            if let Some(raw) = get(&format!("{prefix}_ENABLED")) {
                section.enabled = parse_flag(&format!("{prefix}_ENABLED"), &raw)?;
            }
        }

        parse_into(&get, "CUSTSYNC_PAGE_SIZE", &mut config.page_size)?;
        parse_into(
            &get,
            "CUSTSYNC_CONNECT_TIMEOUT_SECS",
            &mut config.client.connect_timeout_seconds,
        )?;
        parse_into(
            &get,
            "CUSTSYNC_REQUEST_TIMEOUT_SECS",
            &mut config.client.request_timeout_seconds,
        )?;

        parse_into(&get, "CUSTSYNC_EMBEDDING", &mut config.embedding.kind)?;
        if let Some(url) = get("CUSTSYNC_EMBEDDING_URL") {
            config.embedding.base_url = url;
        }
        config.embedding.api_key = get("OPENAI_API_KEY");
        if let Some(model) = get("CUSTSYNC_EMBEDDING_MODEL") {
            config.embedding.model = model;
        }

        parse_into(&get, "CUSTSYNC_VECTOR_STORE", &mut config.vector_store.kind)?;
        config.vector_store.index_host = get("PINECONE_INDEX_HOST");
        config.vector_store.api_key = get("PINECONE_API_KEY");
        config.vector_store.namespace = get("CUSTSYNC_VECTOR_NAMESPACE");
        parse_into(
            &get,
            "CUSTSYNC_VECTOR_DIMENSION",
            &mut config.vector_store.dimension,
        )?;

        parse_into(&get, "CUSTSYNC_WORKERS", &mut config.workers)?;
        parse_into(&get, "CUSTSYNC_SYNC_RETRIES", &mut config.sync_retries)?;

        if let Some(raw) = get("CUSTSYNC_REINDEX_RETRY_DELAY_MS") {
            let ms: u64 = parse_value("CUSTSYNC_REINDEX_RETRY_DELAY_MS", &raw)?;
            config.reindex_retry = RetryPolicies::with_delay(Duration::from_millis(ms));
        }
        if let Some(raw) = get("CUSTSYNC_REINDEX_MAX_ATTEMPTS") {
            let n: u32 = parse_value("CUSTSYNC_REINDEX_MAX_ATTEMPTS", &raw)?;
            config.reindex_retry = config.reindex_retry.with_max_attempts(n);
        }

        Ok(config)
    }

    #[must_use]
    pub const fn source(&self, source: SourceType) -> &SourceConfig {
        match source {
            SourceType::Deal => &self.deal,
            SourceType::Health => &self.health,
            SourceType::Calls => &self.calls,
        }
    }

    pub fn source_mut(&mut self, source: SourceType) -> &mut SourceConfig {
        match source {
            SourceType::Deal => &mut self.deal,
            SourceType::Health => &mut self.health,
            SourceType::Calls => &mut self.calls,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("CUSTSYNC_PAGE_SIZE", self.page_size),
            ("CUSTSYNC_WORKERS", self.workers),
            ("CUSTSYNC_VECTOR_DIMENSION", self.vector_store.dimension),
        ] {
            if value == 0 {
                return Err(ConfigError::MustBePositive(name));
            }
        }
        if self.sync_retries == 0 {
            return Err(ConfigError::MustBePositive("CUSTSYNC_SYNC_RETRIES"));
        }
        self.reindex_retry.validate()?;

        for source in SourceType::ALL {
            let section = self.source(source);
            if !section.enabled {
                continue;
            }
            check_http_url(source.as_str(), &section.base_url)?;
            if section.interval_secs == 0 {
                return Err(ConfigError::MustBePositive("interval_secs"));
            }
        }

        if self.embedding.kind == EmbeddingKind::OpenAi {
            check_http_url("embedding", &self.embedding.base_url)?;
            if self.embedding.api_key.is_none() {
                return Err(ConfigError::Missing("OPENAI_API_KEY"));
            }
        }

        if self.vector_store.kind == VectorStoreKind::Pinecone {
            if self.vector_store.index_host.is_none() {
                return Err(ConfigError::Missing("PINECONE_INDEX_HOST"));
            }
            if self.vector_store.api_key.is_none() {
                return Err(ConfigError::Missing("PINECONE_API_KEY"));
            }
        }

        Ok(())
    }
}

fn parse_into<T, G>(get: &G, key: &str, target: &mut T) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    if let Some(raw) = get(key) {
        *target = parse_value(key, &raw)?;
    }
    Ok(())
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
        message: e.to_string(),
    })
}

fn parse_flag(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
            message: "expected true or false".to_string(),
        }),
    }
}

fn check_http_url(name: &str, raw: &str) -> Result<(), ConfigError> {
    let parsed = url::Url::parse(raw).map_err(|e| ConfigError::InvalidUrl {
        name: name.to_string(),
        message: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidUrl {
            name: name.to_string(),
            message: format!("unsupported scheme {}", parsed.scheme()),
        });
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}: {message}")]
    InvalidValue {
        key: String,
        value: String,
        message: String,
    },
    #[error("{0} must be greater than zero")]
    MustBePositive(&'static str),
    #[error("Missing required setting {0}")]
    Missing(&'static str),
    #[error("Invalid {name} URL: {message}")]
    InvalidUrl { name: String, message: String },
    #[error("Unknown embedding provider {0:?} (expected hashing or openai)")]
    UnknownEmbedding(String),
    #[error("Unknown vector store {0:?} (expected memory or pinecone)")]
    UnknownVectorStore(String),
    #[error("Invalid {kind} reindex retry policy: {source}")]
    InvalidRetryPolicy {
        kind: &'static str,
        #[source]
        source: RetryPolicyError,
    },
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.page_size, 200);
        assert_eq!(config.workers, 4);
        assert_eq!(config.vector_store.dimension, 1024);
        assert_eq!(
            config.deal.base_url,
            "http://localhost:3001/mock-apis/salesforce"
        );
        assert!(config.database_path.ends_with("custsync/custsync.db"));
        config.validate().unwrap();
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("CUSTSYNC_DB", "/tmp/x.db"),
            ("CUSTSYNC_HEALTH_URL", "https://health.example.com"),
            ("CUSTSYNC_HEALTH_API_KEY", "secret"),
            ("CUSTSYNC_CALLS_ENABLED", "false"),
            ("CUSTSYNC_DEAL_INTERVAL_SECS", "60"),
            ("CUSTSYNC_EMBEDDING", "OpenAI"),
            ("OPENAI_API_KEY", "sk-test"),
            ("CUSTSYNC_WORKERS", "8"),
        ]))
        .unwrap();

        assert_eq!(config.database_path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.health.api_key.as_deref(), Some("secret"));
        assert!(!config.calls.enabled);
        assert_eq!(config.deal.interval_secs, 60);
        assert_eq!(config.embedding.kind, EmbeddingKind::OpenAi);
        assert_eq!(config.workers, 8);
        config.validate().unwrap();
    }

    #[test]
    fn test_bad_number_is_reported() {
        let err = Config::from_lookup(lookup(&[("CUSTSYNC_PAGE_SIZE", "lots")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "CUSTSYNC_PAGE_SIZE"));
    }

    #[test]
    fn test_validate_rejects_incomplete_providers() {
        let mut config = Config::default();
        config.vector_store.kind = VectorStoreKind::Pinecone;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("PINECONE_INDEX_HOST"))
        ));

        let mut config = Config::default();
        config.embedding.kind = EmbeddingKind::OpenAi;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Missing("OPENAI_API_KEY"))
        ));
    }

    #[test]
    fn test_validate_rejects_bad_source_url() {
        let mut config = Config::default();
        config.deal.base_url = "ftp://example.com".into();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidUrl { .. })));

        config.deal.enabled = false;
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_kinds_are_config_errors() {
        assert!(matches!(
            "weaviate".parse::<VectorStoreKind>(),
            Err(ConfigError::UnknownVectorStore(ref v)) if v == "weaviate"
        ));
        assert_eq!("Pinecone".parse::<VectorStoreKind>().unwrap(), VectorStoreKind::Pinecone);

        let err = Config::from_lookup(lookup(&[("CUSTSYNC_EMBEDDING", "bert")])).unwrap_err();
        assert!(err.to_string().contains("CUSTSYNC_EMBEDDING"));
        assert!(err.to_string().contains("bert"));
    }

    #[test]
    fn test_reindex_retry_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("CUSTSYNC_REINDEX_RETRY_DELAY_MS", "10"),
            ("CUSTSYNC_REINDEX_MAX_ATTEMPTS", "1"),
        ]))
        .unwrap();
        assert_eq!(config.reindex_retry.bulk.max_attempts, 1);
        assert_eq!(config.reindex_retry.create.delay_for(1), Duration::from_millis(10));
        config.validate().unwrap();

        let config =
            Config::from_lookup(lookup(&[("CUSTSYNC_REINDEX_MAX_ATTEMPTS", "0")])).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRetryPolicy {
                source: RetryPolicyError::NoAttempts,
                ..
            })
        ));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = Config::default();
        config.workers = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MustBePositive("CUSTSYNC_WORKERS"))
        ));
    }
}
