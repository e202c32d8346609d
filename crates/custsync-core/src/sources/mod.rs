//! Paginated readers for the three external record sources.

pub mod calls;
pub mod client;
pub mod deal;
pub mod health;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::SourceConfig;
use crate::source::SourceType;
use crate::sync::SyncFilters;

pub use calls::CallsFetcher;
pub use client::{ClientConfig, SourceClient};
pub use deal::DealFetcher;
pub use health::HealthFetcher;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Source returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Unexpected response shape: {0}")]
    Decode(String),
}

impl FetchError {
    /// Timeouts, connection failures, throttling and server errors. Anything
    /// else will fail the same way on the next attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Status { status, .. } => matches!(status, 408 | 429 | 500..=599),
            Self::InvalidUrl(_) | Self::UrlParse(_) | Self::Decode(_) => false,
        }
    }
}

pub type FetchResult<T> = Result<T, FetchError>;

/// One page of raw records and the cursor for the next one.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<Value>,
    pub next: Option<String>,
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    fn source_type(&self) -> SourceType;

    async fn fetch_page(&self, cursor: Option<&str>, filters: &SyncFilters) -> FetchResult<Page>;

    /// Follows cursors until the source is exhausted or `filters.limit` raw
    /// records have been read.
    async fn fetch_all(&self, filters: &SyncFilters) -> FetchResult<Vec<Value>> {
        let mut records = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page = self.fetch_page(cursor.as_deref(), filters).await?;
            let received = page.records.len();
            records.extend(page.records);

            if let Some(limit) = filters.limit {
                if records.len() >= limit {
                    records.truncate(limit);
                    break;
                }
            }

            match page.next {
                Some(next) if received > 0 && cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next);
                }
                _ => break,
            }
        }

        tracing::debug!(
            source = %self.source_type(),
            count = records.len(),
            "Fetched source records"
        );
        Ok(records)
    }
}

/// Builds the HTTP fetcher for a configured source.
pub fn build_fetcher(
    source: SourceType,
    config: &SourceConfig,
    client: SourceClient,
    page_size: usize,
) -> FetchResult<Arc<dyn SourceFetcher>> {
    let fetcher: Arc<dyn SourceFetcher> = match source {
        SourceType::Deal => Arc::new(
            DealFetcher::new(client, &config.base_url, config.api_key.clone())?
                .with_page_size(page_size),
        ),
        SourceType::Health => Arc::new(
            HealthFetcher::new(client, &config.base_url, config.api_key.clone())?
                .with_page_size(page_size),
        ),
        SourceType::Calls => Arc::new(CallsFetcher::new(
            client,
            &config.base_url,
            config.api_key.clone(),
        )?),
    };
    Ok(fetcher)
}

/// Parses an offset cursor. A missing cursor is the first page.
pub(crate) fn offset_cursor(cursor: Option<&str>) -> FetchResult<usize> {
    cursor.map_or(Ok(0), |c| {
        c.parse()
            .map_err(|_| FetchError::Decode(format!("invalid offset cursor {c:?}")))
    })
}

pub(crate) fn record_list(body: &Value, key: &str) -> FetchResult<Vec<Value>> {
    match body.get(key) {
        Some(Value::Array(items)) => Ok(items.clone()),
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(other) => Err(FetchError::Decode(format!(
            "expected `{key}` to be a list, got {other}"
        ))),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Serves fixed records in pages, optionally failing the first calls.
    pub struct StaticFetcher {
        pub source: SourceType,
        pub records: Vec<Value>,
        pub page_size: usize,
        pub failures_before_success: usize,
        pub calls: AtomicUsize,
    }

    impl StaticFetcher {
        pub fn new(source: SourceType, records: Vec<Value>) -> Self {
            Self {
                source,
                records,
                page_size: 2,
                failures_before_success: 0,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SourceFetcher for StaticFetcher {
        fn source_type(&self) -> SourceType {
            self.source
        }

        async fn fetch_page(&self, cursor: Option<&str>, _: &SyncFilters) -> FetchResult<Page> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                return Err(FetchError::Status {
                    status: 503,
                    body: "unavailable".into(),
                });
            }
            let offset = offset_cursor(cursor)?;
            let end = (offset + self.page_size).min(self.records.len());
            let records = self.records.get(offset..end).unwrap_or_default().to_vec();
            Ok(Page {
                next: (end < self.records.len()).then(|| end.to_string()),
                records,
            })
        }
    }
}
