//! Deal-tracking opportunities, read with limit/offset paging.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use url::Url;

use super::{offset_cursor, record_list, FetchError, FetchResult, Page, SourceClient, SourceFetcher};
use crate::source::SourceType;
use crate::sync::SyncFilters;

pub const DEFAULT_API_VERSION: &str = "v58.0";

pub struct DealFetcher {
    client: SourceClient,
    base: Url,
    api_key: Option<String>,
    api_version: String,
    page_size: usize,
}

impl DealFetcher {
    pub fn new(client: SourceClient, base_url: &str, api_key: Option<String>) -> FetchResult<Self> {
        Ok(Self {
            client,
            base: SourceClient::base_url(base_url)?,
            api_key,
            api_version: DEFAULT_API_VERSION.to_string(),
            page_size: 200,
        })
    }

    #[must_use]
    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn url(&self) -> FetchResult<Url> {
        SourceClient::endpoint(
            &self.base,
            &format!("services/data/{}/sobjects/Opportunity", self.api_version),
        )
    }
}

/// `{records, totalSize, done}`; the next offset is absent once `done` is set
/// or a page comes back empty.
pub(crate) fn decode_page(body: &Value, offset: usize) -> FetchResult<Page> {
    let records = record_list(body, "records")?;
    let done = body.get("done").and_then(Value::as_bool).unwrap_or(true);
    let total = body
        .get("totalSize")
        .and_then(Value::as_u64)
        .and_then(|t| usize::try_from(t).ok());

    let end = offset + records.len();
    let more = !done && !records.is_empty() && total.is_none_or(|t| end < t);
    Ok(Page {
        next: more.then(|| end.to_string()),
        records,
    })
}

#[async_trait]
impl SourceFetcher for DealFetcher {
    fn source_type(&self) -> SourceType {
        SourceType::Deal
    }

    async fn fetch_page(&self, cursor: Option<&str>, _filters: &SyncFilters) -> FetchResult<Page> {
        let offset = offset_cursor(cursor)?;
        let mut request = self
            .client
            .request(Method::GET, self.url()?)
            .query(&[("limit", self.page_size), ("offset", offset)]);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let body: Value = self.client.send_json(request).await?;
        if !body.is_object() {
            return Err(FetchError::Decode("expected a JSON object".into()));
        }
        decode_page(&body, offset)
    }
}
