//! Call-intelligence calls, read with opaque cursors.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use url::Url;

use super::{record_list, FetchResult, Page, SourceClient, SourceFetcher};
use crate::source::SourceType;
use crate::sync::SyncFilters;

pub struct CallsFetcher {
    client: SourceClient,
    base: Url,
    api_key: Option<String>,
}

impl CallsFetcher {
    pub fn new(client: SourceClient, base_url: &str, api_key: Option<String>) -> FetchResult<Self> {
        Ok(Self {
            client,
            base: SourceClient::base_url(base_url)?,
            api_key,
        })
    }
}

/// `{calls, records: {cursor}}`.
pub(crate) fn decode_page(body: &Value) -> FetchResult<Page> {
    let records = record_list(body, "calls")?;
    let next = body
        .get("records")
        .and_then(|r| r.get("cursor"))
        .and_then(Value::as_str)
        .filter(|c| !c.is_empty())
        .map(str::to_string);
    Ok(Page { records, next })
}

#[async_trait]
impl SourceFetcher for CallsFetcher {
    fn source_type(&self) -> SourceType {
        SourceType::Calls
    }

    async fn fetch_page(&self, cursor: Option<&str>, filters: &SyncFilters) -> FetchResult<Page> {
        let url = SourceClient::endpoint(&self.base, "v2/calls")?;
        let mut request = self.client.request(Method::GET, url);
        if let Some(cursor) = cursor {
            request = request.query(&[("cursor", cursor)]);
        }
        if let Some(ref account_id) = filters.account_id {
            request = request.query(&[("accountId", account_id)]);
        }
        if let Some(since) = filters.since {
            request = request.query(&[("fromDateTime", since.to_rfc3339())]);
        }
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let body: Value = self.client.send_json(request).await?;
        decode_page(&body)
    }
}
