//! Customer-health company records, read through the query API.

use async_trait::async_trait;
use reqwest::Method;
use serde::Serialize;
use serde_json::Value;
use url::Url;

use super::{offset_cursor, FetchError, FetchResult, Page, SourceClient, SourceFetcher};
use crate::source::SourceType;
use crate::sync::SyncFilters;

const COMPANY_FIELDS: &[&str] = &[
    "Gsid",
    "Name",
    "Renewal_Date",
    "Status",
    "Stage",
    "Customer_Lifetime_in_Months",
    "ARR",
    "Employees",
    "Industry",
    "csm__gr.email",
    "csm__gr.name",
    "Parentcompany",
    "NPS",
    "Usage_Trend",
    "Active_Users",
    "Renewal_Rate",
    "Seat_Utilization",
    "Response_Limit",
    "Response_Used",
    "CreatedDate",
    "ModifiedDate",
];

#[derive(Debug, Serialize)]
struct Query<'a> {
    select: &'a [&'a str],
    limit: usize,
    offset: usize,
}

pub struct HealthFetcher {
    client: SourceClient,
    base: Url,
    access_key: Option<String>,
    page_size: usize,
}

impl HealthFetcher {
    pub fn new(
        client: SourceClient,
        base_url: &str,
        access_key: Option<String>,
    ) -> FetchResult<Self> {
        Ok(Self {
            client,
            base: SourceClient::base_url(base_url)?,
            access_key,
            page_size: 200,
        })
    }

    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

/// `{result, data}`. A false `result` is a rejected query, not an empty one.
pub(crate) fn decode_page(body: &Value, offset: usize, page_size: usize) -> FetchResult<Page> {
    if body.get("result").and_then(Value::as_bool) == Some(false) {
        let message = body
            .get("errorDesc")
            .or_else(|| body.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("query rejected");
        return Err(FetchError::Decode(message.to_string()));
    }

    let records = match body.get("data") {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Object(data)) => match data.get("records") {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };

    let end = offset + records.len();
    Ok(Page {
        next: (records.len() >= page_size).then(|| end.to_string()),
        records,
    })
}

#[async_trait]
impl SourceFetcher for HealthFetcher {
    fn source_type(&self) -> SourceType {
        SourceType::Health
    }

    async fn fetch_page(&self, cursor: Option<&str>, _filters: &SyncFilters) -> FetchResult<Page> {
        let offset = offset_cursor(cursor)?;
        let url = SourceClient::endpoint(&self.base, "v1/data/objects/query/Company")?;
        let query = Query {
            select: COMPANY_FIELDS,
            limit: self.page_size,
            offset,
        };

        let mut request = self.client.request(Method::POST, url).json(&query);
        if let Some(ref key) = self.access_key {
            request = request.header("Accesskey", key);
        }

        let body: Value = self.client.send_json(request).await?;
        decode_page(&body, offset, self.page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_full_page_has_next_offset() {
        let body = json!({"result": true, "data": [{"Gsid": "1"}, {"Gsid": "2"}]});
        let page = decode_page(&body, 10, 2).unwrap();
        assert_eq!(page.next.as_deref(), Some("12"));

        let short = decode_page(&body, 10, 5).unwrap();
        assert!(short.next.is_none());
    }

    #[test]
    fn test_nested_records_and_rejection() {
        let nested = json!({"result": true, "data": {"records": [{"Gsid": "1"}]}});
        assert_eq!(decode_page(&nested, 0, 10).unwrap().records.len(), 1);

        let rejected = json!({"result": false, "errorDesc": "bad field"});
        let err = decode_page(&rejected, 0, 10).unwrap_err();
        assert!(err.to_string().contains("bad field"));
    }

    #[test]
    fn test_query_body_shape() {
        let query = Query {
            select: COMPANY_FIELDS,
            limit: 50,
            offset: 100,
        };
        let json = serde_json::to_value(&query).unwrap();
        assert_eq!(json["limit"], 50);
        assert_eq!(json["offset"], 100);
        assert!(json["select"].as_array().unwrap().contains(&json!("Gsid")));
    }
}
