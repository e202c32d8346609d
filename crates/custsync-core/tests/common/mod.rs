#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use custsync_core::sources::FetchResult;
use custsync_core::sync::SyncFilters;
use custsync_core::{
    CustomerSync, HashingEmbedder, InMemoryVectorStore, Page, RetryPolicies, RetryPolicy,
    SourceFetcher, SourceType, Storage,
};

pub const DIMENSION: usize = 128;
pub const WAIT: Duration = Duration::from_secs(10);

/// Serves whatever records it currently holds, three per page.
pub struct FakeFetcher {
    source: SourceType,
    records: Mutex<Vec<Value>>,
    pub pages_served: AtomicUsize,
}

impl FakeFetcher {
    pub fn new(source: SourceType, records: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            source,
            records: Mutex::new(records),
            pages_served: AtomicUsize::new(0),
        })
    }

    pub fn set_records(&self, records: Vec<Value>) {
        *self.records.lock().unwrap() = records;
    }
}

#[async_trait]
impl SourceFetcher for FakeFetcher {
    fn source_type(&self) -> SourceType {
        self.source
    }

    async fn fetch_page(&self, cursor: Option<&str>, _filters: &SyncFilters) -> FetchResult<Page> {
        self.pages_served.fetch_add(1, Ordering::SeqCst);
        let records = self.records.lock().unwrap().clone();
        let offset: usize = cursor.map_or(0, |c| c.parse().unwrap());
        let end = (offset + 3).min(records.len());
        Ok(Page {
            records: records[offset.min(end)..end].to_vec(),
            next: (end < records.len()).then(|| end.to_string()),
        })
    }
}

pub fn opportunity(id: &str, account: &str, amount: f64) -> Value {
    json!({
        "attributes": {
            "type": "Opportunity",
            "url": format!("/services/data/v58.0/sobjects/Opportunity/{id}")
        },
        "Id": id,
        "Account": {"Name": account},
        "Amount": amount,
        "StageName": "Negotiating",
        "Probability": 80,
        "CloseDate": "2025-06-30",
        "LastModifiedDate": "2024-11-02T10:00:00.000+0000"
    })
}

pub fn company(gsid: &str, name: &str, industry: &str, status: &str) -> Value {
    json!({
        "Gsid": gsid,
        "Name": name,
        "ARR": 250_000,
        "Industry": industry,
        "Status": status,
        "Stage": "Adopting",
        "Renewal_Date": "2025-09-30",
        "NPS": 42,
        "Usage_Trend": "up",
        "Active_Users": 140
    })
}

pub async fn service(fetchers: Vec<Arc<FakeFetcher>>) -> (CustomerSync, Storage, InMemoryVectorStore) {
    let storage = Storage::open_memory().await.unwrap();
    let store = InMemoryVectorStore::new(DIMENSION);
    let mut service = CustomerSync::new(
        storage.clone(),
        Arc::new(HashingEmbedder::new(DIMENSION)),
        Arc::new(store.clone()),
        3,
        RetryPolicies::with_delay(Duration::from_millis(10)),
    )
    .with_fetch_retry(RetryPolicy::fixed(1, Duration::from_millis(1)));
    for fetcher in fetchers {
        service = service.with_source(fetcher, Duration::from_secs(300));
    }
    (service, storage, store)
}
