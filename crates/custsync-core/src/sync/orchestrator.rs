//! One source's fetch, normalize, resolve and upsert cycle.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::mapping::{map_record, Dependent, SourceRecord};
use super::resolver::{IdentityResolver, ResolutionStep};
use super::{SyncFilters, SyncStatus, SyncSummary};
use crate::customer::Customer;
use crate::events::{ChangeCause, ChangeEvent, ChangeKind, ChangePublisher};
use crate::health::calculate;
use crate::retry::RetryPolicy;
use crate::source::{SourceConnector, SourceMetadata, SourceType};
use crate::sources::SourceFetcher;
use crate::storage::Storage;
use crate::{Error, Result};

/// What one committed record did.
#[derive(Debug, Clone, Copy)]
pub struct AppliedRecord {
    pub customer_id: Uuid,
    pub created: bool,
    pub step: ResolutionStep,
    pub cause: ChangeCause,
}

pub struct SyncOrchestrator {
    storage: Storage,
    fetcher: Arc<dyn SourceFetcher>,
    publisher: Arc<dyn ChangePublisher>,
    resolver: IdentityResolver,
    fetch_retry: RetryPolicy,
}

impl SyncOrchestrator {
    #[must_use]
    pub fn new(
        storage: Storage,
        fetcher: Arc<dyn SourceFetcher>,
        publisher: Arc<dyn ChangePublisher>,
    ) -> Self {
        Self {
            storage,
            fetcher,
            publisher,
            resolver: IdentityResolver::new(),
            fetch_retry: RetryPolicy::source_fetch(3),
        }
    }

    #[must_use]
    pub const fn with_fetch_retry(mut self, policy: RetryPolicy) -> Self {
        self.fetch_retry = policy;
        self
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: IdentityResolver) -> Self {
        self.resolver = resolver;
        self
    }

    #[must_use]
    pub fn source_type(&self) -> SourceType {
        self.fetcher.source_type()
    }

    /// Runs one sync. Per-record failures are counted in the summary; only
    /// a source that cannot be fetched at all fails the run.
    #[tracing::instrument(level = "info", skip_all, fields(source = %self.source_type()))]
    pub async fn run(&self, filters: &SyncFilters) -> Result<SyncSummary> {
        let source = self.source_type();
        let mut summary = SyncSummary::start(source);

        let raw_records = match self.fetch_with_retry(filters).await {
            Ok(records) => records,
            Err(err) => {
                summary.record_failure("<fetch>".to_string(), &err);
                self.persist(&summary.finish(SyncStatus::Failed)).await;
                return Err(err);
            }
        };

        tracing::info!(count = raw_records.len(), "Processing source records");

        for (index, raw) in raw_records.iter().enumerate() {
            let record = match map_record(source, raw) {
                Ok(record) => record,
                Err(err) => {
                    let reference = raw_reference(raw, index);
                    tracing::warn!(record = %reference, error = %err, "Skipping unmappable record");
                    summary.record_failure(reference, err);
                    continue;
                }
            };

            if !filters.admits(record.modified_at) {
                continue;
            }
            summary.defaulted += record.defaulted.len();

            match self.apply_with_retry(&record).await {
                Ok(applied) => {
                    summary.synced += 1;
                    let kind = if applied.created {
                        summary.created += 1;
                        ChangeKind::Created
                    } else {
                        summary.updated += 1;
                        ChangeKind::Updated
                    };
                    self.publish(ChangeEvent::new(applied.customer_id, kind, applied.cause))
                        .await;
                }
                Err(err) => {
                    tracing::warn!(
                        external_id = %record.external_id,
                        error = %err,
                        "Failed to apply record"
                    );
                    summary.record_failure(record.external_id.clone(), err);
                }
            }
        }

        let summary = summary.finish(SyncStatus::Completed);
        self.persist(&summary).await;

        tracing::info!(
            synced = summary.synced,
            failed = summary.failed,
            created = summary.created,
            updated = summary.updated,
            defaulted = summary.defaulted,
            "Sync run finished"
        );
        Ok(summary)
    }

    async fn fetch_with_retry(&self, filters: &SyncFilters) -> Result<Vec<Value>> {
        let source = self.source_type();
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.fetcher.fetch_all(filters).await {
                Ok(records) => return Ok(records),
                Err(err) if err.is_retryable() && self.fetch_retry.should_retry(attempts) => {
                    let delay = self.fetch_retry.delay_for(attempts);
                    tracing::warn!(
                        attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "Source fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return Err(Error::SourceUnreachable {
                        source_type: source,
                        attempts,
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    /// A concurrent writer that wins a creation race leaves a unique
    /// violation behind. The second attempt resolves to the winner's row.
    async fn apply_with_retry(&self, record: &SourceRecord) -> Result<AppliedRecord> {
        match self.apply(record).await {
            Err(err) if err.is_write_conflict() => {
                tracing::debug!(
                    external_id = %record.external_id,
                    error = %err,
                    "Write conflict, retrying record"
                );
                self.apply(record).await
            }
            other => other,
        }
    }

    /// Resolves and writes one record in its own transaction.
    pub async fn apply(&self, record: &SourceRecord) -> Result<AppliedRecord> {
        let mut tx = self.storage.transaction().await?;
        let resolution = self.resolver.resolve(&mut tx, record).await?;
        let created = resolution.is_new();
        let now = Utc::now();

        let mut customer = resolution.customer;
        merge_fields(&mut customer, record, created, now);
        if created {
            tx.insert_customer(&customer).await?;
        } else {
            tx.update_customer(&customer).await?;
        }

        let metadata = SourceMetadata::new(record.payload.clone())
            .with_extracted(record.extracted.clone())
            .with_api_version(record.api_version.clone());
        let connector = if let Some(mut connector) = resolution.connector {
            connector.customer_id = customer.id;
            connector.updated_at = now;
            tx.update_connector(&connector, &metadata).await?;
            connector
        } else {
            let connector = SourceConnector::new(
                customer.id,
                record.source,
                record.external_id.clone(),
                metadata.id,
            );
            tx.insert_connector(&connector, &metadata).await?;
            connector
        };

        let cause = match record.dependent.clone() {
            Some(Dependent::Metrics(draft)) => {
                let metrics = draft.into_metrics(customer.id);
                metrics.validate()?;
                tx.upsert_metrics(&metrics).await?;
                ChangeCause::Metrics
            }
            Some(Dependent::Meeting(draft)) => {
                tx.upsert_meeting(&draft.into_meeting(customer.id, connector.id))
                    .await?;
                ChangeCause::Meeting
            }
            None => ChangeCause::Customer,
        };

        tx.commit().await?;

        tracing::debug!(
            external_id = %record.external_id,
            customer_id = %customer.id,
            step = ?resolution.step,
            "Applied record"
        );

        Ok(AppliedRecord {
            customer_id: customer.id,
            created,
            step: resolution.step,
            cause: if created { ChangeCause::Customer } else { cause },
        })
    }

    async fn publish(&self, event: ChangeEvent) {
        let customer_id = event.customer_id;
        if let Err(err) = self.publisher.publish(event).await {
            tracing::warn!(%customer_id, error = %err, "Failed to publish change event");
        }
    }

    async fn persist(&self, summary: &SyncSummary) {
        if let Err(err) = self.storage.insert_sync_run(summary).await {
            tracing::warn!(run_id = %summary.id, error = %err, "Failed to record sync run");
        }
    }
}

/// Applies the fields `record.source` is authoritative for.
fn merge_fields(customer: &mut Customer, record: &SourceRecord, created: bool, now: DateTime<Utc>) {
    let update = &record.update;

    if let Some(ref name) = update.name {
        customer.name.clone_from(name);
    }
    match (update.industry, update.industry_on_create) {
        (Some(industry), _) => customer.industry = industry,
        (None, Some(industry)) if created => customer.industry = industry,
        _ => {}
    }
    if let Some(arr) = update.arr {
        customer.arr = arr;
    }
    if let Some(date) = update.renewal_date {
        customer.renewal_date = date;
    }
    if let Some(ref products) = update.products {
        customer.products.clone_from(products);
    }
    if let Some(ref input) = update.health {
        customer.health_score = calculate(record.source, input);
    }

    customer.sync.mark(record.source, now);
    customer.updated_at = now;
}

/// Best identifier for a record that failed before mapping.
fn raw_reference(raw: &Value, index: usize) -> String {
    ["Id", "Gsid", "id", "callId"]
        .iter()
        .find_map(|key| match raw.get(key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| format!("#{index}"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::customer::{HealthScore, Industry};
    use crate::events::RecordingPublisher;
    use crate::sources::testing::StaticFetcher;
    use serde_json::json;

    fn opportunity(id: &str, name: &str, amount: f64) -> Value {
        json!({
            "Id": id,
            "Account": {"Name": name},
            "Amount": amount,
            "StageName": "Negotiating",
            "Probability": 60,
            "CloseDate": "2025-06-30"
        })
    }

    async fn orchestrator(
        source: SourceType,
        records: Vec<Value>,
    ) -> (SyncOrchestrator, Storage, Arc<RecordingPublisher>) {
        let storage = Storage::open_memory().await.unwrap();
        let publisher = Arc::new(RecordingPublisher::new());
        let fetcher = Arc::new(StaticFetcher::new(source, records));
        let orchestrator = SyncOrchestrator::new(storage.clone(), fetcher, publisher.clone());
        (orchestrator, storage, publisher)
    }

    #[tokio::test]
    async fn test_deal_sync_creates_customer() {
        let (sync, storage, publisher) = orchestrator(
            SourceType::Deal,
            vec![opportunity("X1", "Acme Healthcare", 100_000.0)],
        )
        .await;

        let summary = sync.run(&SyncFilters::default()).await.unwrap();
        assert_eq!(summary.synced, 1);
        assert_eq!(summary.created, 1);

        let connectors = storage.list_connectors(Some(SourceType::Deal)).await.unwrap();
        let customer = storage.get_customer(connectors[0].customer_id).await.unwrap();
        assert_eq!(customer.name, "Acme Healthcare");
        assert_eq!(customer.industry, Industry::Healthcare);
        assert_eq!(customer.health_score, HealthScore::AtRisk);
        assert!(customer.sync.is_synced(SourceType::Deal));

        let events = publisher.events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Created);
        assert_eq!(storage.recent_sync_runs(None, 5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let records = vec![
            opportunity("X1", "Acme Corp", 100_000.0),
            opportunity("X2", "Globex", 50_000.0),
        ];
        let (sync, storage, _) = orchestrator(SourceType::Deal, records).await;

        sync.run(&SyncFilters::default()).await.unwrap();
        let second = sync.run(&SyncFilters::default()).await.unwrap();

        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 2);
        assert_eq!(storage.count_customers().await.unwrap(), 2);
        assert_eq!(storage.count_connectors().await.unwrap(), 2);
        assert_eq!(storage.count_metadata().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_malformed_record_is_isolated() {
        let mut records: Vec<Value> = (0..9)
            .map(|i| opportunity(&format!("X{i}"), &format!("Company {i}"), 1000.0))
            .collect();
        records.insert(4, json!({"Id": "BROKEN", "Account": {}}));
        let (sync, _, _) = orchestrator(SourceType::Deal, records).await;

        let summary = sync.run(&SyncFilters::default()).await.unwrap();
        assert_eq!(summary.synced, 9);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failures[0].reference, "BROKEN");
    }

    #[tokio::test]
    async fn test_unreachable_source_fails_run() {
        let storage = Storage::open_memory().await.unwrap();
        let mut fetcher = StaticFetcher::new(SourceType::Health, vec![]);
        fetcher.failures_before_success = 10;
        let sync = SyncOrchestrator::new(
            storage.clone(),
            Arc::new(fetcher),
            Arc::new(RecordingPublisher::new()),
        )
        .with_fetch_retry(RetryPolicy::fixed(2, Duration::from_millis(1)));

        let err = sync.run(&SyncFilters::default()).await.unwrap_err();
        assert!(matches!(err, Error::SourceUnreachable { attempts: 2, .. }));

        let runs = storage.recent_sync_runs(Some(SourceType::Health), 1).await.unwrap();
        assert_eq!(runs[0].status, SyncStatus::Failed);
    }

    #[tokio::test]
    async fn test_transient_fetch_failure_is_retried() {
        let storage = Storage::open_memory().await.unwrap();
        let mut fetcher = StaticFetcher::new(
            SourceType::Deal,
            vec![opportunity("X1", "Acme Corp", 10.0)],
        );
        fetcher.failures_before_success = 1;
        let sync = SyncOrchestrator::new(
            storage,
            Arc::new(fetcher),
            Arc::new(RecordingPublisher::new()),
        )
        .with_fetch_retry(RetryPolicy::fixed(3, Duration::from_millis(1)));

        let summary = sync.run(&SyncFilters::default()).await.unwrap();
        assert_eq!(summary.synced, 1);
    }

    #[tokio::test]
    async fn test_calls_never_overwrite_canonical_fields() {
        let storage = Storage::open_memory().await.unwrap();
        let publisher = Arc::new(RecordingPublisher::new());
        let deals = SyncOrchestrator::new(
            storage.clone(),
            Arc::new(StaticFetcher::new(
                SourceType::Deal,
                vec![opportunity("X1", "Acme Corp", 120_000.0)],
            )),
            publisher.clone(),
        );
        deals.run(&SyncFilters::default()).await.unwrap();

        let call = json!({
            "id": "C1",
            "account": {"name": "Acme Corp"},
            "startedAt": "2024-10-22T14:00:00Z",
            "summary": "Renewal call"
        });
        let calls = SyncOrchestrator::new(
            storage.clone(),
            Arc::new(StaticFetcher::new(SourceType::Calls, vec![call])),
            publisher.clone(),
        );
        let summary = calls.run(&SyncFilters::default()).await.unwrap();
        assert_eq!(summary.updated, 1);

        let connectors = storage.list_connectors(Some(SourceType::Calls)).await.unwrap();
        let customer = storage.get_customer(connectors[0].customer_id).await.unwrap();
        assert_eq!(customer.arr.cents(), 12_000_000);
        assert!(customer.sync.is_synced(SourceType::Calls));

        let meetings = storage.recent_meetings(customer.id, 5).await.unwrap();
        assert_eq!(meetings.len(), 1);
        assert_eq!(meetings[0].title, "Untitled Meeting");

        let events = publisher.events().await;
        assert_eq!(events.last().unwrap().cause, ChangeCause::Meeting);
    }

    #[tokio::test]
    async fn test_health_sync_stores_metrics() {
        let company = json!({
            "Gsid": "G1",
            "Name": "Initech",
            "Status": "Churned",
            "ARR": 90000,
            "NPS": -20,
            "Usage_Trend": "down",
            "Active_Users": 12
        });
        let (sync, storage, _) = orchestrator(SourceType::Health, vec![company]).await;
        sync.run(&SyncFilters::default()).await.unwrap();

        let connectors = storage.list_connectors(Some(SourceType::Health)).await.unwrap();
        let customer = storage.get_customer(connectors[0].customer_id).await.unwrap();
        assert_eq!(customer.health_score, HealthScore::Critical);
        assert_eq!(customer.renewal_date, Utc::now().date_naive());

        let metrics = storage.get_metrics(customer.id).await.unwrap().unwrap();
        assert_eq!(metrics.nps, -20);
        assert_eq!(metrics.active_users, 12);
    }

    #[test]
    fn test_raw_reference_fallback() {
        assert_eq!(raw_reference(&json!({"Gsid": "G9"}), 3), "G9");
        assert_eq!(raw_reference(&json!({"foo": 1}), 3), "#3");
    }
}
