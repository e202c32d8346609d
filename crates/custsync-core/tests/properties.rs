mod common;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use common::{company, opportunity, service, FakeFetcher, DIMENSION, WAIT};
use custsync_core::health::calculate;
use custsync_core::index::{customer_text, vector_id};
use custsync_core::sync::{map_record, IdentityResolver, ResolutionStep};
use custsync_core::{
    Customer, HashingEmbedder, HealthInput, HealthScore, Industry, Lifecycle, Reindexer,
    SourceType, SyncFilters,
};

fn deal_records() -> Vec<serde_json::Value> {
    vec![
        opportunity("006A", "Acme Healthcare", 100_000.0),
        opportunity("006B", "Globex Financial", 80_000.0),
        opportunity("006C", "Initech Software", 60_000.0),
        opportunity("006D", "Umbrella Retail", 40_000.0),
    ]
}

#[tokio::test]
async fn resync_leaves_row_counts_unchanged() {
    let deals = FakeFetcher::new(SourceType::Deal, deal_records());
    let health = FakeFetcher::new(
        SourceType::Health,
        vec![
            company("G1", "Acme Healthcare", "Healthcare", "Active"),
            company("G2", "Stark Manufacturing", "Manufacturing", "Active"),
        ],
    );
    let (service, storage, _) = service(vec![deals, health]).await;

    for source in [SourceType::Deal, SourceType::Health] {
        service.sync(source, &SyncFilters::default()).await.unwrap();
    }
    let counts = (
        storage.count_customers().await.unwrap(),
        storage.count_connectors().await.unwrap(),
        storage.count_metadata().await.unwrap(),
    );
    assert_eq!(counts, (5, 6, 6));

    for source in [SourceType::Deal, SourceType::Health] {
        let summary = service.sync(source, &SyncFilters::default()).await.unwrap();
        assert_eq!(summary.created, 0);
    }
    let again = (
        storage.count_customers().await.unwrap(),
        storage.count_connectors().await.unwrap(),
        storage.count_metadata().await.unwrap(),
    );
    assert_eq!(counts, again);
    service.shutdown().await;
}

#[tokio::test]
async fn resolver_is_deterministic_for_fixed_state() {
    let (service, storage, _) = service(vec![]).await;

    let today = Utc::now().date_naive();
    let mut tx = storage.transaction().await.unwrap();
    for industry in [Industry::Retail, Industry::Healthcare, Industry::Other] {
        let customer = Customer::new("Acme Corp".into(), today).with_industry(industry);
        tx.insert_customer(&customer).await.unwrap();
    }
    tx.commit().await.unwrap();

    let record = map_record(SourceType::Health, &company("G9", "Acme Corp", "", "Active")).unwrap();
    let resolver = IdentityResolver::new();

    let mut chosen = HashSet::new();
    for _ in 0..5 {
        let mut tx = storage.transaction().await.unwrap();
        let resolution = resolver.resolve(&mut tx, &record).await.unwrap();
        assert_eq!(resolution.step, ResolutionStep::TieBreak);
        chosen.insert(resolution.customer.id);
        drop(tx);
    }
    assert_eq!(chosen.len(), 1);
    service.shutdown().await;
}

#[tokio::test]
async fn active_connectors_are_unique() {
    let mut records = deal_records();
    records.push(opportunity("006A", "Acme Healthcare", 120_000.0));
    let deals = FakeFetcher::new(SourceType::Deal, records);
    let (service, storage, _) = service(vec![deals]).await;

    service.sync(SourceType::Deal, &SyncFilters::default()).await.unwrap();
    service.sync(SourceType::Deal, &SyncFilters::default()).await.unwrap();

    let connectors = storage.list_connectors(None).await.unwrap();
    let mut keys = HashSet::new();
    for connector in connectors.iter().filter(|c| c.active) {
        assert!(
            keys.insert((connector.customer_id, connector.source_type, connector.external_id.clone())),
            "duplicate active connector {}",
            connector.external_id
        );
    }
    assert_eq!(keys.len(), 4);
    service.shutdown().await;
}

#[test]
fn health_score_is_total() {
    let signals = [
        Lifecycle::Unknown,
        Lifecycle::Active,
        Lifecycle::AtRisk,
        Lifecycle::Positive,
        Lifecycle::Negative,
    ];
    let tenures = [None, Some(0), Some(11), Some(12), Some(120)];
    let probabilities = [None, Some(0.0), Some(49.9), Some(50.0), Some(75.0), Some(100.0)];

    let mut seen = HashSet::new();
    for source in SourceType::ALL {
        for status in signals {
            for stage in signals {
                for tenure_months in tenures {
                    for probability in probabilities {
                        let input = HealthInput {
                            status,
                            stage,
                            tenure_months,
                            probability,
                        };
                        let score = calculate(source, &input);
                        assert_eq!(score, calculate(source, &input));
                        if source == SourceType::Calls {
                            assert_eq!(score, HealthScore::AtRisk);
                        }
                        seen.insert(score);
                    }
                }
            }
        }
    }
    assert_eq!(seen.len(), 3);
}

#[tokio::test]
async fn own_text_ranks_first_after_reindex() {
    let deals = FakeFetcher::new(SourceType::Deal, deal_records());
    let (service, storage, store) = service(vec![deals]).await;

    service.sync(SourceType::Deal, &SyncFilters::default()).await.unwrap();
    assert!(service.wait_idle(WAIT).await);
    assert_eq!(store.len().await, 4);

    let reindexer = Reindexer::new(
        storage.clone(),
        Arc::new(HashingEmbedder::new(DIMENSION)),
        Arc::new(store.clone()),
    );
    for connector in storage.list_connectors(Some(SourceType::Deal)).await.unwrap() {
        let context = reindexer
            .load_context(connector.customer_id)
            .await
            .unwrap()
            .unwrap();
        let matches = reindexer
            .query_text(&customer_text(&context), 3, None)
            .await
            .unwrap();
        assert_eq!(matches.len(), 3);
        assert_eq!(matches[0].id, vector_id(connector.customer_id));
    }
    service.shutdown().await;
}

#[tokio::test]
async fn wiped_customers_leave_similarity_results() {
    let deals = FakeFetcher::new(SourceType::Deal, deal_records());
    let (service, storage, store) = service(vec![deals.clone()]).await;

    service.sync(SourceType::Deal, &SyncFilters::default()).await.unwrap();
    assert!(service.wait_idle(WAIT).await);
    let old_ids: HashSet<_> = storage
        .list_connectors(None)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.customer_id)
        .collect();

    let wiped = service.wipe_all().await.unwrap();
    assert_eq!(wiped.customers_deleted, 4);
    assert!(service.wait_idle(WAIT).await);
    assert!(store.is_empty().await);

    deals.set_records(vec![
        opportunity("006X", "Acme Healthcare Group", 90_000.0),
        opportunity("006Y", "Acme Health Partners", 70_000.0),
    ]);
    service.sync(SourceType::Deal, &SyncFilters::default()).await.unwrap();
    assert!(service.wait_idle(WAIT).await);

    let fresh = storage.list_connectors(None).await.unwrap()[0].customer_id;
    let similar = service.find_similar(fresh, 10, None).await.unwrap();
    assert_eq!(similar.len(), 1);
    for result in similar {
        let id = result.customer_id.unwrap();
        assert!(!old_ids.contains(&id));
        assert_ne!(id, fresh);
    }
    service.shutdown().await;
}

#[tokio::test]
async fn one_malformed_record_in_ten() {
    let mut records: Vec<_> = (0..9)
        .map(|i| opportunity(&format!("006{i:02}"), &format!("Company {i}"), 1_000.0))
        .collect();
    records.insert(6, json!({"Id": "006BAD", "Account": {"Name": "Broken"}, "Amount": "lots"}));
    let deals = FakeFetcher::new(SourceType::Deal, records);
    let (service, storage, _) = service(vec![deals]).await;

    let summary = service.sync(SourceType::Deal, &SyncFilters::default()).await.unwrap();
    assert_eq!(summary.synced, 9);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failures[0].reference, "006BAD");
    assert_eq!(storage.count_customers().await.unwrap(), 9);

    let runs = service.recent_sync_runs(Some(SourceType::Deal), 1).await.unwrap();
    assert_eq!(runs[0].failed, 1);
    service.shutdown().await;
}
