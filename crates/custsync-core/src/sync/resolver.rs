//! Maps an incoming source record to an existing or new customer.
//!
//! Matching is priority ordered and the first hit wins:
//!
//! 1. an active connector for `(source type, external id)`
//! 2. exactly one customer with the same name (case-sensitive)
//! 3. several customers with the same name: [`choose_candidate`]
//! 4. nothing matched: a new customer
//!
//! Every read goes through the record's [`StorageTx`], so the result is a
//! function of the database state the write will see.

use std::cmp::Reverse;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::mapping::SourceRecord;
use crate::customer::Customer;
use crate::source::SourceConnector;
use crate::storage::StorageTx;
use crate::Result;

/// Jaro-Winkler similarity above which a newly created customer is
/// reported as a possible duplicate of an existing one.
pub const NEAR_DUPLICATE_THRESHOLD: f64 = 0.92;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStep {
    Connector,
    Name,
    TieBreak,
    Created,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    /// For [`ResolutionStep::Created`] this customer is not stored yet.
    pub customer: Customer,
    pub step: ResolutionStep,
    /// The active connector found in step 1.
    pub connector: Option<SourceConnector>,
}

impl Resolution {
    #[must_use]
    pub fn is_new(&self) -> bool {
        self.step == ResolutionStep::Created
    }
}

/// A same-name customer and how many active records it already has from the
/// requesting source.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub customer: Customer,
    pub source_records: i64,
}

/// Picks among customers sharing a name. Candidates without records from the
/// requesting source come first; within the pool the fixed industry
/// priority wins, then the most recently updated, then the smallest id.
#[must_use]
pub fn choose_candidate(candidates: &[Candidate]) -> Option<&Customer> {
    let fresh: Vec<&Candidate> = candidates.iter().filter(|c| c.source_records == 0).collect();
    let pool = if fresh.is_empty() {
        candidates.iter().collect()
    } else {
        fresh
    };

    pool.into_iter()
        .map(|c| &c.customer)
        .min_by_key(|c| (c.industry.resolution_rank(), Reverse(c.updated_at), c.id))
}

pub struct IdentityResolver {
    near_duplicate_threshold: f64,
}

impl Default for IdentityResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityResolver {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            near_duplicate_threshold: NEAR_DUPLICATE_THRESHOLD,
        }
    }

    #[must_use]
    pub const fn with_near_duplicate_threshold(mut self, threshold: f64) -> Self {
        self.near_duplicate_threshold = threshold;
        self
    }

    pub async fn resolve(&self, tx: &mut StorageTx, record: &SourceRecord) -> Result<Resolution> {
        if let Some(connector) = tx
            .find_active_connector(record.source, &record.external_id)
            .await?
        {
            let customer = tx.get_customer(connector.customer_id).await?;
            return Ok(Resolution {
                customer,
                step: ResolutionStep::Connector,
                connector: Some(connector),
            });
        }

        let mut matches = tx.customers_by_name(&record.name).await?;
        if matches.len() == 1 {
            if let Some(customer) = matches.pop() {
                return Ok(Resolution {
                    customer,
                    step: ResolutionStep::Name,
                    connector: None,
                });
            }
        }

        if matches.len() > 1 {
            let mut candidates = Vec::with_capacity(matches.len());
            for customer in matches {
                let source_records = tx.source_record_count(customer.id, record.source).await?;
                candidates.push(Candidate {
                    customer,
                    source_records,
                });
            }
            if let Some(customer) = choose_candidate(&candidates) {
                tracing::debug!(
                    source = %record.source,
                    external_id = %record.external_id,
                    customer_id = %customer.id,
                    candidates = candidates.len(),
                    "Resolved duplicate name by tie-break"
                );
                return Ok(Resolution {
                    customer: customer.clone(),
                    step: ResolutionStep::TieBreak,
                    connector: None,
                });
            }
        }

        self.warn_near_duplicates(tx, record).await?;

        Ok(Resolution {
            customer: Customer::new(record.name.clone(), Utc::now().date_naive()),
            step: ResolutionStep::Created,
            connector: None,
        })
    }

    async fn warn_near_duplicates(&self, tx: &mut StorageTx, record: &SourceRecord) -> Result<()> {
        let name = record.name.to_lowercase();
        for (id, existing) in tx.customer_names().await? {
            let score = strsim::jaro_winkler(&name, &existing.to_lowercase());
            if score >= self.near_duplicate_threshold {
                tracing::warn!(
                    source = %record.source,
                    external_id = %record.external_id,
                    name = %record.name,
                    existing_id = %id,
                    existing_name = %existing,
                    score,
                    "possible duplicate customer"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::customer::Industry;
    use crate::source::{SourceMetadata, SourceType};
    use crate::storage::Storage;
    use crate::sync::mapping::map_record;
    use chrono::Duration;
    use serde_json::json;

    fn deal(id: &str, name: &str) -> SourceRecord {
        map_record(
            SourceType::Deal,
            &json!({"Id": id, "Account": {"Name": name}, "Amount": 1000}),
        )
        .unwrap()
    }

    fn candidate(industry: Industry, source_records: i64) -> Candidate {
        Candidate {
            customer: Customer::new("Acme".into(), Utc::now().date_naive()).with_industry(industry),
            source_records,
        }
    }

    async fn link(tx: &mut StorageTx, customer: &Customer, source: SourceType, external_id: &str) {
        let metadata = SourceMetadata::new(json!({}));
        let connector =
            SourceConnector::new(customer.id, source, external_id.to_string(), metadata.id);
        tx.insert_connector(&connector, &metadata).await.unwrap();
    }

    #[test]
    fn test_candidate_without_source_records_wins() {
        let candidates = vec![
            candidate(Industry::Healthcare, 1),
            candidate(Industry::Retail, 0),
        ];
        let chosen = choose_candidate(&candidates).unwrap();
        assert_eq!(chosen.id, candidates[1].customer.id);
    }

    #[test]
    fn test_industry_then_recency_then_id() {
        let mut candidates = vec![
            candidate(Industry::Technology, 0),
            candidate(Industry::Healthcare, 0),
            candidate(Industry::Healthcare, 0),
        ];
        candidates[2].customer.updated_at = candidates[1].customer.updated_at + Duration::seconds(5);
        let chosen = choose_candidate(&candidates).unwrap();
        assert_eq!(chosen.id, candidates[2].customer.id);

        candidates[2].customer.updated_at = candidates[1].customer.updated_at;
        let smallest = candidates[1].customer.id.min(candidates[2].customer.id);
        assert_eq!(choose_candidate(&candidates).unwrap().id, smallest);
    }

    #[test]
    fn test_all_candidates_with_records_use_same_rule() {
        let candidates = vec![
            candidate(Industry::Finance, 2),
            candidate(Industry::Education, 1),
        ];
        let chosen = choose_candidate(&candidates).unwrap();
        assert_eq!(chosen.industry, Industry::Education);
        assert!(choose_candidate(&[]).is_none());
    }

    #[tokio::test]
    async fn test_resolution_steps() {
        let storage = Storage::open_memory().await.unwrap();
        let resolver = IdentityResolver::new();

        let mut tx = storage.transaction().await.unwrap();
        let created = resolver.resolve(&mut tx, &deal("X1", "Acme Corp")).await.unwrap();
        assert_eq!(created.step, ResolutionStep::Created);
        assert!(created.is_new());

        tx.insert_customer(&created.customer).await.unwrap();
        let by_name = resolver.resolve(&mut tx, &deal("X2", "Acme Corp")).await.unwrap();
        assert_eq!(by_name.step, ResolutionStep::Name);
        assert_eq!(by_name.customer.id, created.customer.id);

        link(&mut tx, &created.customer, SourceType::Deal, "X1").await;
        let renamed = resolver.resolve(&mut tx, &deal("X1", "Acme Corporation")).await.unwrap();
        assert_eq!(renamed.step, ResolutionStep::Connector);
        assert_eq!(renamed.customer.id, created.customer.id);
        assert!(renamed.connector.is_some());

        let other = resolver.resolve(&mut tx, &deal("X3", "acme corp")).await.unwrap();
        assert_eq!(other.step, ResolutionStep::Created);
    }

    #[tokio::test]
    async fn test_tie_break_prefers_customer_without_source_record() {
        let storage = Storage::open_memory().await.unwrap();
        let resolver = IdentityResolver::new();
        let mut tx = storage.transaction().await.unwrap();

        let today = Utc::now().date_naive();
        let linked = Customer::new("Globex".into(), today).with_industry(Industry::Healthcare);
        let unlinked = Customer::new("Globex".into(), today).with_industry(Industry::Retail);
        tx.insert_customer(&linked).await.unwrap();
        tx.insert_customer(&unlinked).await.unwrap();
        link(&mut tx, &linked, SourceType::Deal, "D1").await;

        let resolution = resolver.resolve(&mut tx, &deal("D2", "Globex")).await.unwrap();
        assert_eq!(resolution.step, ResolutionStep::TieBreak);
        assert_eq!(resolution.customer.id, unlinked.id);

        for _ in 0..3 {
            let again = resolver.resolve(&mut tx, &deal("D2", "Globex")).await.unwrap();
            assert_eq!(again.customer.id, unlinked.id);
        }
    }
}
