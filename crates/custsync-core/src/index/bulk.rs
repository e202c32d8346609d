//! Full-corpus reindex in fixed-size batches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::reindexer::Reindexer;
use super::IndexResult;

pub const DEFAULT_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub index: usize,
    pub succeeded: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub batches: Vec<BatchResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BulkSummary {
    #[must_use]
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }

    /// Describes the failures of a run that did not reindex everything,
    /// quoting the first batch error. `None` when every customer succeeded.
    #[must_use]
    pub fn failure_message(&self) -> Option<String> {
        if self.failed == 0 {
            return None;
        }
        let mut message = format!(
            "{} of {} customers failed to reindex",
            self.failed,
            self.total()
        );
        if let Some(first) = self.batches.iter().find_map(|b| b.error.as_deref()) {
            message.push_str(": ");
            message.push_str(first);
        }
        Some(message)
    }
}

pub struct BulkReindexer {
    reindexer: Reindexer,
}

impl BulkReindexer {
    #[must_use]
    pub const fn new(reindexer: Reindexer) -> Self {
        Self { reindexer }
    }

    /// Walks every customer by id. A failed embedding counts against its
    /// customer; a failed upsert counts the whole batch. Neither stops the
    /// run. Only a storage read error does.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn run(&self, batch_size: usize) -> IndexResult<BulkSummary> {
        let batch_size = batch_size.max(1);
        let started_at = Utc::now();
        let mut batches = Vec::new();
        let mut after: Option<Uuid> = None;

        loop {
            let customers = self
                .reindexer
                .storage()
                .list_customers_after(after, batch_size)
                .await?;
            let Some(last) = customers.last() else {
                break;
            };
            after = Some(last.id);
            let fetched = customers.len();

            let mut result = BatchResult {
                index: batches.len(),
                succeeded: 0,
                failed: 0,
                error: None,
            };
            let mut records = Vec::with_capacity(fetched);
            for customer in customers {
                let customer_id = customer.id;
                let record = match self.reindexer.context_for(customer).await {
                    Ok(context) => self.reindexer.build_record(&context).await,
                    Err(err) => Err(err),
                };
                match record {
                    Ok(record) => records.push(record),
                    Err(err) => {
                        tracing::warn!(%customer_id, error = %err, "Failed to build index entry");
                        result.failed += 1;
                    }
                }
            }

            let built = records.len();
            if built > 0 {
                match self.reindexer.store().upsert(records).await {
                    Ok(()) => result.succeeded += built,
                    Err(err) => {
                        tracing::warn!(batch = result.index, error = %err, "Batch upsert failed");
                        result.failed += built;
                        result.error = Some(err.to_string());
                    }
                }
            }

            tracing::debug!(
                batch = result.index,
                succeeded = result.succeeded,
                failed = result.failed,
                "Batch finished"
            );
            batches.push(result);

            if fetched < batch_size {
                break;
            }
        }

        let summary = BulkSummary {
            succeeded: batches.iter().map(|b| b.succeeded).sum(),
            failed: batches.iter().map(|b| b.failed).sum(),
            batches,
            started_at,
            finished_at: Utc::now(),
        };
        tracing::info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            batches = summary.batches.len(),
            "Bulk reindex finished"
        );
        Ok(summary)
    }
}
