//! Source sync: fetch, normalize, resolve, upsert.

pub mod mapping;
pub mod normalizer;
pub mod orchestrator;
pub mod resolver;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::source::SourceType;
use crate::Error;

pub use mapping::{map_record, RecordError, SourceRecord};
pub use orchestrator::SyncOrchestrator;
pub use resolver::{IdentityResolver, Resolution, ResolutionStep};

/// A record that could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFailure {
    /// External id when the record had one, otherwise `#<index>`.
    pub reference: String,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Completed,
    /// The source could not be fetched at all.
    Failed,
}

impl SyncStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for SyncStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(Error::corrupt("sync_status", s)),
        }
    }
}

/// Outcome of one sync run, persisted as a sync run row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSummary {
    pub id: Uuid,
    pub source: SourceType,
    pub status: SyncStatus,
    pub synced: usize,
    pub failed: usize,
    pub created: usize,
    pub updated: usize,
    /// Fields replaced by a vocabulary default across the run.
    pub defaulted: usize,
    #[serde(default)]
    pub failures: Vec<RecordFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl SyncSummary {
    #[must_use]
    pub fn start(source: SourceType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            source,
            status: SyncStatus::Completed,
            synced: 0,
            failed: 0,
            created: 0,
            updated: 0,
            defaulted: 0,
            failures: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    pub fn record_failure(&mut self, reference: String, error: impl std::fmt::Display) {
        self.failed += 1;
        self.failures.push(RecordFailure {
            reference,
            error: error.to_string(),
        });
    }

    #[must_use]
    pub fn finish(mut self, status: SyncStatus) -> Self {
        self.status = status;
        self.finished_at = Utc::now();
        self
    }
}

/// Optional narrowing of a sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFilters {
    /// Only records modified at or after this time. Records without a
    /// modification time are kept.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<DateTime<Utc>>,
    /// Call-intelligence account filter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    /// Stop after this many raw records.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl SyncFilters {
    #[must_use]
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    #[must_use]
    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub(crate) fn admits(&self, modified_at: Option<DateTime<Utc>>) -> bool {
        match (self.since, modified_at) {
            (Some(since), Some(at)) => at >= since,
            _ => true,
        }
    }
}
