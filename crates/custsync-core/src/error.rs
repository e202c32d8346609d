use thiserror::Error;

use crate::source::SourceType;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Customer not found: {0}")]
    CustomerNotFound(uuid::Uuid),

    #[error("Connector not found: {0}")]
    ConnectorNotFound(uuid::Uuid),

    #[error("Invalid source type: {0}")]
    InvalidSourceType(String),

    #[error("Invalid {field} value: {value}")]
    InvalidValue { field: &'static str, value: String },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Identity conflict for {source_type} record {external_id}")]
    IdentityConflict {
        source_type: SourceType,
        external_id: String,
    },

    #[error("Source {0} is not configured")]
    SourceNotConfigured(SourceType),

    #[error("Source {source_type} unreachable after {attempts} attempts: {message}")]
    SourceUnreachable {
        source_type: SourceType,
        attempts: u32,
        message: String,
    },

    #[error("Reindex queue is closed")]
    QueueClosed,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn corrupt(field: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            value: value.into(),
        }
    }

    /// Unique-constraint violations and SQLite busy/locked errors. Both mean
    /// another writer got there first and the record should be retried.
    #[must_use]
    pub fn is_write_conflict(&self) -> bool {
        match self {
            Self::IdentityConflict { .. } => true,
            Self::Database(sqlx::Error::Database(db_err)) => {
                db_err.is_unique_violation()
                    || matches!(
                        db_err.code().as_deref(),
                        Some("5" | "6" | "261" | "262" | "517")
                    )
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
