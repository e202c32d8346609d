use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// External system a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceType {
    /// Deal-tracking system (opportunities).
    Deal,
    /// Customer-health system (company records).
    Health,
    /// Call-intelligence system (recorded calls).
    Calls,
}

impl SourceType {
    pub const ALL: [Self; 3] = [Self::Deal, Self::Health, Self::Calls];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Deal => "DEAL",
            Self::Health => "HEALTH",
            Self::Calls => "CALLS",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DEAL" => Ok(Self::Deal),
            "HEALTH" => Ok(Self::Health),
            "CALLS" => Ok(Self::Calls),
            _ => Err(crate::Error::InvalidSourceType(s.to_string())),
        }
    }
}

/// A single projected value from a raw payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Number(f64),
    Bool(bool),
    Date(NaiveDate),
}

impl FieldValue {
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Text(_) => "text",
            Self::Number(_) => "number",
            Self::Bool(_) => "bool",
            Self::Date(_) => "date",
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<NaiveDate> for FieldValue {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

/// Fields pulled out of a raw payload because something queries them.
pub type ExtractedFields = BTreeMap<String, FieldValue>;

/// Raw payload plus its extracted projection. The payload is stored as-is so
/// upstream schema changes never touch the canonical tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub id: Uuid,
    pub raw_payload: serde_json::Value,
    #[serde(default)]
    pub extracted: ExtractedFields,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    pub last_synced_at: DateTime<Utc>,
}

impl SourceMetadata {
    #[must_use]
    pub fn new(raw_payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            raw_payload,
            extracted: ExtractedFields::new(),
            api_version: None,
            last_synced_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_extracted(mut self, extracted: ExtractedFields) -> Self {
        self.extracted = extracted;
        self
    }

    #[must_use]
    pub fn with_api_version(mut self, api_version: Option<String>) -> Self {
        self.api_version = api_version;
        self
    }
}

/// Typed link from a canonical customer to one record in one external system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConnector {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub source_type: SourceType,
    pub external_id: String,
    pub metadata_id: Uuid,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SourceConnector {
    #[must_use]
    pub fn new(
        customer_id: Uuid,
        source_type: SourceType,
        external_id: String,
        metadata_id: Uuid,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            customer_id,
            source_type,
            external_id,
            metadata_id,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }
}
