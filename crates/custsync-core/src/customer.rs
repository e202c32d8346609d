use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::source::SourceType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Industry {
    Education,
    Technology,
    Healthcare,
    Finance,
    Retail,
    Manufacturing,
    Other,
}

impl Industry {
    pub const ALL: [Self; 7] = [
        Self::Education,
        Self::Technology,
        Self::Healthcare,
        Self::Finance,
        Self::Retail,
        Self::Manufacturing,
        Self::Other,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Education => "education",
            Self::Technology => "technology",
            Self::Healthcare => "healthcare",
            Self::Finance => "finance",
            Self::Retail => "retail",
            Self::Manufacturing => "manufacturing",
            Self::Other => "other",
        }
    }

    /// Fixed preference used when several customers share a name. Lower wins.
    #[must_use]
    pub const fn resolution_rank(&self) -> u8 {
        match self {
            Self::Healthcare => 0,
            Self::Education => 1,
            Self::Finance => 2,
            Self::Technology => 3,
            Self::Retail => 4,
            Self::Manufacturing => 5,
            Self::Other => 6,
        }
    }
}

impl std::fmt::Display for Industry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Industry {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|i| i.as_str() == s)
            .ok_or_else(|| crate::Error::corrupt("industry", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthScore {
    Healthy,
    AtRisk,
    Critical,
}

impl HealthScore {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::AtRisk => "at_risk",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for HealthScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HealthScore {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(Self::Healthy),
            "at_risk" => Ok(Self::AtRisk),
            "critical" => Ok(Self::Critical),
            _ => Err(crate::Error::corrupt("health_score", s)),
        }
    }
}

/// Annual recurring revenue in cents. Never negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Arr(i64);

impl Arr {
    pub const ZERO: Self = Self(0);

    pub fn from_cents(cents: i64) -> crate::Result<Self> {
        if cents < 0 {
            return Err(crate::Error::Validation(format!(
                "ARR must be non-negative, got {cents} cents"
            )));
        }
        Ok(Self(cents))
    }

    /// Converts a currency amount as reported by a source API.
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_amount(amount: f64) -> crate::Result<Self> {
        if !amount.is_finite() {
            return Err(crate::Error::Validation(format!(
                "ARR must be a finite number, got {amount}"
            )));
        }
        if amount < 0.0 {
            return Err(crate::Error::Validation(format!(
                "ARR must be non-negative, got {amount}"
            )));
        }
        Self::from_cents((amount * 100.0).round() as i64)
    }

    #[must_use]
    pub const fn cents(&self) -> i64 {
        self.0
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl std::fmt::Display for Arr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${}.{:02}", self.0 / 100, self.0 % 100)
    }
}

/// When each source last wrote to a customer. A set timestamp doubles as the
/// "synced from this source" flag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deal: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calls: Option<DateTime<Utc>>,
}

impl SyncState {
    #[must_use]
    pub const fn get(&self, source: SourceType) -> Option<DateTime<Utc>> {
        match source {
            SourceType::Deal => self.deal,
            SourceType::Health => self.health,
            SourceType::Calls => self.calls,
        }
    }

    #[must_use]
    pub const fn is_synced(&self, source: SourceType) -> bool {
        self.get(source).is_some()
    }

    pub fn mark(&mut self, source: SourceType, at: DateTime<Utc>) {
        let slot = match source {
            SourceType::Deal => &mut self.deal,
            SourceType::Health => &mut self.health,
            SourceType::Calls => &mut self.calls,
        };
        *slot = Some(at);
    }
}

/// The merged representation of one real-world company.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: Uuid,
    pub name: String,
    pub industry: Industry,
    pub arr: Arr,
    pub health_score: HealthScore,
    pub renewal_date: NaiveDate,
    #[serde(default)]
    pub products: Vec<String>,
    #[serde(default)]
    pub sync: SyncState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Customer {
    #[must_use]
    pub fn new(name: String, renewal_date: NaiveDate) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            name,
            industry: Industry::Other,
            arr: Arr::ZERO,
            health_score: HealthScore::AtRisk,
            renewal_date,
            products: Vec::new(),
            sync: SyncState::default(),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub const fn with_industry(mut self, industry: Industry) -> Self {
        self.industry = industry;
        self
    }

    #[must_use]
    pub const fn with_arr(mut self, arr: Arr) -> Self {
        self.arr = arr;
        self
    }

    #[must_use]
    pub const fn with_health(mut self, health_score: HealthScore) -> Self {
        self.health_score = health_score;
        self
    }

    #[must_use]
    pub fn with_products(mut self, products: Vec<String>) -> Self {
        self.products = products;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arr_rejects_negative() {
        assert!(Arr::from_amount(-1.0).is_err());
        assert!(Arr::from_cents(-5).is_err());
        assert!(Arr::from_amount(f64::NAN).is_err());
        assert_eq!(Arr::from_amount(100_000.0).unwrap().cents(), 10_000_000);
    }

    #[test]
    fn test_arr_rounds_to_cents() {
        let arr = Arr::from_amount(1234.567).unwrap();
        assert_eq!(arr.cents(), 123_457);
        assert_eq!(arr.to_string(), "$1234.57");
        assert!((arr.as_f64() - 1234.57).abs() < f64::EPSILON);
    }

    #[test]
    fn test_industry_round_trip() {
        for industry in Industry::ALL {
            assert_eq!(industry.as_str().parse::<Industry>().unwrap(), industry);
        }
        assert!("aerospace".parse::<Industry>().is_err());
    }

    #[test]
    fn test_healthcare_ranks_first() {
        let best = Industry::ALL
            .into_iter()
            .min_by_key(Industry::resolution_rank)
            .unwrap();
        assert_eq!(best, Industry::Healthcare);
    }

    #[test]
    fn test_sync_state_marks_source() {
        let mut state = SyncState::default();
        assert!(!state.is_synced(SourceType::Deal));

        let now = Utc::now();
        state.mark(SourceType::Deal, now);

        assert_eq!(state.get(SourceType::Deal), Some(now));
        assert!(!state.is_synced(SourceType::Health));
    }
}
