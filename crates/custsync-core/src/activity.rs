//! Records that hang off a customer: usage metrics, feedback and meetings.
//! Writing any of them changes the customer's similarity representation.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageTrend {
    Up,
    Down,
    Stable,
}

impl UsageTrend {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Stable => "stable",
        }
    }
}

impl std::str::FromStr for UsageTrend {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            "stable" => Ok(Self::Stable),
            _ => Err(crate::Error::corrupt("usage_trend", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerMetrics {
    pub customer_id: Uuid,
    /// Net promoter score, -100..=100.
    pub nps: i32,
    pub usage_trend: UsageTrend,
    pub active_users: u32,
    /// Percentage, 0..=100.
    pub renewal_rate: f64,
    /// Percentage, 0..=100.
    pub seat_utilization: f64,
    pub response_limit: u32,
    pub response_used: u32,
    pub updated_at: DateTime<Utc>,
}

impl CustomerMetrics {
    #[must_use]
    pub fn new(customer_id: Uuid, nps: i32, usage_trend: UsageTrend, active_users: u32) -> Self {
        Self {
            customer_id,
            nps,
            usage_trend,
            active_users,
            renewal_rate: 0.0,
            seat_utilization: 0.0,
            response_limit: 0,
            response_used: 0,
            updated_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn response_usage_percentage(&self) -> f64 {
        if self.response_limit == 0 {
            return 0.0;
        }
        f64::from(self.response_used) / f64::from(self.response_limit) * 100.0
    }

    pub fn validate(&self) -> crate::Result<()> {
        if !(-100..=100).contains(&self.nps) {
            return Err(crate::Error::Validation(format!(
                "NPS must be within -100..=100, got {}",
                self.nps
            )));
        }
        for (label, value) in [
            ("renewal rate", self.renewal_rate),
            ("seat utilization", self.seat_utilization),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(crate::Error::Validation(format!(
                    "{label} must be a percentage, got {value}"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackStatus {
    Open,
    InProgress,
    Resolved,
    Closed,
}

impl FeedbackStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Resolved => "resolved",
            Self::Closed => "closed",
        }
    }
}

impl std::str::FromStr for FeedbackStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "resolved" => Ok(Self::Resolved),
            "closed" => Ok(Self::Closed),
            _ => Err(crate::Error::corrupt("feedback_status", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub title: String,
    pub status: FeedbackStatus,
    #[serde(default)]
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Feedback {
    #[must_use]
    pub fn new(customer_id: Uuid, title: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            customer_id,
            title,
            status: FeedbackStatus::Open,
            description: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: String) -> Self {
        self.description = description;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl Sentiment {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Neutral => "neutral",
            Self::Negative => "negative",
        }
    }
}

impl std::str::FromStr for Sentiment {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "positive" => Ok(Self::Positive),
            "neutral" => Ok(Self::Neutral),
            "negative" => Ok(Self::Negative),
            _ => Err(crate::Error::corrupt("sentiment", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meeting {
    pub id: Uuid,
    pub customer_id: Uuid,
    /// Set for meetings synced from the call-intelligence source.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<Uuid>,
    pub date: NaiveDate,
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub participants: Vec<String>,
    pub sentiment: Sentiment,
    pub created_at: DateTime<Utc>,
}

impl Meeting {
    #[must_use]
    pub fn new(customer_id: Uuid, date: NaiveDate, summary: String) -> Self {
        Self {
            id: Uuid::now_v7(),
            customer_id,
            connector_id: None,
            date,
            title: String::new(),
            summary,
            participants: Vec::new(),
            sentiment: Sentiment::Neutral,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_usage_percentage() {
        let mut metrics = CustomerMetrics::new(Uuid::now_v7(), 40, UsageTrend::Up, 120);
        assert!(metrics.response_usage_percentage().abs() < f64::EPSILON);

        metrics.response_limit = 200;
        metrics.response_used = 50;
        assert!((metrics.response_usage_percentage() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_metrics_validation() {
        let mut metrics = CustomerMetrics::new(Uuid::now_v7(), 101, UsageTrend::Stable, 1);
        assert!(metrics.validate().is_err());

        metrics.nps = -100;
        assert!(metrics.validate().is_ok());

        metrics.seat_utilization = 120.0;
        assert!(metrics.validate().is_err());
    }

    #[test]
    fn test_feedback_defaults_open() {
        let feedback = Feedback::new(Uuid::now_v7(), "Slow exports".into());
        assert_eq!(feedback.status, FeedbackStatus::Open);
        assert_eq!("in_progress".parse::<FeedbackStatus>().unwrap(), FeedbackStatus::InProgress);
    }
}
