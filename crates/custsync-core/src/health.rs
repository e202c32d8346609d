//! Canonical health classification.
//!
//! Each source describes account health in its own vocabulary. Mappers first
//! reduce that vocabulary to a [`Lifecycle`] signal, then an ordered list of
//! [`HealthRule`]s picks the score. The first rule that fires wins and every
//! list ends in a fallback, so evaluation always produces a value.

use serde::{Deserialize, Serialize};

use crate::customer::HealthScore;
use crate::source::SourceType;

/// Source-independent reading of a status or stage label.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    #[default]
    Unknown,
    Active,
    AtRisk,
    /// Closed-won, expansion, renewal.
    Positive,
    /// Closed-lost, churned.
    Negative,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthInput {
    pub status: Lifecycle,
    pub stage: Lifecycle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenure_months: Option<u32>,
    /// Probability to close, 0..=100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probability: Option<f64>,
}

impl HealthInput {
    fn any(&self, signal: Lifecycle) -> bool {
        self.status == signal || self.stage == signal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum HealthRule {
    TerminalNegative,
    FlaggedAtRisk,
    TerminalPositive,
    Probability { healthy: f64, at_risk: f64 },
    Tenure { months: u32 },
}

impl HealthRule {
    #[must_use]
    pub fn apply(&self, input: &HealthInput) -> Option<HealthScore> {
        match *self {
            Self::TerminalNegative => input
                .any(Lifecycle::Negative)
                .then_some(HealthScore::Critical),
            Self::FlaggedAtRisk => {
                (input.status == Lifecycle::AtRisk).then_some(HealthScore::AtRisk)
            }
            Self::TerminalPositive => input
                .any(Lifecycle::Positive)
                .then_some(HealthScore::Healthy),
            Self::Probability { healthy, at_risk } => {
                // Unknown probability to close counts as zero.
                let p = input.probability.unwrap_or(0.0);
                Some(if p >= healthy {
                    HealthScore::Healthy
                } else if p >= at_risk {
                    HealthScore::AtRisk
                } else {
                    HealthScore::Critical
                })
            }
            Self::Tenure { months } => {
                let tenured = input.tenure_months.is_some_and(|t| t >= months);
                (tenured && input.status == Lifecycle::Active).then_some(HealthScore::Healthy)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRules {
    rules: Vec<HealthRule>,
    fallback: HealthScore,
}

impl HealthRules {
    #[must_use]
    pub const fn new(rules: Vec<HealthRule>, fallback: HealthScore) -> Self {
        Self { rules, fallback }
    }

    /// Deal stages plus probability to close.
    #[must_use]
    pub fn deal() -> Self {
        Self::new(
            vec![
                HealthRule::TerminalNegative,
                HealthRule::TerminalPositive,
                HealthRule::Probability {
                    healthy: 75.0,
                    at_risk: 50.0,
                },
            ],
            HealthScore::AtRisk,
        )
    }

    /// Account status and stage plus customer tenure.
    #[must_use]
    pub fn health() -> Self {
        Self::new(
            vec![
                HealthRule::TerminalNegative,
                HealthRule::FlaggedAtRisk,
                HealthRule::TerminalPositive,
                HealthRule::Tenure { months: 12 },
            ],
            HealthScore::AtRisk,
        )
    }

    /// Calls never own the health score.
    #[must_use]
    pub const fn calls() -> Self {
        Self::new(Vec::new(), HealthScore::AtRisk)
    }

    #[must_use]
    pub fn for_source(source: SourceType) -> Self {
        match source {
            SourceType::Deal => Self::deal(),
            SourceType::Health => Self::health(),
            SourceType::Calls => Self::calls(),
        }
    }

    #[must_use]
    pub fn rules(&self) -> &[HealthRule] {
        &self.rules
    }

    #[must_use]
    pub fn evaluate(&self, input: &HealthInput) -> HealthScore {
        self.rules
            .iter()
            .find_map(|rule| rule.apply(input))
            .unwrap_or(self.fallback)
    }
}

#[must_use]
pub fn calculate(source: SourceType, input: &HealthInput) -> HealthScore {
    HealthRules::for_source(source).evaluate(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deal(stage: Lifecycle, probability: f64) -> HealthInput {
        HealthInput {
            stage,
            probability: Some(probability),
            ..HealthInput::default()
        }
    }

    #[test]
    fn test_deal_terminal_stages_override_probability() {
        let rules = HealthRules::deal();
        assert_eq!(rules.evaluate(&deal(Lifecycle::Negative, 99.0)), HealthScore::Critical);
        assert_eq!(rules.evaluate(&deal(Lifecycle::Positive, 0.0)), HealthScore::Healthy);
    }

    #[test]
    fn test_deal_probability_thresholds() {
        let rules = HealthRules::deal();
        assert_eq!(rules.evaluate(&deal(Lifecycle::Active, 75.0)), HealthScore::Healthy);
        assert_eq!(rules.evaluate(&deal(Lifecycle::Active, 74.9)), HealthScore::AtRisk);
        assert_eq!(rules.evaluate(&deal(Lifecycle::Active, 50.0)), HealthScore::AtRisk);
        assert_eq!(rules.evaluate(&deal(Lifecycle::Active, 10.0)), HealthScore::Critical);
    }

    #[test]
    fn test_missing_probability_scores_as_zero() {
        let input = HealthInput {
            status: Lifecycle::Active,
            stage: Lifecycle::Active,
            ..HealthInput::default()
        };
        assert_eq!(calculate(SourceType::Deal, &input), HealthScore::Critical);
        assert_eq!(
            calculate(SourceType::Deal, &deal(Lifecycle::Active, 0.0)),
            HealthScore::Critical
        );
    }

    #[test]
    fn test_health_tenure_requires_active_status() {
        let rules = HealthRules::health();
        let mut input = HealthInput {
            status: Lifecycle::Active,
            stage: Lifecycle::Active,
            tenure_months: Some(18),
            probability: None,
        };
        assert_eq!(rules.evaluate(&input), HealthScore::Healthy);

        input.tenure_months = Some(6);
        assert_eq!(rules.evaluate(&input), HealthScore::AtRisk);

        input.tenure_months = Some(18);
        input.status = Lifecycle::Unknown;
        assert_eq!(rules.evaluate(&input), HealthScore::AtRisk);
    }

    #[test]
    fn test_health_flagged_status_beats_positive_stage() {
        let input = HealthInput {
            status: Lifecycle::AtRisk,
            stage: Lifecycle::Positive,
            ..HealthInput::default()
        };
        assert_eq!(HealthRules::health().evaluate(&input), HealthScore::AtRisk);
    }

    #[test]
    fn test_calls_always_fall_back() {
        let input = deal(Lifecycle::Negative, 0.0);
        assert_eq!(calculate(SourceType::Calls, &input), HealthScore::AtRisk);
    }

    #[test]
    fn test_nan_probability_is_classified() {
        let input = deal(Lifecycle::Active, f64::NAN);
        assert_eq!(HealthRules::deal().evaluate(&input), HealthScore::Critical);
    }
}
