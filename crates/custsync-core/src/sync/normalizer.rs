//! Source vocabularies mapped onto canonical values.
//!
//! Normalization never fails. Unknown labels, blank values and opaque
//! identifiers all fall back to the vocabulary's default, and the
//! [`Outcome`] records which of those happened.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::activity::{Sentiment, UsageTrend};
use crate::customer::Industry;
use crate::health::Lifecycle;

static OPAQUE_ID: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{21,}$").ok());

/// True for long single-token identifiers that some sources return in place
/// of a display label.
#[must_use]
pub fn is_opaque_id(value: &str) -> bool {
    OPAQUE_ID.as_ref().is_some_and(|re| re.is_match(value))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Mapped,
    /// A label was present but not in the vocabulary.
    Defaulted,
    OpaqueId,
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Normalized<T> {
    pub value: T,
    pub outcome: Outcome,
}

impl<T> Normalized<T> {
    const fn new(value: T, outcome: Outcome) -> Self {
        Self { value, outcome }
    }

    /// A present value was replaced by the default.
    #[must_use]
    pub const fn substituted(&self) -> bool {
        matches!(self.outcome, Outcome::Defaulted | Outcome::OpaqueId)
    }
}

pub trait Vocabulary: Sized + Copy {
    const DEFAULT: Self;

    fn from_label(label: &str) -> Option<Self>;

    fn as_str(&self) -> &'static str;
}

pub fn normalize<V: Vocabulary>(raw: Option<&str>) -> Normalized<V> {
    match raw.map(str::trim) {
        None | Some("") => Normalized::new(V::DEFAULT, Outcome::Missing),
        Some(label) if is_opaque_id(label) => Normalized::new(V::DEFAULT, Outcome::OpaqueId),
        Some(label) => V::from_label(label).map_or_else(
            || Normalized::new(V::DEFAULT, Outcome::Defaulted),
            |value| Normalized::new(value, Outcome::Mapped),
        ),
    }
}

fn lookup<V: Copy>(table: &[(&str, V)], label: &str) -> Option<V> {
    table
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(label))
        .map(|(_, value)| *value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealStage {
    Qualified,
    Development,
    Proposal,
    Negotiating,
    Contracting,
    ReadyToClose,
    ClosedWon,
    ClosedLost,
}

impl DealStage {
    #[must_use]
    pub const fn lifecycle(&self) -> Lifecycle {
        match self {
            Self::ClosedWon => Lifecycle::Positive,
            Self::ClosedLost => Lifecycle::Negative,
            _ => Lifecycle::Active,
        }
    }
}

impl Vocabulary for DealStage {
    const DEFAULT: Self = Self::Qualified;

    fn from_label(label: &str) -> Option<Self> {
        lookup(
            &[
                ("Qualified", Self::Qualified),
                ("Development", Self::Development),
                ("Proposal", Self::Proposal),
                ("Negotiating", Self::Negotiating),
                ("Contracting", Self::Contracting),
                ("Ready to Close", Self::ReadyToClose),
                ("Closed Won", Self::ClosedWon),
                ("Closed Lost", Self::ClosedLost),
            ],
            label,
        )
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Qualified => "qualified",
            Self::Development => "development",
            Self::Proposal => "proposal",
            Self::Negotiating => "negotiating",
            Self::Contracting => "contracting",
            Self::ReadyToClose => "ready_to_close",
            Self::ClosedWon => "closed_won",
            Self::ClosedLost => "closed_lost",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealType {
    NewBusiness,
    Renewal,
    Upsell,
    CrossSell,
}

impl Vocabulary for DealType {
    const DEFAULT: Self = Self::Renewal;

    fn from_label(label: &str) -> Option<Self> {
        lookup(
            &[
                ("New Business", Self::NewBusiness),
                ("Renewal", Self::Renewal),
                ("Upsell", Self::Upsell),
                ("Cross-Sell", Self::CrossSell),
            ],
            label,
        )
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::NewBusiness => "new_business",
            Self::Renewal => "renewal",
            Self::Upsell => "upsell",
            Self::CrossSell => "cross_sell",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenewalCategory {
    VerbalCommit,
    LeaningOurWay,
    Neutral,
    LeaningAway,
    AtRisk,
    Unspecified,
}

impl RenewalCategory {
    /// Forecast confidence encoded in the label.
    #[must_use]
    pub const fn confidence(&self) -> Option<u8> {
        match self {
            Self::VerbalCommit => Some(95),
            Self::LeaningOurWay => Some(65),
            Self::Neutral => Some(50),
            Self::LeaningAway => Some(35),
            Self::AtRisk => Some(20),
            Self::Unspecified => None,
        }
    }
}

impl Vocabulary for RenewalCategory {
    const DEFAULT: Self = Self::Unspecified;

    fn from_label(label: &str) -> Option<Self> {
        // Labels carry a "(NN%)" suffix that is sometimes dropped.
        let label = label.split(" (").next().unwrap_or(label).trim();
        lookup(
            &[
                ("Verbal Commit", Self::VerbalCommit),
                ("Leaning our Way", Self::LeaningOurWay),
                ("Neutral", Self::Neutral),
                ("Leaning Away", Self::LeaningAway),
                ("At Risk", Self::AtRisk),
            ],
            label,
        )
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::VerbalCommit => "verbal_commit",
            Self::LeaningOurWay => "leaning_our_way",
            Self::Neutral => "neutral",
            Self::LeaningAway => "leaning_away",
            Self::AtRisk => "at_risk",
            Self::Unspecified => "unspecified",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Inactive,
    Churned,
    AtRisk,
    Expansion,
}

impl AccountStatus {
    #[must_use]
    pub const fn lifecycle(&self) -> Lifecycle {
        match self {
            Self::Active => Lifecycle::Active,
            Self::Inactive | Self::AtRisk => Lifecycle::AtRisk,
            Self::Churned => Lifecycle::Negative,
            Self::Expansion => Lifecycle::Positive,
        }
    }
}

impl Vocabulary for AccountStatus {
    const DEFAULT: Self = Self::Active;

    fn from_label(label: &str) -> Option<Self> {
        lookup(
            &[
                ("Active", Self::Active),
                ("Inactive", Self::Inactive),
                ("Churned", Self::Churned),
                ("At Risk", Self::AtRisk),
                ("Expansion", Self::Expansion),
            ],
            label,
        )
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Churned => "churned",
            Self::AtRisk => "at_risk",
            Self::Expansion => "expansion",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStage {
    NewCustomer,
    KickedOff,
    Launched,
    Adoption,
    Expansion,
    Renewal,
    Churned,
}

impl AccountStage {
    #[must_use]
    pub const fn lifecycle(&self) -> Lifecycle {
        match self {
            Self::Expansion | Self::Renewal => Lifecycle::Positive,
            Self::Churned => Lifecycle::Negative,
            _ => Lifecycle::Active,
        }
    }
}

impl Vocabulary for AccountStage {
    const DEFAULT: Self = Self::NewCustomer;

    fn from_label(label: &str) -> Option<Self> {
        lookup(
            &[
                ("New Customer", Self::NewCustomer),
                ("Kicked Off", Self::KickedOff),
                ("Launched", Self::Launched),
                ("Adoption", Self::Adoption),
                ("Expansion", Self::Expansion),
                ("Renewal", Self::Renewal),
                ("Churned", Self::Churned),
            ],
            label,
        )
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::NewCustomer => "new_customer",
            Self::KickedOff => "kicked_off",
            Self::Launched => "launched",
            Self::Adoption => "adoption",
            Self::Expansion => "expansion",
            Self::Renewal => "renewal",
            Self::Churned => "churned",
        }
    }
}

impl Vocabulary for Industry {
    const DEFAULT: Self = Self::Other;

    fn from_label(label: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .filter(|i| *i != Self::Other)
            .find(|i| i.as_str().eq_ignore_ascii_case(label))
    }

    fn as_str(&self) -> &'static str {
        Self::as_str(self)
    }
}

impl Vocabulary for Sentiment {
    const DEFAULT: Self = Self::Neutral;

    fn from_label(label: &str) -> Option<Self> {
        lookup(
            &[
                ("positive", Self::Positive),
                ("neutral", Self::Neutral),
                ("negative", Self::Negative),
            ],
            label,
        )
    }

    fn as_str(&self) -> &'static str {
        Self::as_str(self)
    }
}

impl Vocabulary for UsageTrend {
    const DEFAULT: Self = Self::Stable;

    fn from_label(label: &str) -> Option<Self> {
        lookup(
            &[
                ("up", Self::Up),
                ("increasing", Self::Up),
                ("down", Self::Down),
                ("decreasing", Self::Down),
                ("stable", Self::Stable),
            ],
            label,
        )
    }

    fn as_str(&self) -> &'static str {
        Self::as_str(self)
    }
}

const INDUSTRY_KEYWORDS: &[(Industry, &[&str])] = &[
    (Industry::Technology, &["tech", "software", "digital"]),
    (Industry::Healthcare, &["health", "medical", "hospital"]),
    (Industry::Finance, &["bank", "finance", "financial"]),
    (Industry::Retail, &["retail", "shop", "store"]),
    (
        Industry::Education,
        &["education", "university", "school", "institute"],
    ),
    (
        Industry::Manufacturing,
        &["manufacturing", "factory", "production"],
    ),
];

/// Guesses an industry from a company name. A keyword matches the start of
/// a word, so "Healthcare" and "Technologies" count but "Fintech" does not.
#[must_use]
pub fn industry_from_name(name: &str) -> Normalized<Industry> {
    let words: Vec<String> = name
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();

    if words.is_empty() {
        return Normalized::new(Industry::Other, Outcome::Missing);
    }

    INDUSTRY_KEYWORDS
        .iter()
        .find(|(_, keywords)| {
            words
                .iter()
                .any(|word| keywords.iter().any(|k| word.starts_with(k)))
        })
        .map_or(
            Normalized::new(Industry::Other, Outcome::Defaulted),
            |(industry, _)| Normalized::new(*industry, Outcome::Mapped),
        )
}
