//! Per-source projection of a raw payload into a [`SourceRecord`].

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::normalizer::{
    industry_from_name, normalize, AccountStage, AccountStatus, DealStage, DealType,
    Normalized, Outcome, RenewalCategory, Vocabulary,
};
use crate::activity::{CustomerMetrics, Meeting, Sentiment, UsageTrend};
use crate::customer::{Arr, Industry};
use crate::health::{HealthInput, Lifecycle};
use crate::source::{ExtractedFields, FieldValue, SourceType};

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Record is not a JSON object")]
    NotAnObject,
    #[error("Missing identifier field {0}")]
    MissingIdentifier(&'static str),
    #[error("Missing name field {0}")]
    MissingName(&'static str),
    #[error("Invalid {field}: {message}")]
    InvalidField {
        field: &'static str,
        message: String,
    },
}

pub type RecordResult<T> = Result<T, RecordError>;

/// Canonical fields a source is authoritative for. `None` leaves the
/// stored value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CanonicalUpdate {
    pub name: Option<String>,
    pub industry: Option<Industry>,
    /// Only applied when the record creates the customer.
    pub industry_on_create: Option<Industry>,
    pub arr: Option<Arr>,
    pub renewal_date: Option<NaiveDate>,
    pub products: Option<Vec<String>>,
    /// Present when the source owns the health score.
    pub health: Option<HealthInput>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsDraft {
    pub nps: i32,
    pub usage_trend: UsageTrend,
    pub active_users: u32,
    pub renewal_rate: f64,
    pub seat_utilization: f64,
    pub response_limit: u32,
    pub response_used: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeetingDraft {
    pub date: NaiveDate,
    pub title: String,
    pub summary: String,
    pub participants: Vec<String>,
    pub sentiment: Sentiment,
}

impl MetricsDraft {
    #[must_use]
    pub fn into_metrics(self, customer_id: Uuid) -> CustomerMetrics {
        CustomerMetrics {
            renewal_rate: self.renewal_rate,
            seat_utilization: self.seat_utilization,
            response_limit: self.response_limit,
            response_used: self.response_used,
            ..CustomerMetrics::new(customer_id, self.nps, self.usage_trend, self.active_users)
        }
    }
}

impl MeetingDraft {
    /// One meeting per call, keyed by the call's connector.
    #[must_use]
    pub fn into_meeting(self, customer_id: Uuid, connector_id: Uuid) -> Meeting {
        Meeting {
            connector_id: Some(connector_id),
            title: self.title,
            participants: self.participants,
            sentiment: self.sentiment,
            ..Meeting::new(customer_id, self.date, self.summary)
        }
    }
}

/// Record written alongside the customer in the same transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Dependent {
    Metrics(MetricsDraft),
    Meeting(MeetingDraft),
}

#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub source: SourceType,
    pub external_id: String,
    pub name: String,
    pub payload: Value,
    pub extracted: ExtractedFields,
    pub api_version: Option<String>,
    pub modified_at: Option<DateTime<Utc>>,
    pub update: CanonicalUpdate,
    pub dependent: Option<Dependent>,
    /// Fields whose present value was replaced by a vocabulary default.
    pub defaulted: Vec<&'static str>,
}

impl SourceRecord {
    fn new(source: SourceType, external_id: String, name: String, payload: &Value) -> Self {
        Self {
            source,
            external_id,
            name,
            payload: payload.clone(),
            extracted: ExtractedFields::new(),
            api_version: None,
            modified_at: None,
            update: CanonicalUpdate::default(),
            dependent: None,
            defaulted: Vec::new(),
        }
    }

    fn normalized<V: Vocabulary>(&mut self, field: &'static str, raw: Option<&str>) -> V {
        let normalized: Normalized<V> = normalize(raw);
        self.note(field, &normalized);
        self.extracted
            .insert(field.to_string(), FieldValue::from(normalized.value.as_str()));
        normalized.value
    }

    fn note<T>(&mut self, field: &'static str, normalized: &Normalized<T>) {
        if normalized.substituted() {
            tracing::debug!(
                source = %self.source,
                external_id = %self.external_id,
                field,
                outcome = ?normalized.outcome,
                "Substituted default for unmapped value"
            );
            self.defaulted.push(field);
        }
    }

    fn extract(&mut self, key: &str, value: Option<FieldValue>) {
        if let Some(value) = value {
            self.extracted.insert(key.to_string(), value);
        }
    }
}

pub fn map_record(source: SourceType, raw: &Value) -> RecordResult<SourceRecord> {
    if !raw.is_object() {
        return Err(RecordError::NotAnObject);
    }
    match source {
        SourceType::Deal => map_deal(raw),
        SourceType::Health => map_health(raw),
        SourceType::Calls => map_calls(raw),
    }
}

/// Deal-tracking opportunity.
fn map_deal(raw: &Value) -> RecordResult<SourceRecord> {
    let external_id = required_id(raw, &["Id"], "Id")?;
    let name = required_name(raw, &["Account", "Name"], "Account.Name")?;
    let mut record = SourceRecord::new(SourceType::Deal, external_id, name.clone(), raw);

    let stage: DealStage = record.normalized("stage", text(raw, &["StageName"]));
    let _: DealType = record.normalized("deal_type", text(raw, &["Type"]));
    let category: RenewalCategory =
        record.normalized("renewal_category", text(raw, &["Renewal_Categories__c"]));

    let probability = number(raw, &["Probability"], "Probability")?;
    let amount = match number(raw, &["Amount"], "Amount")? {
        Some(amount) if amount != 0.0 => Some(amount),
        _ => number(raw, &["Amount_USD__c"], "Amount_USD__c")?,
    };
    let arr = amount
        .map(Arr::from_amount)
        .transpose()
        .map_err(|e| invalid("Amount", e))?;
    let close_date = text(raw, &["CloseDate"]).and_then(parse_date);

    let industry = industry_from_name(&name);
    record.note("industry", &industry);

    record.extract("account_id", text(raw, &["AccountId"]).map(FieldValue::from));
    record.extract("opportunity_name", text(raw, &["Name"]).map(FieldValue::from));
    record.extract("probability", probability.map(FieldValue::Number));
    record.extract("amount", amount.map(FieldValue::Number));
    record.extract("currency", text(raw, &["CurrencyIsoCode"]).map(FieldValue::from));
    record.extract("close_date", close_date.map(FieldValue::Date));
    record.extract("owner", text(raw, &["Owner", "Name"]).map(FieldValue::from));
    record.extract("csm", text(raw, &["Opportunity_CSM__c"]).map(FieldValue::from));
    record.extract(
        "forecast_confidence",
        category.confidence().map(|c| FieldValue::Number(f64::from(c))),
    );

    record.api_version = text(raw, &["attributes", "url"]).and_then(api_version_from_url);
    record.modified_at = text(raw, &["LastModifiedDate"]).and_then(parse_datetime);
    record.update = CanonicalUpdate {
        name: Some(name),
        industry: None,
        industry_on_create: Some(industry.value),
        arr,
        renewal_date: close_date,
        products: products(raw.get("Products__c")),
        health: Some(HealthInput {
            status: Lifecycle::Unknown,
            stage: stage.lifecycle(),
            tenure_months: None,
            probability,
        }),
    };

    Ok(record)
}

/// Customer-health company record.
fn map_health(raw: &Value) -> RecordResult<SourceRecord> {
    let external_id = required_id(raw, &["Gsid"], "Gsid")?;
    let name = required_name(raw, &["Name"], "Name")?;
    let mut record = SourceRecord::new(SourceType::Health, external_id, name.clone(), raw);

    let status: AccountStatus = record.normalized("status", text(raw, &["Status"]));
    let stage: AccountStage = record.normalized("stage", text(raw, &["Stage"]));
    let industry: Normalized<Industry> = normalize(text(raw, &["Industry"]));
    record.note("industry", &industry);
    record.extract("industry", Some(FieldValue::from(industry.value.as_str())));

    let arr = number(raw, &["ARR"], "ARR")?
        .map(Arr::from_amount)
        .transpose()
        .map_err(|e| invalid("ARR", e))?;
    let renewal_date = date_value(raw.get("Renewal_Date"));
    let tenure_months = number(raw, &["Customer_Lifetime_in_Months"], "Customer_Lifetime_in_Months")?
        .map(|m| to_u32(m, "Customer_Lifetime_in_Months"))
        .transpose()?;

    record.extract("tenure_months", tenure_months.map(|m| FieldValue::Number(f64::from(m))));
    record.extract("employees", number(raw, &["Employees"], "Employees")?.map(FieldValue::Number));
    record.extract("csm_name", text(raw, &["csm__gr.name"]).map(FieldValue::from));
    record.extract("csm_email", text(raw, &["csm__gr.email"]).map(FieldValue::from));
    record.extract("renewal_date", renewal_date.map(FieldValue::Date));
    record.extract("parent_company_id", parent_company_id(raw.get("Parentcompany")));

    record.modified_at = raw.get("ModifiedDate").and_then(timestamp_value);
    record.dependent = health_metrics(raw)?.map(Dependent::Metrics);
    record.update = CanonicalUpdate {
        name: Some(name),
        // An absent label must not clobber a known industry.
        industry: (industry.outcome == Outcome::Mapped).then_some(industry.value),
        industry_on_create: Some(industry.value),
        arr,
        renewal_date,
        products: None,
        health: Some(HealthInput {
            status: status.lifecycle(),
            stage: stage.lifecycle(),
            tenure_months,
            probability: None,
        }),
    };

    Ok(record)
}

/// Call-intelligence call. Produces a meeting and never touches the
/// customer's own fields.
fn map_calls(raw: &Value) -> RecordResult<SourceRecord> {
    let external_id = required_id(raw, &["id"], "id")
        .or_else(|_| required_id(raw, &["callId"], "callId"))?;
    let name = required_name(raw, &["account", "name"], "account.name")?;
    let mut record = SourceRecord::new(SourceType::Calls, external_id, name, raw);

    let sentiment: Sentiment = record.normalized("sentiment", text(raw, &["sentiment"]));
    let started_at = text(raw, &["startedAt"]).and_then(parse_datetime);

    record.extract("call_id", text(raw, &["callId"]).map(FieldValue::from));
    record.extract("account_id", text(raw, &["account", "id"]).map(FieldValue::from));
    record.extract("direction", text(raw, &["direction"]).map(FieldValue::from));
    record.extract("duration_seconds", number(raw, &["duration"], "duration")?.map(FieldValue::Number));
    record.extract("deal_name", text(raw, &["deal", "name"]).map(FieldValue::from));
    record.extract("deal_stage", text(raw, &["deal", "stage"]).map(FieldValue::from));
    record.extract("deal_value", number(raw, &["deal", "value"], "deal.value")?.map(FieldValue::Number));

    record.modified_at = started_at;
    record.dependent = Some(Dependent::Meeting(MeetingDraft {
        date: started_at.map_or_else(|| Utc::now().date_naive(), |t| t.date_naive()),
        title: text(raw, &["title"]).unwrap_or("Untitled Meeting").to_string(),
        summary: text(raw, &["summary"]).unwrap_or_default().to_string(),
        participants: participants(raw.get("participants")),
        sentiment,
    }));

    Ok(record)
}

fn health_metrics(raw: &Value) -> RecordResult<Option<MetricsDraft>> {
    let Some(nps) = number(raw, &["NPS"], "NPS")? else {
        return Ok(None);
    };
    let trend: Normalized<UsageTrend> = normalize(text(raw, &["Usage_Trend"]));

    #[allow(clippy::cast_possible_truncation)]
    let nps = nps.round() as i32;
    if !(-100..=100).contains(&nps) {
        return Err(RecordError::InvalidField {
            field: "NPS",
            message: format!("{nps} is outside -100..=100"),
        });
    }

    let count = |field: &'static str| -> RecordResult<u32> {
        number(raw, &[field], field)?
            .map_or(Ok(0), |n| to_u32(n, field))
    };
    let percentage = |field: &'static str| -> RecordResult<f64> {
        let value = number(raw, &[field], field)?.unwrap_or(0.0);
        if (0.0..=100.0).contains(&value) {
            Ok(value)
        } else {
            Err(RecordError::InvalidField {
                field,
                message: format!("{value} is not a percentage"),
            })
        }
    };

    Ok(Some(MetricsDraft {
        nps,
        usage_trend: trend.value,
        active_users: count("Active_Users")?,
        renewal_rate: percentage("Renewal_Rate")?,
        seat_utilization: percentage("Seat_Utilization")?,
        response_limit: count("Response_Limit")?,
        response_used: count("Response_Used")?,
    }))
}

fn lookup<'a>(raw: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(raw, |value, key| value.get(key))
}

fn text<'a>(raw: &'a Value, path: &[&str]) -> Option<&'a str> {
    lookup(raw, path)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Numbers may arrive as JSON numbers or numeric strings.
fn number(raw: &Value, path: &[&str], field: &'static str) -> RecordResult<Option<f64>> {
    match lookup(raw, path) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s.trim().parse().map(Some).map_err(|_| RecordError::InvalidField {
            field,
            message: format!("{s:?} is not a number"),
        }),
        Some(other) => Err(RecordError::InvalidField {
            field,
            message: format!("expected a number, got {other}"),
        }),
    }
}

fn required_id(raw: &Value, path: &[&str], field: &'static str) -> RecordResult<String> {
    match lookup(raw, path) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(RecordError::MissingIdentifier(field)),
    }
}

fn required_name(raw: &Value, path: &[&str], field: &'static str) -> RecordResult<String> {
    text(raw, path)
        .map(str::to_string)
        .ok_or(RecordError::MissingName(field))
}

fn invalid(field: &'static str, err: crate::Error) -> RecordError {
    RecordError::InvalidField {
        field,
        message: err.to_string(),
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_u32(value: f64, field: &'static str) -> RecordResult<u32> {
    if value.is_finite() && value >= 0.0 && value <= f64::from(u32::MAX) {
        Ok(value.round() as u32)
    } else {
        Err(RecordError::InvalidField {
            field,
            message: format!("{value} is not a non-negative count"),
        })
    }
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    let date = value.split('T').next().unwrap_or(value);
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// RFC 3339, or the `+0000` offset form some APIs emit.
fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .map(|t| t.with_timezone(&Utc))
        .ok()
}

/// Epoch milliseconds or an ISO date/time string.
fn timestamp_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::String(s) => parse_datetime(s).or_else(|| {
            s.trim()
                .parse::<i64>()
                .ok()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        }),
        _ => None,
    }
}

fn date_value(value: Option<&Value>) -> Option<NaiveDate> {
    match value? {
        Value::String(s) => parse_date(s.trim()).or_else(|| timestamp_value(&Value::String(s.clone())).map(|t| t.date_naive())),
        other => timestamp_value(other).map(|t| t.date_naive()),
    }
}

/// `.../services/data/v58.0/sobjects/...` yields `v58.0`.
fn api_version_from_url(url: &str) -> Option<String> {
    let mut segments = url.split('/');
    segments.find(|s| *s == "data")?;
    segments
        .next()
        .filter(|v| v.starts_with('v'))
        .map(str::to_string)
}

/// A JSON list, or a `;`-separated multi-select string.
fn products(value: Option<&Value>) -> Option<Vec<String>> {
    let products: Vec<String> = match value? {
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Value::String(s) => s
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        _ => return None,
    };
    (!products.is_empty()).then_some(products)
}

fn participants(value: Option<&Value>) -> Vec<String> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s.clone()),
            Value::Object(_) => item
                .get("name")
                .or_else(|| item.get("emailAddress"))
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        })
        .collect()
}

fn parent_company_id(value: Option<&Value>) -> Option<FieldValue> {
    match value? {
        Value::Object(_) => value?
            .get("Gsid")
            .and_then(Value::as_str)
            .map(FieldValue::from),
        Value::String(s) if !s.trim().is_empty() => Some(FieldValue::from(s.trim())),
        _ => None,
    }
}
