use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Executor, Pool, Sqlite, Transaction};
use uuid::Uuid;

use crate::{
    activity::{CustomerMetrics, Feedback, Meeting},
    customer::{Arr, Customer, SyncState},
    events::ReindexFailure,
    source::{ExtractedFields, FieldValue, SourceConnector, SourceMetadata, SourceType},
    sync::{RecordFailure, SyncSummary},
    Error, Result,
};

const INIT_SQL: &str = r"
CREATE TABLE IF NOT EXISTS customers (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    industry TEXT NOT NULL,
    arr_cents INTEGER NOT NULL CHECK (arr_cents >= 0),
    health_score TEXT NOT NULL,
    renewal_date TEXT NOT NULL,
    products TEXT NOT NULL,
    deal_synced_at TEXT,
    health_synced_at TEXT,
    calls_synced_at TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_customers_name ON customers(name);

CREATE TABLE IF NOT EXISTS source_metadata (
    id TEXT PRIMARY KEY,
    raw_payload TEXT NOT NULL,
    api_version TEXT,
    last_synced_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS source_metadata_fields (
    metadata_id TEXT NOT NULL REFERENCES source_metadata(id) ON DELETE CASCADE,
    key TEXT NOT NULL,
    value_type TEXT NOT NULL,
    text_value TEXT,
    number_value REAL,
    bool_value INTEGER,
    PRIMARY KEY (metadata_id, key)
);

CREATE INDEX IF NOT EXISTS idx_fields_text ON source_metadata_fields(key, text_value);
CREATE INDEX IF NOT EXISTS idx_fields_number ON source_metadata_fields(key, number_value);

CREATE TABLE IF NOT EXISTS source_connectors (
    id TEXT PRIMARY KEY,
    customer_id TEXT NOT NULL REFERENCES customers(id) ON DELETE CASCADE,
    source_type TEXT NOT NULL,
    external_id TEXT NOT NULL,
    metadata_id TEXT NOT NULL UNIQUE REFERENCES source_metadata(id),
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_connectors_active
    ON source_connectors(source_type, external_id) WHERE active = 1;
CREATE INDEX IF NOT EXISTS idx_connectors_customer ON source_connectors(customer_id, source_type);

CREATE TABLE IF NOT EXISTS customer_metrics (
    customer_id TEXT PRIMARY KEY REFERENCES customers(id) ON DELETE CASCADE,
    nps INTEGER NOT NULL,
    usage_trend TEXT NOT NULL,
    active_users INTEGER NOT NULL,
    renewal_rate REAL NOT NULL,
    seat_utilization REAL NOT NULL,
    response_limit INTEGER NOT NULL,
    response_used INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS feedback (
    id TEXT PRIMARY KEY,
    customer_id TEXT NOT NULL REFERENCES customers(id) ON DELETE CASCADE,
    title TEXT NOT NULL,
    status TEXT NOT NULL,
    description TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_feedback_customer ON feedback(customer_id, created_at);

CREATE TABLE IF NOT EXISTS meetings (
    id TEXT PRIMARY KEY,
    customer_id TEXT NOT NULL REFERENCES customers(id) ON DELETE CASCADE,
    connector_id TEXT UNIQUE REFERENCES source_connectors(id) ON DELETE CASCADE,
    meeting_date TEXT NOT NULL,
    title TEXT NOT NULL,
    summary TEXT NOT NULL,
    participants TEXT NOT NULL,
    sentiment TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_meetings_customer ON meetings(customer_id, meeting_date);

CREATE TABLE IF NOT EXISTS sync_runs (
    id TEXT PRIMARY KEY,
    source_type TEXT NOT NULL,
    status TEXT NOT NULL,
    synced INTEGER NOT NULL,
    failed INTEGER NOT NULL,
    created INTEGER NOT NULL,
    updated INTEGER NOT NULL,
    defaulted INTEGER NOT NULL,
    failures TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sync_runs_source ON sync_runs(source_type, started_at);

CREATE TABLE IF NOT EXISTS reindex_failures (
    id TEXT PRIMARY KEY,
    task_id TEXT NOT NULL,
    customer_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    attempts INTEGER NOT NULL,
    last_error TEXT NOT NULL,
    failed_at TEXT NOT NULL
);
";

const CUSTOMER_COLUMNS: &str = "id, name, industry, arr_cents, health_score, renewal_date, products, \
     deal_synced_at, health_synced_at, calls_synced_at, created_at, updated_at";

const CONNECTOR_COLUMNS: &str =
    "id, customer_id, source_type, external_id, metadata_id, active, created_at, updated_at";

type CustomerRow = (
    String,
    String,
    String,
    i64,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    String,
);

type ConnectorRow = (String, String, String, String, String, bool, String, String);

type FieldRow = (String, String, Option<String>, Option<f64>, Option<bool>);

type MetricsRow = (String, i64, String, i64, f64, f64, i64, i64, String);

type FeedbackRow = (String, String, String, String, String, String, String);

type MeetingRow = (
    String,
    String,
    Option<String>,
    String,
    String,
    String,
    String,
    String,
    String,
);

type SyncRunRow = (
    String,
    String,
    String,
    i64,
    i64,
    i64,
    i64,
    i64,
    String,
    String,
    String,
);

type FailureRow = (String, String, String, String, i64, String, String);

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn open(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(INIT_SQL).execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Single-connection in-memory store. The connection is never recycled,
    /// since closing it would drop the database.
    pub async fn open_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        sqlx::query(INIT_SQL).execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Starts a write unit. Nothing else may touch the pool until the
    /// returned handle is committed or dropped when the pool has a single
    /// connection.
    pub async fn transaction(&self) -> Result<StorageTx> {
        Ok(StorageTx {
            tx: self.pool.begin().await?,
        })
    }

    // Customer operations

    pub async fn get_customer(&self, id: Uuid) -> Result<Customer> {
        self.find_customer(id)
            .await?
            .ok_or(Error::CustomerNotFound(id))
    }

    pub async fn find_customer(&self, id: Uuid) -> Result<Option<Customer>> {
        select_customer(&self.pool, id).await
    }

    /// Keyset page of customers ordered by id.
    pub async fn list_customers_after(
        &self,
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<Customer>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let sql = format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers WHERE id > ? ORDER BY id LIMIT ?"
        );
        let rows: Vec<CustomerRow> = sqlx::query_as(&sql)
            .bind(after.map(|id| id.to_string()).unwrap_or_default())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(parse_customer_row).collect()
    }

    pub async fn count_customers(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM customers")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    // Connector and metadata operations

    pub async fn count_connectors(&self) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM source_connectors WHERE active = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn count_metadata(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM source_metadata")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn list_connectors(&self, source: Option<SourceType>) -> Result<Vec<SourceConnector>> {
        let rows: Vec<ConnectorRow> = match source {
            Some(source) => {
                let sql = format!(
                    "SELECT {CONNECTOR_COLUMNS} FROM source_connectors WHERE source_type = ? ORDER BY id"
                );
                sqlx::query_as(&sql)
                    .bind(source.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                let sql = format!("SELECT {CONNECTOR_COLUMNS} FROM source_connectors ORDER BY id");
                sqlx::query_as(&sql).fetch_all(&self.pool).await?
            }
        };

        rows.into_iter().map(parse_connector_row).collect()
    }

    pub async fn connectors_for_customer(&self, customer_id: Uuid) -> Result<Vec<SourceConnector>> {
        let sql = format!(
            "SELECT {CONNECTOR_COLUMNS} FROM source_connectors WHERE customer_id = ? ORDER BY source_type, id"
        );
        let rows: Vec<ConnectorRow> = sqlx::query_as(&sql)
            .bind(customer_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(parse_connector_row).collect()
    }

    pub async fn get_metadata(&self, id: Uuid) -> Result<SourceMetadata> {
        let row: (String, String, Option<String>, String) = sqlx::query_as(
            "SELECT id, raw_payload, api_version, last_synced_at FROM source_metadata WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::corrupt("metadata_id", id.to_string()))?;

        let fields: Vec<FieldRow> = sqlx::query_as(
            r"
            SELECT key, value_type, text_value, number_value, bool_value
            FROM source_metadata_fields WHERE metadata_id = ?
            ",
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await?;

        let (id, raw_payload, api_version, last_synced_at) = row;
        Ok(SourceMetadata {
            id: parse_uuid("metadata_id", &id)?,
            raw_payload: serde_json::from_str(&raw_payload)?,
            extracted: fields
                .into_iter()
                .map(parse_field_row)
                .collect::<Result<ExtractedFields>>()?,
            api_version,
            last_synced_at: parse_timestamp("last_synced_at", &last_synced_at)?,
        })
    }

    /// Active connectors of one source whose extracted `key` equals `value`.
    pub async fn find_connectors_by_field(
        &self,
        source: SourceType,
        key: &str,
        value: &FieldValue,
    ) -> Result<Vec<SourceConnector>> {
        let column = match value {
            FieldValue::Text(_) | FieldValue::Date(_) => "text_value",
            FieldValue::Number(_) => "number_value",
            FieldValue::Bool(_) => "bool_value",
        };
        let sql = format!(
            r"
            SELECT c.id, c.customer_id, c.source_type, c.external_id, c.metadata_id, c.active,
                   c.created_at, c.updated_at
            FROM source_connectors c
            JOIN source_metadata_fields f ON f.metadata_id = c.metadata_id
            WHERE c.source_type = ? AND c.active = 1 AND f.key = ? AND f.value_type = ? AND f.{column} = ?
            ORDER BY c.id
            "
        );
        let query = sqlx::query_as(&sql)
            .bind(source.as_str())
            .bind(key)
            .bind(value.kind());
        let query = match value {
            FieldValue::Text(s) => query.bind(s.clone()),
            FieldValue::Number(n) => query.bind(*n),
            FieldValue::Bool(b) => query.bind(*b),
            FieldValue::Date(d) => query.bind(d.to_string()),
        };
        let rows: Vec<ConnectorRow> = query.fetch_all(&self.pool).await?;

        rows.into_iter().map(parse_connector_row).collect()
    }

    // Dependent records

    pub async fn get_metrics(&self, customer_id: Uuid) -> Result<Option<CustomerMetrics>> {
        let row: Option<MetricsRow> = sqlx::query_as(
            r"
            SELECT customer_id, nps, usage_trend, active_users, renewal_rate, seat_utilization,
                   response_limit, response_used, updated_at
            FROM customer_metrics WHERE customer_id = ?
            ",
        )
        .bind(customer_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(parse_metrics_row).transpose()
    }

    pub async fn upsert_metrics(&self, metrics: &CustomerMetrics) -> Result<()> {
        write_metrics(&self.pool, metrics).await
    }

    pub async fn insert_feedback(&self, feedback: &Feedback) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO feedback (id, customer_id, title, status, description, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(feedback.id.to_string())
        .bind(feedback.customer_id.to_string())
        .bind(&feedback.title)
        .bind(feedback.status.as_str())
        .bind(&feedback.description)
        .bind(feedback.created_at.to_rfc3339())
        .bind(feedback.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Newest first.
    pub async fn recent_feedback(&self, customer_id: Uuid, limit: usize) -> Result<Vec<Feedback>> {
        let rows: Vec<FeedbackRow> = sqlx::query_as(
            r"
            SELECT id, customer_id, title, status, description, created_at, updated_at
            FROM feedback WHERE customer_id = ?
            ORDER BY created_at DESC, id DESC LIMIT ?
            ",
        )
        .bind(customer_id.to_string())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parse_feedback_row).collect()
    }

    pub async fn upsert_meeting(&self, meeting: &Meeting) -> Result<()> {
        write_meeting(&self.pool, meeting).await
    }

    /// Newest first.
    pub async fn recent_meetings(&self, customer_id: Uuid, limit: usize) -> Result<Vec<Meeting>> {
        let rows: Vec<MeetingRow> = sqlx::query_as(
            r"
            SELECT id, customer_id, connector_id, meeting_date, title, summary, participants,
                   sentiment, created_at
            FROM meetings WHERE customer_id = ?
            ORDER BY meeting_date DESC, created_at DESC LIMIT ?
            ",
        )
        .bind(customer_id.to_string())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parse_meeting_row).collect()
    }

    // Operational records

    pub async fn insert_sync_run(&self, run: &SyncSummary) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO sync_runs (id, source_type, status, synced, failed, created, updated,
                                   defaulted, failures, started_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(run.id.to_string())
        .bind(run.source.as_str())
        .bind(run.status.as_str())
        .bind(count_to_i64(run.synced))
        .bind(count_to_i64(run.failed))
        .bind(count_to_i64(run.created))
        .bind(count_to_i64(run.updated))
        .bind(count_to_i64(run.defaulted))
        .bind(serde_json::to_string(&run.failures)?)
        .bind(run.started_at.to_rfc3339())
        .bind(run.finished_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Newest first.
    pub async fn recent_sync_runs(
        &self,
        source: Option<SourceType>,
        limit: usize,
    ) -> Result<Vec<SyncSummary>> {
        let rows: Vec<SyncRunRow> = sqlx::query_as(
            r"
            SELECT id, source_type, status, synced, failed, created, updated, defaulted, failures,
                   started_at, finished_at
            FROM sync_runs WHERE (? IS NULL OR source_type = ?)
            ORDER BY started_at DESC LIMIT ?
            ",
        )
        .bind(source.map(|s| s.as_str()))
        .bind(source.map(|s| s.as_str()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parse_sync_run_row).collect()
    }

    pub async fn insert_reindex_failure(&self, failure: &ReindexFailure) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO reindex_failures (id, task_id, customer_id, kind, attempts, last_error, failed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(failure.id.to_string())
        .bind(failure.task_id.to_string())
        .bind(failure.customer_id.to_string())
        .bind(failure.kind.as_str())
        .bind(i64::from(failure.attempts))
        .bind(&failure.last_error)
        .bind(failure.failed_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Newest first.
    pub async fn reindex_failures(&self, limit: usize) -> Result<Vec<ReindexFailure>> {
        let rows: Vec<FailureRow> = sqlx::query_as(
            r"
            SELECT id, task_id, customer_id, kind, attempts, last_error, failed_at
            FROM reindex_failures ORDER BY failed_at DESC, id DESC LIMIT ?
            ",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parse_failure_row).collect()
    }

    /// Deletes every customer and everything hanging off it. Returns the ids
    /// that existed so the caller can propagate the deletions.
    pub async fn wipe_all(&self) -> Result<Vec<Uuid>> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<(String,)> = sqlx::query_as("SELECT id FROM customers ORDER BY id")
            .fetch_all(&mut *tx)
            .await?;

        for table in [
            "meetings",
            "feedback",
            "customer_metrics",
            "source_connectors",
            "source_metadata_fields",
            "source_metadata",
            "customers",
        ] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        ids.into_iter()
            .map(|(id,)| parse_uuid("customer_id", &id))
            .collect()
    }
}

/// One record's write unit. All reads used for identity resolution go
/// through here so they see the same state as the write.
pub struct StorageTx {
    tx: Transaction<'static, Sqlite>,
}

impl StorageTx {
    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    pub async fn find_active_connector(
        &mut self,
        source: SourceType,
        external_id: &str,
    ) -> Result<Option<SourceConnector>> {
        let sql = format!(
            "SELECT {CONNECTOR_COLUMNS} FROM source_connectors WHERE source_type = ? AND external_id = ? AND active = 1"
        );
        let row: Option<ConnectorRow> = sqlx::query_as(&sql)
            .bind(source.as_str())
            .bind(external_id)
            .fetch_optional(&mut *self.tx)
            .await?;

        row.map(parse_connector_row).transpose()
    }

    pub async fn get_customer(&mut self, id: Uuid) -> Result<Customer> {
        select_customer(&mut *self.tx, id)
            .await?
            .ok_or(Error::CustomerNotFound(id))
    }

    /// Exact, case-sensitive name match.
    pub async fn customers_by_name(&mut self, name: &str) -> Result<Vec<Customer>> {
        let sql = format!("SELECT {CUSTOMER_COLUMNS} FROM customers WHERE name = ? ORDER BY id");
        let rows: Vec<CustomerRow> = sqlx::query_as(&sql)
            .bind(name)
            .fetch_all(&mut *self.tx)
            .await?;

        rows.into_iter().map(parse_customer_row).collect()
    }

    pub async fn customer_names(&mut self) -> Result<Vec<(Uuid, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT id, name FROM customers")
            .fetch_all(&mut *self.tx)
            .await?;

        rows.into_iter()
            .map(|(id, name)| Ok((parse_uuid("customer_id", &id)?, name)))
            .collect()
    }

    /// Active connectors of `source` attached to the customer.
    pub async fn source_record_count(&mut self, customer_id: Uuid, source: SourceType) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM source_connectors WHERE customer_id = ? AND source_type = ? AND active = 1",
        )
        .bind(customer_id.to_string())
        .bind(source.as_str())
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(count)
    }

    pub async fn insert_customer(&mut self, customer: &Customer) -> Result<()> {
        let sql = format!(
            "INSERT INTO customers ({CUSTOMER_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        sqlx::query(&sql)
            .bind(customer.id.to_string())
            .bind(&customer.name)
            .bind(customer.industry.as_str())
            .bind(customer.arr.cents())
            .bind(customer.health_score.as_str())
            .bind(customer.renewal_date.to_string())
            .bind(serde_json::to_string(&customer.products)?)
            .bind(customer.sync.deal.map(|t| t.to_rfc3339()))
            .bind(customer.sync.health.map(|t| t.to_rfc3339()))
            .bind(customer.sync.calls.map(|t| t.to_rfc3339()))
            .bind(customer.created_at.to_rfc3339())
            .bind(customer.updated_at.to_rfc3339())
            .execute(&mut *self.tx)
            .await?;

        Ok(())
    }

    pub async fn update_customer(&mut self, customer: &Customer) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE customers
            SET name = ?, industry = ?, arr_cents = ?, health_score = ?, renewal_date = ?,
                products = ?, deal_synced_at = ?, health_synced_at = ?, calls_synced_at = ?,
                updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(&customer.name)
        .bind(customer.industry.as_str())
        .bind(customer.arr.cents())
        .bind(customer.health_score.as_str())
        .bind(customer.renewal_date.to_string())
        .bind(serde_json::to_string(&customer.products)?)
        .bind(customer.sync.deal.map(|t| t.to_rfc3339()))
        .bind(customer.sync.health.map(|t| t.to_rfc3339()))
        .bind(customer.sync.calls.map(|t| t.to_rfc3339()))
        .bind(customer.updated_at.to_rfc3339())
        .bind(customer.id.to_string())
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::CustomerNotFound(customer.id));
        }

        Ok(())
    }

    pub async fn insert_connector(
        &mut self,
        connector: &SourceConnector,
        metadata: &SourceMetadata,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO source_metadata (id, raw_payload, api_version, last_synced_at) VALUES (?, ?, ?, ?)",
        )
        .bind(metadata.id.to_string())
        .bind(serde_json::to_string(&metadata.raw_payload)?)
        .bind(&metadata.api_version)
        .bind(metadata.last_synced_at.to_rfc3339())
        .execute(&mut *self.tx)
        .await?;

        self.write_fields(metadata).await?;

        let sql = format!(
            "INSERT INTO source_connectors ({CONNECTOR_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
        );
        sqlx::query(&sql)
            .bind(connector.id.to_string())
            .bind(connector.customer_id.to_string())
            .bind(connector.source_type.as_str())
            .bind(&connector.external_id)
            .bind(connector.metadata_id.to_string())
            .bind(connector.active)
            .bind(connector.created_at.to_rfc3339())
            .bind(connector.updated_at.to_rfc3339())
            .execute(&mut *self.tx)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(ref db_err) = e {
                    if db_err.is_unique_violation() {
                        return Error::IdentityConflict {
                            source_type: connector.source_type,
                            external_id: connector.external_id.clone(),
                        };
                    }
                }
                Error::Database(e)
            })?;

        Ok(())
    }

    /// Overwrites the payload, extracted fields and sync time of an existing
    /// connector's metadata row.
    pub async fn update_connector(
        &mut self,
        connector: &SourceConnector,
        metadata: &SourceMetadata,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE source_metadata SET raw_payload = ?, api_version = ?, last_synced_at = ? WHERE id = ?",
        )
        .bind(serde_json::to_string(&metadata.raw_payload)?)
        .bind(&metadata.api_version)
        .bind(metadata.last_synced_at.to_rfc3339())
        .bind(connector.metadata_id.to_string())
        .execute(&mut *self.tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::ConnectorNotFound(connector.id));
        }

        sqlx::query("DELETE FROM source_metadata_fields WHERE metadata_id = ?")
            .bind(connector.metadata_id.to_string())
            .execute(&mut *self.tx)
            .await?;
        self.write_fields(&SourceMetadata {
            id: connector.metadata_id,
            ..metadata.clone()
        })
        .await?;

        sqlx::query("UPDATE source_connectors SET customer_id = ?, updated_at = ? WHERE id = ?")
            .bind(connector.customer_id.to_string())
            .bind(connector.updated_at.to_rfc3339())
            .bind(connector.id.to_string())
            .execute(&mut *self.tx)
            .await?;

        Ok(())
    }

    pub async fn upsert_metrics(&mut self, metrics: &CustomerMetrics) -> Result<()> {
        write_metrics(&mut *self.tx, metrics).await
    }

    pub async fn upsert_meeting(&mut self, meeting: &Meeting) -> Result<()> {
        write_meeting(&mut *self.tx, meeting).await
    }

    async fn write_fields(&mut self, metadata: &SourceMetadata) -> Result<()> {
        for (key, value) in &metadata.extracted {
            let (text, number, flag) = match value {
                FieldValue::Text(s) => (Some(s.clone()), None, None),
                FieldValue::Number(n) => (None, Some(*n), None),
                FieldValue::Bool(b) => (None, None, Some(*b)),
                FieldValue::Date(d) => (Some(d.to_string()), None, None),
            };

            sqlx::query(
                r"
                INSERT INTO source_metadata_fields (metadata_id, key, value_type, text_value, number_value, bool_value)
                VALUES (?, ?, ?, ?, ?, ?)
                ",
            )
            .bind(metadata.id.to_string())
            .bind(key)
            .bind(value.kind())
            .bind(text)
            .bind(number)
            .bind(flag)
            .execute(&mut *self.tx)
            .await?;
        }

        Ok(())
    }
}

async fn select_customer<'e, E>(executor: E, id: Uuid) -> Result<Option<Customer>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {CUSTOMER_COLUMNS} FROM customers WHERE id = ?");
    let row: Option<CustomerRow> = sqlx::query_as(&sql)
        .bind(id.to_string())
        .fetch_optional(executor)
        .await?;

    row.map(parse_customer_row).transpose()
}

async fn write_metrics<'e, E>(executor: E, metrics: &CustomerMetrics) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r"
        INSERT INTO customer_metrics (customer_id, nps, usage_trend, active_users, renewal_rate,
                                      seat_utilization, response_limit, response_used, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(customer_id) DO UPDATE SET
            nps = excluded.nps,
            usage_trend = excluded.usage_trend,
            active_users = excluded.active_users,
            renewal_rate = excluded.renewal_rate,
            seat_utilization = excluded.seat_utilization,
            response_limit = excluded.response_limit,
            response_used = excluded.response_used,
            updated_at = excluded.updated_at
        ",
    )
    .bind(metrics.customer_id.to_string())
    .bind(metrics.nps)
    .bind(metrics.usage_trend.as_str())
    .bind(i64::from(metrics.active_users))
    .bind(metrics.renewal_rate)
    .bind(metrics.seat_utilization)
    .bind(i64::from(metrics.response_limit))
    .bind(i64::from(metrics.response_used))
    .bind(metrics.updated_at.to_rfc3339())
    .execute(executor)
    .await?;

    Ok(())
}

/// Meetings owned by a connector are replaced in place; manual meetings
/// (no connector) are always inserted.
async fn write_meeting<'e, E>(executor: E, meeting: &Meeting) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r"
        INSERT INTO meetings (id, customer_id, connector_id, meeting_date, title, summary,
                              participants, sentiment, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(connector_id) DO UPDATE SET
            customer_id = excluded.customer_id,
            meeting_date = excluded.meeting_date,
            title = excluded.title,
            summary = excluded.summary,
            participants = excluded.participants,
            sentiment = excluded.sentiment
        ",
    )
    .bind(meeting.id.to_string())
    .bind(meeting.customer_id.to_string())
    .bind(meeting.connector_id.map(|id| id.to_string()))
    .bind(meeting.date.to_string())
    .bind(&meeting.title)
    .bind(&meeting.summary)
    .bind(serde_json::to_string(&meeting.participants)?)
    .bind(meeting.sentiment.as_str())
    .bind(meeting.created_at.to_rfc3339())
    .execute(executor)
    .await?;

    Ok(())
}

fn count_to_i64(count: usize) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

fn parse_uuid(field: &'static str, value: &str) -> Result<Uuid> {
    value.parse().map_err(|_| Error::corrupt(field, value))
}

fn parse_timestamp(field: &'static str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| Error::corrupt(field, value))
}

fn parse_optional_timestamp(
    field: &'static str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_timestamp(field, &v)).transpose()
}

fn parse_date(field: &'static str, value: &str) -> Result<NaiveDate> {
    value.parse().map_err(|_| Error::corrupt(field, value))
}

fn parse_u32(field: &'static str, value: i64) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::corrupt(field, value.to_string()))
}

fn parse_count(field: &'static str, value: i64) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::corrupt(field, value.to_string()))
}

fn parse_customer_row(row: CustomerRow) -> Result<Customer> {
    let (
        id,
        name,
        industry,
        arr_cents,
        health_score,
        renewal_date,
        products,
        deal_synced_at,
        health_synced_at,
        calls_synced_at,
        created_at,
        updated_at,
    ) = row;

    Ok(Customer {
        id: parse_uuid("customer_id", &id)?,
        name,
        industry: industry.parse()?,
        arr: Arr::from_cents(arr_cents)?,
        health_score: health_score.parse()?,
        renewal_date: parse_date("renewal_date", &renewal_date)?,
        products: serde_json::from_str(&products)?,
        sync: SyncState {
            deal: parse_optional_timestamp("deal_synced_at", deal_synced_at)?,
            health: parse_optional_timestamp("health_synced_at", health_synced_at)?,
            calls: parse_optional_timestamp("calls_synced_at", calls_synced_at)?,
        },
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

fn parse_connector_row(row: ConnectorRow) -> Result<SourceConnector> {
    let (id, customer_id, source_type, external_id, metadata_id, active, created_at, updated_at) =
        row;

    Ok(SourceConnector {
        id: parse_uuid("connector_id", &id)?,
        customer_id: parse_uuid("customer_id", &customer_id)?,
        source_type: source_type.parse()?,
        external_id,
        metadata_id: parse_uuid("metadata_id", &metadata_id)?,
        active,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

fn parse_field_row(row: FieldRow) -> Result<(String, FieldValue)> {
    let (key, value_type, text, number, flag) = row;

    let value = match (value_type.as_str(), text, number, flag) {
        ("text", Some(s), _, _) => FieldValue::Text(s),
        ("date", Some(s), _, _) => FieldValue::Date(parse_date("field_value", &s)?),
        ("number", _, Some(n), _) => FieldValue::Number(n),
        ("bool", _, _, Some(b)) => FieldValue::Bool(b),
        _ => return Err(Error::corrupt("value_type", value_type)),
    };

    Ok((key, value))
}

fn parse_metrics_row(row: MetricsRow) -> Result<CustomerMetrics> {
    let (
        customer_id,
        nps,
        usage_trend,
        active_users,
        renewal_rate,
        seat_utilization,
        response_limit,
        response_used,
        updated_at,
    ) = row;

    Ok(CustomerMetrics {
        customer_id: parse_uuid("customer_id", &customer_id)?,
        nps: i32::try_from(nps).map_err(|_| Error::corrupt("nps", nps.to_string()))?,
        usage_trend: usage_trend.parse()?,
        active_users: parse_u32("active_users", active_users)?,
        renewal_rate,
        seat_utilization,
        response_limit: parse_u32("response_limit", response_limit)?,
        response_used: parse_u32("response_used", response_used)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

fn parse_feedback_row(row: FeedbackRow) -> Result<Feedback> {
    let (id, customer_id, title, status, description, created_at, updated_at) = row;

    Ok(Feedback {
        id: parse_uuid("feedback_id", &id)?,
        customer_id: parse_uuid("customer_id", &customer_id)?,
        title,
        status: status.parse()?,
        description,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

fn parse_meeting_row(row: MeetingRow) -> Result<Meeting> {
    let (id, customer_id, connector_id, date, title, summary, participants, sentiment, created_at) =
        row;

    Ok(Meeting {
        id: parse_uuid("meeting_id", &id)?,
        customer_id: parse_uuid("customer_id", &customer_id)?,
        connector_id: connector_id
            .map(|c| parse_uuid("connector_id", &c))
            .transpose()?,
        date: parse_date("meeting_date", &date)?,
        title,
        summary,
        participants: serde_json::from_str(&participants)?,
        sentiment: sentiment.parse()?,
        created_at: parse_timestamp("created_at", &created_at)?,
    })
}

fn parse_sync_run_row(row: SyncRunRow) -> Result<SyncSummary> {
    let (
        id,
        source_type,
        status,
        synced,
        failed,
        created,
        updated,
        defaulted,
        failures,
        started_at,
        finished_at,
    ) = row;

    Ok(SyncSummary {
        id: parse_uuid("sync_run_id", &id)?,
        source: source_type.parse()?,
        status: status.parse()?,
        synced: parse_count("synced", synced)?,
        failed: parse_count("failed", failed)?,
        created: parse_count("created", created)?,
        updated: parse_count("updated", updated)?,
        defaulted: parse_count("defaulted", defaulted)?,
        failures: serde_json::from_str::<Vec<RecordFailure>>(&failures)?,
        started_at: parse_timestamp("started_at", &started_at)?,
        finished_at: parse_timestamp("finished_at", &finished_at)?,
    })
}

fn parse_failure_row(row: FailureRow) -> Result<ReindexFailure> {
    let (id, task_id, customer_id, kind, attempts, last_error, failed_at) = row;

    Ok(ReindexFailure {
        id: parse_uuid("failure_id", &id)?,
        task_id: parse_uuid("task_id", &task_id)?,
        customer_id: parse_uuid("customer_id", &customer_id)?,
        kind: kind.parse()?,
        attempts: parse_u32("attempts", attempts)?,
        last_error,
        failed_at: parse_timestamp("failed_at", &failed_at)?,
    })
}
