//! Target schedule table, run log and settings persistence for roster sync.

pub mod memory;

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use roster_core::{
    ContentHash, LogPage, LogQuery, RawScheduleRow, ScheduleRecord, SyncLogEntry, SyncRun,
    SyncSettings, HASHED_FIELDS, SETTINGS_ID,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "roster-storage";

/// Schema migrations for the schedule table and both audit tables.
pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

/// Key column followed by the hashed columns, in hash order.
pub const SCHEDULE_COLUMNS: [&str; 16] = [
    "employee_id",
    HASHED_FIELDS[0],
    HASHED_FIELDS[1],
    HASHED_FIELDS[2],
    HASHED_FIELDS[3],
    HASHED_FIELDS[4],
    HASHED_FIELDS[5],
    HASHED_FIELDS[6],
    HASHED_FIELDS[7],
    HASHED_FIELDS[8],
    HASHED_FIELDS[9],
    HASHED_FIELDS[10],
    HASHED_FIELDS[11],
    HASHED_FIELDS[12],
    HASHED_FIELDS[13],
    HASHED_FIELDS[14],
];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub statement_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            statement_timeout: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

/// Opens a Postgres pool with a per-statement timeout applied to every session.
pub async fn connect_pool(database_url: &str, settings: PoolSettings) -> Result<PgPool, StoreError> {
    let timeout = format!("{}s", settings.statement_timeout.as_secs().max(1));
    let options = PgConnectOptions::from_str(database_url)?.options([("statement_timeout", timeout)]);
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections.max(1))
        .acquire_timeout(settings.acquire_timeout)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Double-quotes an identifier taken from configuration.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// `col::text AS col` for every schedule column. Shift times keep only
/// `HH:MI` so `time` and `varchar(5)` columns read back alike.
pub fn text_projection() -> String {
    SCHEDULE_COLUMNS
        .iter()
        .map(|column| match *column {
            "time_in" | "time_out" => format!("left({column}::text, 5) AS {column}"),
            _ => format!("{column}::text AS {column}"),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Reads one schedule row projected with every column as text.
pub fn schedule_row_from_pg(row: &PgRow) -> Result<RawScheduleRow, sqlx::Error> {
    Ok(RawScheduleRow {
        employee_id: row
            .try_get::<Option<String>, _>("employee_id")?
            .unwrap_or_default(),
        employee_name: row.try_get("employee_name")?,
        gender: row.try_get("gender")?,
        division: row.try_get("division")?,
        department: row.try_get("department")?,
        section: row.try_get("section")?,
        supervisor_id: row.try_get("supervisor_id")?,
        supervisor_name: row.try_get("supervisor_name")?,
        position_title: row.try_get("position_title")?,
        grade_interval: row.try_get("grade_interval")?,
        phone: row.try_get("phone")?,
        day_type: row.try_get("day_type")?,
        description: row.try_get("description")?,
        time_in: row.try_get("time_in")?,
        time_out: row.try_get("time_out")?,
        next_day: row.try_get("next_day")?,
    })
}

/// Parses a serialized detail list; corrupt or missing blobs read as empty.
pub fn parse_details<T: DeserializeOwned>(blob: Option<&str>) -> Vec<T> {
    let Some(text) = blob.map(str::trim).filter(|text| !text.is_empty()) else {
        return Vec::new();
    };
    match serde_json::from_str(text) {
        Ok(items) => items,
        Err(err) => {
            warn!(error = %err, "discarding unparseable run detail blob");
            Vec::new()
        }
    }
}

fn details_blob<T: Serialize>(items: &[T]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

fn db_count(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn count_from_db(value: i64) -> usize {
    usize::try_from(value).unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetTable {
    pub schema: String,
    pub table: String,
}

impl Default for TargetTable {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            table: "mti_users".to_string(),
        }
    }
}

impl TargetTable {
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    pub fn select_all_sql(&self) -> String {
        format!("SELECT {} FROM {}", text_projection(), self.qualified())
    }

    pub fn insert_sql(&self) -> String {
        let placeholders = (1..=SCHEDULE_COLUMNS.len())
            .map(|i| format!("${i}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES ({placeholders})",
            self.qualified(),
            SCHEDULE_COLUMNS.join(", ")
        )
    }

    pub fn update_sql(&self) -> String {
        let assignments = HASHED_FIELDS
            .iter()
            .enumerate()
            .map(|(i, column)| format!("{column} = ${}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "UPDATE {} SET {assignments} WHERE employee_id = $1",
            self.qualified()
        )
    }
}

/// Local rows keyed by employee id, with their content hashes derived once.
#[derive(Debug, Clone, Default)]
pub struct ExistingSchedules {
    records: HashMap<String, ScheduleRecord>,
    hashes: HashMap<String, ContentHash>,
}

impl ExistingSchedules {
    pub fn new(records: impl IntoIterator<Item = ScheduleRecord>) -> Self {
        let records = records
            .into_iter()
            .map(|record| (record.employee_id.clone(), record))
            .collect::<HashMap<_, _>>();
        let hashes = records
            .iter()
            .map(|(id, record)| (id.clone(), record.content_hash()))
            .collect();
        Self { records, hashes }
    }

    pub fn get(&self, employee_id: &str) -> Option<&ScheduleRecord> {
        self.records.get(employee_id)
    }

    pub fn hash_of(&self, employee_id: &str) -> Option<&ContentHash> {
        self.hashes.get(employee_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Read side and transaction factory for the local schedule table.
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn load_existing(&self) -> Result<ExistingSchedules, StoreError>;

    /// Maximum length of the `phone` column; 0 when unbounded or unknown.
    async fn phone_max_length(&self) -> Result<usize, StoreError>;

    async fn begin(&self) -> Result<Box<dyn ScheduleTransaction>, StoreError>;
}

/// Writes against the schedule table. Nothing is visible until `commit`.
#[async_trait]
pub trait ScheduleTransaction: Send {
    async fn exists(&mut self, employee_id: &str) -> Result<bool, StoreError>;
    async fn insert(&mut self, record: &ScheduleRecord) -> Result<(), StoreError>;
    async fn update(&mut self, record: &ScheduleRecord) -> Result<(), StoreError>;
    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
    async fn rollback(self: Box<Self>) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgScheduleRepository {
    pool: PgPool,
    table: TargetTable,
}

impl PgScheduleRepository {
    pub fn new(pool: PgPool, table: TargetTable) -> Self {
        Self { pool, table }
    }
}

#[async_trait]
impl ScheduleRepository for PgScheduleRepository {
    async fn load_existing(&self) -> Result<ExistingSchedules, StoreError> {
        let sql = self.table.select_all_sql();
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(ScheduleRecord::from_raw(&schedule_row_from_pg(row)?));
        }
        Ok(ExistingSchedules::new(records))
    }

    async fn phone_max_length(&self) -> Result<usize, StoreError> {
        let len = sqlx::query_scalar::<_, Option<i32>>(
            r#"
            SELECT character_maximum_length::int4
              FROM information_schema.columns
             WHERE table_schema::text = $1
               AND table_name::text = $2
               AND column_name::text = 'phone'
            "#,
        )
        .bind(&self.table.schema)
        .bind(&self.table.table)
        .fetch_optional(&self.pool)
        .await?
        .flatten();
        Ok(len.and_then(|n| usize::try_from(n).ok()).unwrap_or(0))
    }

    async fn begin(&self) -> Result<Box<dyn ScheduleTransaction>, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgScheduleTransaction {
            tx,
            table: self.table.clone(),
        }))
    }
}

pub struct PgScheduleTransaction {
    tx: Transaction<'static, Postgres>,
    table: TargetTable,
}

#[async_trait]
impl ScheduleTransaction for PgScheduleTransaction {
    async fn exists(&mut self, employee_id: &str) -> Result<bool, StoreError> {
        let sql = format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE employee_id = $1)",
            self.table.qualified()
        );
        let exists = sqlx::query_scalar::<_, bool>(&sql)
            .bind(employee_id)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(exists)
    }

    async fn insert(&mut self, record: &ScheduleRecord) -> Result<(), StoreError> {
        let sql = self.table.insert_sql();
        let mut query = sqlx::query(&sql).bind(record.employee_id.as_str());
        for value in record.hashed_values() {
            query = query.bind(value);
        }
        query.execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn update(&mut self, record: &ScheduleRecord) -> Result<(), StoreError> {
        let sql = self.table.update_sql();
        let mut query = sqlx::query(&sql).bind(record.employee_id.as_str());
        for value in record.hashed_values() {
            query = query.bind(value);
        }
        query.execute(&mut *self.tx).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let Self { tx, .. } = *self;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StoreError> {
        let Self { tx, .. } = *self;
        tx.rollback().await?;
        Ok(())
    }
}

/// Append-only history of sync runs.
#[async_trait]
pub trait RunLogStore: Send + Sync {
    /// Creates the backing table when absent. Safe to call on every access.
    async fn ensure_schema(&self) -> Result<(), StoreError>;
    async fn append(&self, run: &SyncRun) -> Result<i64, StoreError>;
    async fn latest(&self) -> Result<Option<SyncLogEntry>, StoreError>;
    async fn query(&self, query: LogQuery) -> Result<LogPage, StoreError>;
    async fn find_by_run_id(&self, run_id: Uuid) -> Result<Option<SyncLogEntry>, StoreError>;
}

const LOG_COLUMNS: &str = "id, run_id, run_at, total, updated, inserted, unchanged, success, error, \
                           details_updated, details_inserted, details_changes";

fn log_entry_from_row(row: &PgRow) -> Result<SyncLogEntry, sqlx::Error> {
    let details_updated: Option<String> = row.try_get("details_updated")?;
    let details_inserted: Option<String> = row.try_get("details_inserted")?;
    let details_changes: Option<String> = row.try_get("details_changes")?;
    Ok(SyncLogEntry {
        id: row.try_get("id")?,
        run: SyncRun {
            run_id: row.try_get("run_id")?,
            timestamp: row.try_get("run_at")?,
            total: count_from_db(row.try_get("total")?),
            updated: count_from_db(row.try_get("updated")?),
            inserted: count_from_db(row.try_get("inserted")?),
            unchanged: count_from_db(row.try_get("unchanged")?),
            details_updated: parse_details(details_updated.as_deref()),
            details_inserted: parse_details(details_inserted.as_deref()),
            changes: parse_details(details_changes.as_deref()),
            success: row.try_get("success")?,
            error: row.try_get("error")?,
        },
    })
}

#[derive(Debug, Clone)]
pub struct PgRunLogStore {
    pool: PgPool,
}

impl PgRunLogStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunLogStore for PgRunLogStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_logs (
                id               BIGSERIAL PRIMARY KEY,
                run_id           UUID NOT NULL,
                run_at           TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                total            BIGINT NOT NULL,
                updated          BIGINT NOT NULL,
                inserted         BIGINT NOT NULL,
                unchanged        BIGINT NOT NULL,
                success          BOOLEAN NOT NULL,
                error            TEXT NULL,
                details_updated  TEXT NULL,
                details_inserted TEXT NULL,
                details_changes  TEXT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS sync_logs_run_id_idx ON sync_logs (run_id)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append(&self, run: &SyncRun) -> Result<i64, StoreError> {
        self.ensure_schema().await?;
        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO sync_logs (
                run_id, run_at, total, updated, inserted, unchanged, success, error,
                details_updated, details_inserted, details_changes
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
            "#,
        )
        .bind(run.run_id)
        .bind(run.timestamp)
        .bind(db_count(run.total))
        .bind(db_count(run.updated))
        .bind(db_count(run.inserted))
        .bind(db_count(run.unchanged))
        .bind(run.success)
        .bind(run.error.as_deref())
        .bind(details_blob(&run.details_updated))
        .bind(details_blob(&run.details_inserted))
        .bind(details_blob(&run.changes))
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn latest(&self) -> Result<Option<SyncLogEntry>, StoreError> {
        self.ensure_schema().await?;
        let sql = format!("SELECT {LOG_COLUMNS} FROM sync_logs ORDER BY id DESC LIMIT 1");
        let row = sqlx::query(&sql).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(log_entry_from_row).transpose()?)
    }

    async fn query(&self, query: LogQuery) -> Result<LogPage, StoreError> {
        self.ensure_schema().await?;
        let query = query.normalized();
        let total = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM sync_logs WHERE (NOT $1 OR updated + inserted > 0)",
        )
        .bind(query.only_with_changes)
        .fetch_one(&self.pool)
        .await?;

        let sql = format!(
            r#"
            SELECT {LOG_COLUMNS}
              FROM sync_logs
             WHERE ($1::BIGINT IS NULL OR id < $1)
               AND (NOT $2 OR updated + inserted > 0)
             ORDER BY id DESC
             LIMIT $3 OFFSET $4
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(query.before_id)
            .bind(query.only_with_changes)
            .bind(i64::try_from(query.limit()).unwrap_or(i64::MAX))
            .bind(i64::try_from(query.offset()).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        let logs = rows
            .iter()
            .map(log_entry_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(LogPage::new(logs, query, u64::try_from(total).unwrap_or(0)))
    }

    async fn find_by_run_id(&self, run_id: Uuid) -> Result<Option<SyncLogEntry>, StoreError> {
        self.ensure_schema().await?;
        let sql = format!(
            "SELECT {LOG_COLUMNS} FROM sync_logs WHERE run_id = $1 ORDER BY id DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(log_entry_from_row).transpose()?)
    }
}

/// Persisted copy of the scheduler settings; authoritative across restarts.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Returns the stored settings, creating the row from `defaults` when absent.
    async fn load_or_init(&self, defaults: &SyncSettings) -> Result<SyncSettings, StoreError>;
    async fn save(&self, settings: &SyncSettings) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgSettingsStore {
    pool: PgPool,
}

impl PgSettingsStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_settings (
                id               INTEGER PRIMARY KEY,
                enabled          BOOLEAN NOT NULL DEFAULT TRUE,
                interval_minutes INTEGER NOT NULL DEFAULT 5,
                updated_at       TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for PgSettingsStore {
    async fn load_or_init(&self, defaults: &SyncSettings) -> Result<SyncSettings, StoreError> {
        self.ensure_schema().await?;
        let row = sqlx::query(
            "SELECT enabled, interval_minutes, updated_at FROM sync_settings WHERE id = $1",
        )
        .bind(SETTINGS_ID)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            sqlx::query(
                r#"
                INSERT INTO sync_settings (id, enabled, interval_minutes, updated_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (id) DO NOTHING
                "#,
            )
            .bind(SETTINGS_ID)
            .bind(defaults.enabled)
            .bind(i32::try_from(defaults.interval_minutes).unwrap_or(i32::MAX))
            .bind(defaults.updated_at)
            .execute(&self.pool)
            .await?;
            return Ok(defaults.clone());
        };

        let interval: i32 = row.try_get("interval_minutes")?;
        Ok(SyncSettings {
            enabled: row.try_get("enabled")?,
            interval_minutes: u32::try_from(interval)
                .ok()
                .filter(|minutes| *minutes > 0)
                .unwrap_or(defaults.interval_minutes),
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn save(&self, settings: &SyncSettings) -> Result<(), StoreError> {
        self.ensure_schema().await?;
        sqlx::query(
            r#"
            INSERT INTO sync_settings (id, enabled, interval_minutes, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
               SET enabled = EXCLUDED.enabled,
                   interval_minutes = EXCLUDED.interval_minutes,
                   updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(SETTINGS_ID)
        .bind(settings.enabled)
        .bind(i32::try_from(settings.interval_minutes).unwrap_or(i32::MAX))
        .bind(settings.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
