//! Upstream ("Orange") schedule source contract and its adapters.

pub mod memory;

use async_trait::async_trait;
use roster_core::RawScheduleRow;
use roster_storage::{quote_ident, schedule_row_from_pg};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use thiserror::Error;

pub const CRATE_NAME: &str = "roster-adapters";

/// Where the employee table and the day-type routine live upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub schema: String,
    pub employee_table: String,
    pub proc_schema: String,
    pub day_type_proc: String,
    pub site_code: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            schema: "dbo".to_string(),
            employee_table: "it_mti_employee_database_tbl".to_string(),
            proc_schema: "dbo".to_string(),
            day_type_proc: "sp_it_get_day_type".to_string(),
            site_code: "MTI".to_string(),
        }
    }
}

impl UpstreamConfig {
    pub fn employee_qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.employee_table))
    }

    pub fn day_type_qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.proc_schema), quote_ident(&self.day_type_proc))
    }

    /// Employee rows joined with the day type resolved per employee for
    /// `($1 = site code, employee_id, now())`.
    pub fn fetch_sql(&self) -> String {
        format!(
            r#"
            SELECT e.employee_id::text     AS employee_id,
                   e.employee_name::text   AS employee_name,
                   e.gender::text          AS gender,
                   e.division::text        AS division,
                   e.department::text      AS department,
                   e.section::text         AS section,
                   e.supervisor_id::text   AS supervisor_id,
                   e.supervisor_name::text AS supervisor_name,
                   e.position_title::text  AS position_title,
                   e.grade_interval::text  AS grade_interval,
                   e.phone::text           AS phone,
                   dt.day_type::text       AS day_type,
                   dt.description::text    AS description,
                   to_char(dt.time_in, 'HH24:MI')  AS time_in,
                   to_char(dt.time_out, 'HH24:MI') AS time_out,
                   dt.next_day::text       AS next_day
              FROM {employee} AS e
             CROSS JOIN LATERAL {day_type}($1, e.employee_id, now()) AS dt
            "#,
            employee = self.employee_qualified(),
            day_type = self.day_type_qualified(),
        )
    }
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream query failed: {0}")]
    Query(#[from] sqlx::Error),
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    #[error("invalid upstream fixture: {0}")]
    Fixture(#[from] serde_json::Error),
}

/// Read-only view of the authoritative schedule source.
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    /// Short label for logs, e.g. `"dbo"."it_mti_employee_database_tbl"`.
    fn describe(&self) -> String;

    /// Whether the employee table or view is visible. Callers treat a
    /// negative or failed probe as advisory only.
    async fn source_exists(&self) -> Result<bool, UpstreamError>;

    /// One row per employee as of now. Not retried here.
    async fn fetch_rows(&self) -> Result<Vec<RawScheduleRow>, UpstreamError>;
}

#[derive(Debug, Clone)]
pub struct PgUpstreamSource {
    pool: PgPool,
    config: UpstreamConfig,
}

impl PgUpstreamSource {
    pub fn new(pool: PgPool, config: UpstreamConfig) -> Self {
        Self { pool, config }
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }
}

#[async_trait]
impl UpstreamSource for PgUpstreamSource {
    fn describe(&self) -> String {
        self.config.employee_qualified()
    }

    async fn source_exists(&self) -> Result<bool, UpstreamError> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
              FROM information_schema.tables
             WHERE table_schema::text = $1
               AND table_name::text = $2
            "#,
        )
        .bind(&self.config.schema)
        .bind(&self.config.employee_table)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn fetch_rows(&self) -> Result<Vec<RawScheduleRow>, UpstreamError> {
        let sql = self.config.fetch_sql();
        let rows = sqlx::query(&sql)
            .bind(&self.config.site_code)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| schedule_row_from_pg(row).map_err(UpstreamError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_points_at_orange_objects() {
        let config = UpstreamConfig::default();
        assert_eq!(
            config.employee_qualified(),
            "\"dbo\".\"it_mti_employee_database_tbl\""
        );
        assert_eq!(config.day_type_qualified(), "\"dbo\".\"sp_it_get_day_type\"");
        assert_eq!(config.site_code, "MTI");
    }

    #[test]
    fn fetch_sql_binds_site_code_and_quotes_overrides() {
        let config = UpstreamConfig {
            schema: "hr".into(),
            employee_table: "staff\"view".into(),
            proc_schema: "sched".into(),
            day_type_proc: "resolve_day".into(),
            site_code: "X'; DROP TABLE t; --".into(),
        };
        let sql = config.fetch_sql();
        assert!(sql.contains("FROM \"hr\".\"staff\"\"view\" AS e"));
        assert!(sql.contains("CROSS JOIN LATERAL \"sched\".\"resolve_day\"($1, e.employee_id, now())"));
        assert!(!sql.contains("DROP TABLE"));
        assert!(sql.contains("to_char(dt.time_out, 'HH24:MI')"));
    }
}
