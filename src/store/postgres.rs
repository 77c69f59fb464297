//! PostgreSQL implementation of the bridge's stores.
//!
//! One `PgStore` serves the job table, the knowledge table and the destination
//! tables, all in the primary database.

use super::migrations;
use crate::config::PrimaryConfig;
use crate::error::{BridgeError, Result};
use crate::jobs::{JobFilter, JobStatus, JobStore, SyncJob};
use crate::knowledge::{KnowledgeStore, KnownQuery, SchemaColumn};
use crate::sink::{check_key_columns, keyed_records, quote_ident, ResultSink};
use crate::source::{QueryResult, RetryPolicy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Primary database store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

/// Raw database row for a sync job.
#[derive(Debug, FromRow)]
struct SyncJobRow {
    id: Uuid,
    query_name: String,
    status: String,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SyncJobRow> for SyncJob {
    type Error = BridgeError;

    fn try_from(row: SyncJobRow) -> Result<Self> {
        let status = JobStatus::parse(&row.status).ok_or_else(|| {
            BridgeError::persistence(format!(
                "Job {} has unknown status '{}'",
                row.id, row.status
            ))
        })?;

        Ok(Self {
            id: row.id,
            query_name: row.query_name,
            status,
            error_message: row.error_message,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Raw database row for a known query.
#[derive(Debug, FromRow)]
struct KnownQueryRow {
    name: String,
    raw_sql: String,
    filename: Option<String>,
    explanation: Option<String>,
    business_domain: Option<String>,
    suggested_schema: JsonValue,
}

impl From<KnownQueryRow> for KnownQuery {
    fn from(row: KnownQueryRow) -> Self {
        // Older rows may carry a schema in another shape; treat it as absent.
        let suggested_schema: Vec<SchemaColumn> =
            serde_json::from_value(row.suggested_schema).unwrap_or_default();

        Self {
            name: row.name,
            raw_query: row.raw_sql,
            suggested_schema,
            filename: row.filename,
            explanation: row.explanation,
            business_domain: row.business_domain,
        }
    }
}

const JOB_COLUMNS: &str = "id, query_name, status, error_message, created_at, updated_at";

impl PgStore {
    /// Connects to the primary database, retrying transient failures.
    pub async fn connect(config: &PrimaryConfig, retry: RetryPolicy) -> Result<Self> {
        let url = config.require_url()?;

        let mut last_error = None;
        let mut delay = retry.base_delay;
        let attempts = retry.attempts.max(1);

        for attempt in 1..=attempts {
            debug!("Primary connection attempt {} of {}", attempt, attempts);

            let result = PgPoolOptions::new()
                .max_connections(config.max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .connect(url)
                .await;

            match result {
                Ok(pool) => return Ok(Self { pool }),
                Err(e) => {
                    let is_transient = is_transient_error(&e);
                    last_error = Some(e);

                    if attempt < attempts && is_transient {
                        warn!(
                            "Primary connection attempt {} failed (transient error), retrying in {:?}",
                            attempt, delay
                        );
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    } else {
                        break;
                    }
                }
            }
        }

        Err(match last_error {
            Some(e) => map_connection_error(e, config),
            None => BridgeError::persistence("Failed to connect to primary database"),
        })
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Applies pending schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        migrations::run_migrations(&self.pool).await
    }

    /// Closes the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Whether `table_name` exists in the public schema.
    pub async fn table_exists(&self, table_name: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = 'public' AND table_name = $1
            )
            "#,
        )
        .bind(table_name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| BridgeError::sink(format!("Failed to look up table {table_name}: {e}")))?;

        Ok(exists)
    }

    /// Fetches primary key columns for a specific table.
    pub async fn fetch_primary_key(&self, table_name: &str) -> Result<Vec<String>> {
        let columns: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT kcu.column_name::text
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
            WHERE tc.table_schema = 'public'
                AND tc.table_name = $1
                AND tc.constraint_type = 'PRIMARY KEY'
            ORDER BY kcu.ordinal_position
            "#,
        )
        .bind(table_name)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            BridgeError::sink(format!("Failed to fetch primary key for {table_name}: {e}"))
        })?;

        Ok(columns)
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn insert_pending(&self, query_name: &str) -> Result<Uuid> {
        sqlx::query_scalar("INSERT INTO sync_jobs (query_name, status) VALUES ($1, 'pending') RETURNING id")
            .bind(query_name)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| BridgeError::persistence(format!("Failed to insert job: {e}")))
    }

    async fn claim(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs SET status = 'running', updated_at = now()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| BridgeError::persistence(format!("Failed to mark job {id} running: {e}")))?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_success(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs SET status = 'success', error_message = NULL, updated_at = now()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| BridgeError::persistence(format!("Failed to mark job {id} success: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(BridgeError::persistence(format!("Job {id} is not running")));
        }
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, message: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sync_jobs SET status = 'failed', error_message = $2, updated_at = now()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(message)
        .execute(&self.pool)
        .await
        .map_err(|e| BridgeError::persistence(format!("Failed to mark job {id} failed: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(BridgeError::persistence(format!("Job {id} is not running")));
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<SyncJob>> {
        let row: Option<SyncJobRow> =
            sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| BridgeError::persistence(format!("Failed to get job {id}: {e}")))?;

        row.map(SyncJob::try_from).transpose()
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<SyncJob>> {
        let mut query = format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE 1=1");
        let mut param = 0;

        if filter.status.is_some() {
            param += 1;
            query.push_str(&format!(" AND status = ${param}"));
        }
        if filter.query_name.is_some() {
            param += 1;
            query.push_str(&format!(" AND query_name = ${param}"));
        }

        query.push_str(" ORDER BY created_at ASC, id ASC");

        if filter.limit.is_some() {
            param += 1;
            query.push_str(&format!(" LIMIT ${param}"));
        }

        let mut sqlx_query = sqlx::query_as::<_, SyncJobRow>(&query);

        if let Some(status) = filter.status {
            sqlx_query = sqlx_query.bind(status.as_str());
        }
        if let Some(ref name) = filter.query_name {
            sqlx_query = sqlx_query.bind(name);
        }
        if let Some(limit) = filter.limit {
            sqlx_query = sqlx_query.bind(limit);
        }

        let rows = sqlx_query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| BridgeError::persistence(format!("Failed to list jobs: {e}")))?;

        rows.into_iter().map(SyncJob::try_from).collect()
    }
}

#[async_trait]
impl KnowledgeStore for PgStore {
    async fn lookup(&self, name: &str) -> Result<Option<KnownQuery>> {
        let row: Option<KnownQueryRow> = sqlx::query_as(
            r#"
            SELECT name, raw_sql, filename, explanation, business_domain, suggested_schema
            FROM ai_known_queries
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BridgeError::lookup(format!("Failed to look up query '{name}': {e}")))?;

        Ok(row.map(KnownQuery::from))
    }

    async fn upsert_query(&self, query: &KnownQuery) -> Result<()> {
        let schema = serde_json::to_value(&query.suggested_schema)
            .map_err(|e| BridgeError::internal(format!("Failed to encode schema: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO ai_known_queries
                (name, filename, raw_sql, explanation, business_domain, suggested_schema)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (name) DO UPDATE SET
                filename = EXCLUDED.filename,
                raw_sql = EXCLUDED.raw_sql,
                explanation = EXCLUDED.explanation,
                business_domain = EXCLUDED.business_domain,
                suggested_schema = EXCLUDED.suggested_schema,
                updated_at = now()
            "#,
        )
        .bind(&query.name)
        .bind(&query.filename)
        .bind(&query.raw_query)
        .bind(&query.explanation)
        .bind(&query.business_domain)
        .bind(schema)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            BridgeError::persistence(format!("Failed to save query '{}': {e}", query.name))
        })?;

        Ok(())
    }
}

#[async_trait]
impl ResultSink for PgStore {
    async fn upsert(
        &self,
        table: &str,
        rows: &QueryResult,
        key_columns: Option<&[String]>,
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        if !self.table_exists(table).await? {
            return Err(BridgeError::sink(format!(
                "Destination table {table} does not exist"
            )));
        }

        let keys = match key_columns {
            Some(keys) => keys.to_vec(),
            None => self.fetch_primary_key(table).await?,
        };
        check_key_columns(table, rows, &keys)?;

        let payload = JsonValue::Array(
            keyed_records(rows, &keys)
                .into_iter()
                .map(JsonValue::Object)
                .collect(),
        );
        let sql = build_upsert_sql(table, &rows.column_names(), &keys);

        let result = sqlx::query(&sql)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(|e| BridgeError::sink(format_db_error(e)))?;

        Ok(result.rows_affected())
    }
}

/// Builds a single-statement bulk upsert.
///
/// Rows arrive as one JSON array and are typed by the destination table's own
/// row type, so the database performs every cast.
pub fn build_upsert_sql(table: &str, columns: &[&str], keys: &[String]) -> String {
    let table_ident = quote_ident(table);
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let key_list = keys
        .iter()
        .map(|k| quote_ident(k))
        .collect::<Vec<_>>()
        .join(", ");

    let updates: Vec<String> = columns
        .iter()
        .filter(|c| !keys.iter().any(|k| k == *c))
        .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
        .collect();

    let on_conflict = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    format!(
        "INSERT INTO {table_ident} ({column_list}) \
         SELECT {column_list} FROM jsonb_populate_recordset(NULL::{table_ident}, $1::jsonb) \
         ON CONFLICT ({key_list}) {on_conflict}"
    )
}

/// Determines if an error is transient and worth retrying.
fn is_transient_error(error: &sqlx::Error) -> bool {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("password authentication failed")
        || error_str.contains("authentication failed")
        || error_str.contains("does not exist")
    {
        return false;
    }

    error_str.contains("connection refused")
        || error_str.contains("timed out")
        || error_str.contains("timeout")
        || error_str.contains("temporarily unavailable")
        || error_str.contains("connection reset")
        || error_str.contains("broken pipe")
}

/// Maps sqlx connection errors to operator-facing messages.
fn map_connection_error(error: sqlx::Error, config: &PrimaryConfig) -> BridgeError {
    let target = config.display_string();
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("connection refused") || error_str.contains("could not connect") {
        BridgeError::persistence(format!(
            "Cannot connect to primary database {target}. Check that the server is running."
        ))
    } else if error_str.contains("password authentication failed")
        || error_str.contains("authentication failed")
    {
        BridgeError::persistence(format!(
            "Authentication failed for primary database {target}. Check your credentials."
        ))
    } else if error_str.contains("timed out") || error_str.contains("timeout") {
        BridgeError::persistence(format!(
            "Connection to primary database {target} timed out."
        ))
    } else {
        BridgeError::persistence(error.to_string())
    }
}

/// Formats a database error with detail and constraint, if available.
fn format_db_error(error: sqlx::Error) -> String {
    let Some(db_error) = error.as_database_error() else {
        return error.to_string();
    };

    let mut result = db_error.message().to_string();

    if let Some(pg_error) = db_error.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
        if let Some(detail) = pg_error.detail() {
            result.push_str("\n  DETAIL: ");
            result.push_str(detail);
        }
        if let Some(constraint) = pg_error.constraint() {
            result.push_str("\n  CONSTRAINT: ");
            result.push_str(constraint);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_build_upsert_sql() {
        let sql = build_upsert_sql("dump_vendas_mes", &["id", "total"], &["id".to_string()]);
        assert_eq!(
            sql,
            "INSERT INTO \"dump_vendas_mes\" (\"id\", \"total\") \
             SELECT \"id\", \"total\" FROM jsonb_populate_recordset(NULL::\"dump_vendas_mes\", $1::jsonb) \
             ON CONFLICT (\"id\") DO UPDATE SET \"total\" = EXCLUDED.\"total\""
        );
    }

    #[test]
    fn test_build_upsert_sql_key_only_columns() {
        let sql = build_upsert_sql("dump_codes", &["code"], &["code".to_string()]);
        assert!(sql.ends_with("ON CONFLICT (\"code\") DO NOTHING"));
    }

    #[test]
    fn test_build_upsert_sql_composite_key() {
        let keys = vec!["loja".to_string(), "mes".to_string()];
        let sql = build_upsert_sql("dump_x", &["loja", "mes", "total"], &keys);
        assert!(sql.contains("ON CONFLICT (\"loja\", \"mes\")"));
        assert!(sql.contains("DO UPDATE SET \"total\" = EXCLUDED.\"total\""));
        assert!(!sql.contains("\"loja\" = EXCLUDED"));
    }

    #[test]
    fn test_job_row_with_unknown_status_is_rejected() {
        let now = Utc::now();
        let row = SyncJobRow {
            id: Uuid::new_v4(),
            query_name: "vendas_mes".to_string(),
            status: "paused".to_string(),
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        assert!(matches!(
            SyncJob::try_from(row),
            Err(BridgeError::Persistence(_))
        ));
    }

    #[test]
    fn test_known_query_row_tolerates_bad_schema() {
        let row = KnownQueryRow {
            name: "estoque".to_string(),
            raw_sql: "SELECT 1".to_string(),
            filename: None,
            explanation: None,
            business_domain: None,
            suggested_schema: serde_json::json!({"unexpected": true}),
        };
        let query = KnownQuery::from(row);
        assert!(query.suggested_schema.is_empty());
    }
}
