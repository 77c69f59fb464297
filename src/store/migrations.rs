//! Schema versioning and migrations for the primary database.
//!
//! Forward-only migrations, applied inside one transaction guarded by an
//! advisory lock so two bridges starting together do not race.

use crate::error::{BridgeError, Result};
use sqlx::postgres::{PgConnection, PgPool};
use tracing::info;

const CURRENT_VERSION: i32 = 2;

/// Advisory lock key held while migrating.
const MIGRATION_LOCK_KEY: i64 = 0x5359_4e43_4252_4447;

/// Channel the insert trigger notifies on.
pub const NOTIFY_CHANNEL: &str = "sync_jobs_channel";

/// Runs all pending migrations on the database.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| BridgeError::persistence(format!("Failed to start migration: {e}")))?;

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(MIGRATION_LOCK_KEY)
        .execute(&mut *tx)
        .await
        .map_err(|e| BridgeError::persistence(format!("Failed to take migration lock: {e}")))?;

    ensure_schema_versions_table(&mut tx).await?;

    let current = get_current_version(&mut tx).await?;

    if current > CURRENT_VERSION {
        return Err(BridgeError::persistence(format!(
            "Database schema version ({}) is newer than supported version ({}). \
             Please upgrade sync-bridge to the latest version.",
            current, CURRENT_VERSION
        )));
    }

    if current < CURRENT_VERSION {
        info!(
            "Migrating primary database from version {} to {}",
            current, CURRENT_VERSION
        );
        for version in (current + 1)..=CURRENT_VERSION {
            run_migration(&mut tx, version).await?;
            record_version(&mut tx, version).await?;
            info!("Applied migration v{}", version);
        }
    }

    tx.commit()
        .await
        .map_err(|e| BridgeError::persistence(format!("Failed to commit migrations: {e}")))?;

    Ok(())
}

/// Returns the schema version recorded in the database.
pub async fn current_version(pool: &PgPool) -> Result<i32> {
    let mut conn = pool
        .acquire()
        .await
        .map_err(|e| BridgeError::persistence(format!("Failed to acquire connection: {e}")))?;
    ensure_schema_versions_table(&mut conn).await?;
    get_current_version(&mut conn).await
}

async fn ensure_schema_versions_table(conn: &mut PgConnection) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS bridge_schema_versions (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        BridgeError::persistence(format!(
            "Failed to create bridge_schema_versions table: {e}"
        ))
    })?;

    Ok(())
}

async fn get_current_version(conn: &mut PgConnection) -> Result<i32> {
    let version: Option<i32> =
        sqlx::query_scalar("SELECT MAX(version) FROM bridge_schema_versions")
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| {
                BridgeError::persistence(format!("Failed to get schema version: {e}"))
            })?;

    Ok(version.unwrap_or(0))
}

async fn record_version(conn: &mut PgConnection, version: i32) -> Result<()> {
    sqlx::query("INSERT INTO bridge_schema_versions (version) VALUES ($1)")
        .bind(version)
        .execute(&mut *conn)
        .await
        .map_err(|e| BridgeError::persistence(format!("Failed to record migration: {e}")))?;
    Ok(())
}

async fn run_migration(conn: &mut PgConnection, version: i32) -> Result<()> {
    let statements: &[(&str, &str)] = match version {
        1 => MIGRATION_V1,
        2 => MIGRATION_V2,
        _ => {
            return Err(BridgeError::persistence(format!(
                "Unknown migration version: {version}"
            )))
        }
    };

    for (what, sql) in statements {
        sqlx::query(sql)
            .execute(&mut *conn)
            .await
            .map_err(|e| BridgeError::persistence(format!("Failed to {what}: {e}")))?;
    }

    Ok(())
}

/// Migration v1: knowledge and job tables.
const MIGRATION_V1: &[(&str, &str)] = &[
    (
        "create ai_known_queries table",
        r#"
        CREATE TABLE IF NOT EXISTS ai_known_queries (
            name TEXT PRIMARY KEY,
            filename TEXT,
            raw_sql TEXT NOT NULL,
            explanation TEXT,
            business_domain TEXT,
            suggested_schema JSONB NOT NULL DEFAULT '[]'::jsonb,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    ),
    (
        "create sync_jobs table",
        r#"
        CREATE TABLE IF NOT EXISTS sync_jobs (
            id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            query_name TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'running', 'success', 'failed')),
            error_message TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    ),
    (
        "create sync_jobs status index",
        r#"
        CREATE INDEX IF NOT EXISTS idx_sync_jobs_status_created
        ON sync_jobs(status, created_at)
        "#,
    ),
];

/// Migration v2: notify listeners when a job is inserted.
const MIGRATION_V2: &[(&str, &str)] = &[
    (
        "create sync_jobs notify function",
        r#"
        CREATE OR REPLACE FUNCTION notify_sync_job() RETURNS trigger AS $$
        BEGIN
            PERFORM pg_notify('sync_jobs_channel', NEW.id::text);
            RETURN NEW;
        END;
        $$ LANGUAGE plpgsql
        "#,
    ),
    (
        "drop old sync_jobs notify trigger",
        "DROP TRIGGER IF EXISTS sync_jobs_notify ON sync_jobs",
    ),
    (
        "create sync_jobs notify trigger",
        r#"
        CREATE TRIGGER sync_jobs_notify
        AFTER INSERT ON sync_jobs
        FOR EACH ROW EXECUTE FUNCTION notify_sync_job()
        "#,
    ),
];
