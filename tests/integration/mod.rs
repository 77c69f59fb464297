//! Integration tests against a live primary database.
//!
//! Tests needing PostgreSQL skip themselves when DATABASE_URL is not set.

pub mod bridge_test;
pub mod connection_test;
pub mod store_test;

use sync_bridge::config::PrimaryConfig;
use sync_bridge::source::RetryPolicy;
use sync_bridge::store::PgStore;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Serializes tests sharing the database; a runner in one test would
/// otherwise pick up jobs another test is inspecting.
fn db_lock() -> Arc<Mutex<()>> {
    static LOCK: OnceLock<Arc<Mutex<()>>> = OnceLock::new();
    LOCK.get_or_init(|| Arc::new(Mutex::new(()))).clone()
}

/// Connects and migrates the test database, or `None` when not configured.
///
/// The guard keeps other database tests out until it is dropped.
pub async fn test_store() -> Option<(PgStore, OwnedMutexGuard<()>)> {
    let url = std::env::var("DATABASE_URL").ok()?;
    let guard = db_lock().lock_owned().await;
    let config = PrimaryConfig {
        url: Some(url),
        ..PrimaryConfig::default()
    };
    let retry = RetryPolicy {
        attempts: 1,
        base_delay: Duration::from_millis(10),
    };
    let store = PgStore::connect(&config, retry).await.ok()?;
    store.migrate().await.ok()?;
    Some((store, guard))
}

/// A name no other test run uses.
pub fn unique_name(prefix: &str) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &id[..12])
}

/// Creates a destination table in the public schema.
pub async fn create_table(store: &PgStore, name: &str, ddl_columns: &str) {
    sqlx::query(&format!("CREATE TABLE \"{name}\" ({ddl_columns})"))
        .execute(store.pool())
        .await
        .unwrap();
}

pub async fn drop_table(store: &PgStore, name: &str) {
    let _ = sqlx::query(&format!("DROP TABLE IF EXISTS \"{name}\""))
        .execute(store.pool())
        .await;
}
