//! PostgreSQL store tests: job transitions, knowledge and the bulk upsert.

use super::{create_table, drop_table, test_store, unique_name};
use pretty_assertions::assert_eq;
use sync_bridge::error::BridgeError;
use sync_bridge::jobs::{JobFilter, JobStatus, JobStore};
use sync_bridge::knowledge::{KnowledgeStore, KnownQuery, SchemaColumn};
use sync_bridge::sink::ResultSink;
use sync_bridge::source::{ColumnInfo, QueryResult, Value};
use sync_bridge::store::PgStore;

fn vendas(rows: &[(i64, i64)]) -> QueryResult {
    QueryResult::with_data(
        vec![ColumnInfo::new("id", "int"), ColumnInfo::new("total", "int")],
        rows.iter()
            .map(|(id, total)| vec![Value::Int(*id), Value::Int(*total)])
            .collect(),
    )
}

async fn table_rows(store: &PgStore, table: &str) -> Vec<(i64, i64)> {
    sqlx::query_as(&format!(
        "SELECT id::bigint, total::bigint FROM \"{table}\" ORDER BY id"
    ))
    .fetch_all(store.pool())
    .await
    .unwrap()
}

#[tokio::test]
async fn test_job_lifecycle() {
    let Some((store, _db)) = test_store().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let name = unique_name("lifecycle");

    let id = store.insert_pending(&name).await.unwrap();
    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.query_name, name);

    assert!(store.mark_success(id).await.is_err());
    assert!(store.claim(id).await.unwrap());
    assert!(!store.claim(id).await.unwrap());

    store.mark_failed(id, "Query error: boom").await.unwrap();
    let job = store.get(id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error_message.as_deref(), Some("Query error: boom"));
    assert!(job.updated_at >= job.created_at);

    let err = store.mark_success(id).await.unwrap_err();
    assert!(matches!(err, BridgeError::Persistence(_)));
}

#[tokio::test]
async fn test_list_by_query_name_oldest_first() {
    let Some((store, _db)) = test_store().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let name = unique_name("listing");

    let first = store.insert_pending(&name).await.unwrap();
    let second = store.insert_pending(&name).await.unwrap();
    store.claim(second).await.unwrap();

    let all = store
        .list(&JobFilter {
            query_name: Some(name.clone()),
            ..JobFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(all.iter().map(|j| j.id).collect::<Vec<_>>(), vec![first, second]);

    let running = store
        .list(&JobFilter {
            status: Some(JobStatus::Running),
            query_name: Some(name.clone()),
            limit: Some(10),
        })
        .await
        .unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].id, second);

    store.claim(first).await.unwrap();
    store.mark_failed(first, "done").await.unwrap();
    store.mark_failed(second, "done").await.unwrap();
}

#[tokio::test]
async fn test_knowledge_upsert_and_lookup() {
    let Some((store, _db)) = test_store().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let name = unique_name("Knowledge");

    assert!(store.lookup(&name).await.unwrap().is_none());

    let mut query = KnownQuery::new(&name, "SELECT 1 AS id");
    query.suggested_schema = vec![SchemaColumn {
        name: "id".to_string(),
        data_type: "int".to_string(),
    }];
    store.upsert_query(&query).await.unwrap();

    query.raw_query = "SELECT 2 AS id".to_string();
    store.upsert_query(&query).await.unwrap();

    let found = store.lookup(&name).await.unwrap().unwrap();
    assert_eq!(found, query);
    assert!(store.lookup(&name.to_lowercase()).await.unwrap().is_none());
}

#[tokio::test]
async fn test_upsert_is_idempotent_and_updates_in_place() {
    let Some((store, _db)) = test_store().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let table = unique_name("dump_it");
    create_table(&store, &table, "id integer PRIMARY KEY, total numeric(12,2)").await;

    let rows = vendas(&[(1, 100), (2, 200)]);
    assert_eq!(store.upsert(&table, &rows, None).await.unwrap(), 2);
    store.upsert(&table, &rows, None).await.unwrap();
    assert_eq!(table_rows(&store, &table).await, vec![(1, 100), (2, 200)]);

    store
        .upsert(&table, &vendas(&[(2, 250), (3, 300)]), None)
        .await
        .unwrap();
    assert_eq!(
        table_rows(&store, &table).await,
        vec![(1, 100), (2, 250), (3, 300)]
    );

    drop_table(&store, &table).await;
}

#[tokio::test]
async fn test_upsert_casts_through_destination_types() {
    let Some((store, _db)) = test_store().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let table = unique_name("dump_types");
    create_table(
        &store,
        &table,
        "codigo text PRIMARY KEY, valor numeric(10,2), dia date, ativo boolean, obs text",
    )
    .await;

    let rows = QueryResult::with_data(
        vec![
            ColumnInfo::new("codigo", "NVarchar"),
            ColumnInfo::new("valor", "Numeric"),
            ColumnInfo::new("dia", "Daten"),
            ColumnInfo::new("ativo", "Bit"),
            ColumnInfo::new("obs", "NVarchar"),
        ],
        vec![vec![
            Value::String("A-1".to_string()),
            Value::Decimal("1234.50".to_string()),
            Value::Date(chrono::NaiveDate::from_ymd_opt(2024, 3, 31).unwrap()),
            Value::Bool(true),
            Value::Null,
        ]],
    );
    store.upsert(&table, &rows, None).await.unwrap();

    let stored: (String, String, String, bool, Option<String>) = sqlx::query_as(&format!(
        "SELECT codigo, valor::text, dia::text, ativo, obs FROM \"{table}\""
    ))
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(
        stored,
        (
            "A-1".to_string(),
            "1234.50".to_string(),
            "2024-03-31".to_string(),
            true,
            None
        )
    );

    drop_table(&store, &table).await;
}

#[tokio::test]
async fn test_upsert_errors_are_sink_errors() {
    let Some((store, _db)) = test_store().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };

    let missing = unique_name("dump_missing");
    let err = store.upsert(&missing, &vendas(&[(1, 1)]), None).await.unwrap_err();
    assert!(matches!(err, BridgeError::Sink(_)));
    assert!(err.to_string().contains("does not exist"));

    let keyless = unique_name("dump_keyless");
    create_table(&store, &keyless, "id integer, total integer").await;
    let err = store.upsert(&keyless, &vendas(&[(1, 1)]), None).await.unwrap_err();
    assert!(matches!(err, BridgeError::Sink(_)));

    let narrow = unique_name("dump_narrow");
    create_table(&store, &narrow, "id integer PRIMARY KEY").await;
    let err = store.upsert(&narrow, &vendas(&[(1, 1)]), None).await.unwrap_err();
    assert!(matches!(err, BridgeError::Sink(_)));
    assert_eq!(table_rows_count(&store, &narrow).await, 0);

    drop_table(&store, &keyless).await;
    drop_table(&store, &narrow).await;
}

#[tokio::test]
async fn test_upsert_with_configured_key() {
    let Some((store, _db)) = test_store().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let table = unique_name("dump_unique");
    create_table(&store, &table, "id integer UNIQUE, total integer").await;

    let keys = vec!["id".to_string()];
    store
        .upsert(&table, &vendas(&[(1, 10), (1, 20)]), Some(&keys))
        .await
        .unwrap();
    assert_eq!(table_rows(&store, &table).await, vec![(1, 20)]);

    drop_table(&store, &table).await;
}

#[tokio::test]
async fn test_empty_upsert_needs_no_table() {
    let Some((store, _db)) = test_store().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let written = store
        .upsert(&unique_name("dump_never"), &QueryResult::new(), None)
        .await
        .unwrap();
    assert_eq!(written, 0);
}

#[tokio::test]
async fn test_migrations_are_repeatable() {
    let Some((store, _db)) = test_store().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    store.migrate().await.unwrap();
    let version = sync_bridge::store::current_version(store.pool()).await.unwrap();
    assert_eq!(version, 2);
}

async fn table_rows_count(store: &PgStore, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"{table}\""))
        .fetch_one(store.pool())
        .await
        .unwrap()
}
