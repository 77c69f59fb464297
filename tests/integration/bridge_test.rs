//! End-to-end runs over the primary database with an in-memory source.

use super::{create_table, drop_table, test_store, unique_name};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use sync_bridge::jobs::{Dispatcher, JobStatus, JobStore, SyncJob};
use sync_bridge::knowledge::{KnowledgeStore, KnownQuery};
use sync_bridge::listener::{JobSource, PgNotifySource, PollingSource};
use sync_bridge::runner::{Runner, RunnerSettings};
use sync_bridge::source::{
    ColumnInfo, FailingSourceClient, MockSourceClient, QueryResult, SourceClient, Value,
};
use sync_bridge::store::{PgStore, NOTIFY_CHANNEL};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn vendas_rows() -> QueryResult {
    QueryResult::with_data(
        vec![ColumnInfo::new("id", "int"), ColumnInfo::new("total", "int")],
        vec![
            vec![Value::Int(1), Value::Int(100)],
            vec![Value::Int(2), Value::Int(200)],
        ],
    )
}

fn runner(store: &Arc<PgStore>, source: Arc<dyn SourceClient>) -> Runner {
    Runner::new(
        store.clone(),
        store.clone(),
        source,
        store.clone(),
        RunnerSettings::default(),
    )
}

/// Waits until the job leaves `pending`/`running`.
async fn wait_terminal(store: &PgStore, id: Uuid) -> SyncJob {
    for _ in 0..100 {
        let job = store.get(id).await.unwrap().unwrap();
        if job.status.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("job {id} did not finish");
}

/// Runs `runner` over `source` until `id` is terminal, then shuts it down.
async fn run_until_done<S>(store: &PgStore, runner: Runner, mut source: S, id: Uuid) -> SyncJob
where
    S: JobSource + 'static,
{
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { runner.run(&mut source, shutdown).await }
    });

    let job = wait_terminal(store, id).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();
    job
}

#[tokio::test]
async fn test_vendas_mes_over_notify() {
    let Some((store, _db)) = test_store().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let store = Arc::new(store);

    let name = unique_name("vendas_mes");
    let table = format!("dump_{name}");
    let sql = format!("SELECT id, total FROM {name}");
    create_table(&store, &table, "id integer PRIMARY KEY, total integer").await;
    store.upsert_query(&KnownQuery::new(&name, &sql)).await.unwrap();

    let source = Arc::new(MockSourceClient::new().with_result(&sql, vendas_rows()));
    let jobs = PgNotifySource::connect(store.pool(), NOTIFY_CHANNEL, store.clone())
        .await
        .unwrap();

    let id = Dispatcher::new(store.clone()).dispatch(&name).await.unwrap();
    let job = run_until_done(&store, runner(&store, source), jobs, id).await;

    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.error_message, None);

    let rows: Vec<(i32, i32)> =
        sqlx::query_as(&format!("SELECT id, total FROM \"{table}\" ORDER BY id"))
            .fetch_all(store.pool())
            .await
            .unwrap();
    assert_eq!(rows, vec![(1, 100), (2, 200)]);

    drop_table(&store, &table).await;
}

#[tokio::test]
async fn test_unknown_query_fails_over_polling() {
    let Some((store, _db)) = test_store().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let store = Arc::new(store);

    let source = Arc::new(MockSourceClient::new());
    let id = store.insert_pending(&unique_name("inexistente")).await.unwrap();
    let jobs = PollingSource::new(store.clone(), Duration::from_millis(100));

    let job = run_until_done(&store, runner(&store, source.clone()), jobs, id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("not found"));
    assert_eq!(source.calls(), 0);
}

#[tokio::test]
async fn test_connection_refused_leaves_destination_empty() {
    let Some((store, _db)) = test_store().await else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let store = Arc::new(store);

    let name = unique_name("estoque");
    let table = format!("dump_{name}");
    create_table(&store, &table, "id integer PRIMARY KEY, total integer").await;
    store
        .upsert_query(&KnownQuery::new(&name, "SELECT id, total FROM estoque"))
        .await
        .unwrap();

    let id = store.insert_pending(&name).await.unwrap();
    let jobs = PollingSource::new(store.clone(), Duration::from_millis(100));
    let source = Arc::new(FailingSourceClient::connection_refused());

    let job = run_until_done(&store, runner(&store, source), jobs, id).await;

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.unwrap().contains("Connection refused"));

    let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM \"{table}\""))
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(count, 0);

    drop_table(&store, &table).await;
}
