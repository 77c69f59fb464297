//! In-memory store for tests and dry runs.
//!
//! Mirrors the conditional transitions and keyed upsert of the PostgreSQL
//! store so the runner can be exercised without a database.

use crate::error::{BridgeError, Result};
use crate::jobs::{JobFilter, JobStatus, JobStore, SyncJob};
use crate::knowledge::{KnowledgeStore, KnownQuery};
use crate::sink::{check_key_columns, keyed_records, ResultSink};
use crate::source::QueryResult;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

type Record = Map<String, JsonValue>;

#[derive(Debug, Default)]
struct Table {
    primary_key: Vec<String>,
    rows: Vec<Record>,
}

#[derive(Debug, Default)]
struct State {
    jobs: Vec<SyncJob>,
    queries: HashMap<String, KnownQuery>,
    tables: HashMap<String, Table>,
}

/// Store holding jobs, queries and destination tables in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
    fail_status_writes: AtomicBool,
    upserts: AtomicUsize,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation fail with a persistence error while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes terminal status writes (`success`/`failed`) fail while set.
    pub fn set_fail_status_writes(&self, fail: bool) {
        self.fail_status_writes.store(fail, Ordering::SeqCst);
    }

    /// Registers a known query.
    pub fn add_query(&self, name: &str, raw_query: &str) {
        self.lock()
            .queries
            .insert(name.to_string(), KnownQuery::new(name, raw_query));
    }

    /// Creates an empty destination table keyed by `primary_key`.
    pub fn create_table(&self, table: &str, primary_key: &[&str]) {
        self.lock().tables.insert(
            table.to_string(),
            Table {
                primary_key: primary_key.iter().map(|k| k.to_string()).collect(),
                rows: Vec::new(),
            },
        );
    }

    /// Rows currently held by `table`, in insertion order.
    pub fn rows(&self, table: &str) -> Option<Vec<Record>> {
        self.lock().tables.get(table).map(|t| t.rows.clone())
    }

    /// Number of upserts that reached a table.
    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BridgeError::persistence("Primary database unavailable"));
        }
        Ok(())
    }

    fn finish(&self, id: Uuid, status: JobStatus, message: Option<&str>) -> Result<()> {
        self.check_available()?;
        if self.fail_status_writes.load(Ordering::SeqCst) {
            return Err(BridgeError::persistence(format!(
                "Failed to mark job {id} {status}: connection reset"
            )));
        }

        let mut state = self.lock();
        let job = state
            .jobs
            .iter_mut()
            .find(|j| j.id == id && j.status.can_transition_to(status))
            .ok_or_else(|| BridgeError::persistence(format!("Job {id} is not running")))?;

        job.status = status;
        job.error_message = message.map(String::from);
        job.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_pending(&self, query_name: &str) -> Result<Uuid> {
        self.check_available()?;
        let job = SyncJob::new_pending(query_name);
        let id = job.id;
        self.lock().jobs.push(job);
        Ok(id)
    }

    async fn claim(&self, id: Uuid) -> Result<bool> {
        self.check_available()?;
        let mut state = self.lock();
        match state
            .jobs
            .iter_mut()
            .find(|j| j.id == id && j.status.can_transition_to(JobStatus::Running))
        {
            Some(job) => {
                job.status = JobStatus::Running;
                job.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_success(&self, id: Uuid) -> Result<()> {
        self.finish(id, JobStatus::Success, None)
    }

    async fn mark_failed(&self, id: Uuid, message: &str) -> Result<()> {
        self.finish(id, JobStatus::Failed, Some(message))
    }

    async fn get(&self, id: Uuid) -> Result<Option<SyncJob>> {
        self.check_available()?;
        Ok(self.lock().jobs.iter().find(|j| j.id == id).cloned())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<SyncJob>> {
        self.check_available()?;
        let mut jobs: Vec<SyncJob> = self
            .lock()
            .jobs
            .iter()
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();

        // Stable sort keeps insertion order for equal timestamps.
        jobs.sort_by_key(|j| j.created_at);
        if let Some(limit) = filter.limit {
            jobs.truncate(limit.max(0) as usize);
        }
        Ok(jobs)
    }
}

#[async_trait]
impl KnowledgeStore for MemoryStore {
    async fn lookup(&self, name: &str) -> Result<Option<KnownQuery>> {
        self.check_available()?;
        Ok(self.lock().queries.get(name).cloned())
    }

    async fn upsert_query(&self, query: &KnownQuery) -> Result<()> {
        self.check_available()?;
        self.lock()
            .queries
            .insert(query.name.clone(), query.clone());
        Ok(())
    }
}

#[async_trait]
impl ResultSink for MemoryStore {
    async fn upsert(
        &self,
        table: &str,
        rows: &QueryResult,
        key_columns: Option<&[String]>,
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        self.check_available()?;

        let mut state = self.lock();
        let target = state.tables.get_mut(table).ok_or_else(|| {
            BridgeError::sink(format!("Destination table {table} does not exist"))
        })?;

        let keys = key_columns
            .map(|k| k.to_vec())
            .unwrap_or_else(|| target.primary_key.clone());
        check_key_columns(table, rows, &keys)?;

        let key_of = |record: &Record| -> Vec<JsonValue> {
            keys.iter()
                .map(|k| record.get(k).cloned().unwrap_or(JsonValue::Null))
                .collect()
        };

        let records = keyed_records(rows, &keys);
        let written = records.len() as u64;
        for record in records {
            let key = key_of(&record);
            match target.rows.iter_mut().find(|existing| key_of(existing) == key) {
                Some(existing) => existing.extend(record),
                None => target.rows.push(record),
            }
        }

        self.upserts.fetch_add(1, Ordering::SeqCst);
        Ok(written)
    }
}
