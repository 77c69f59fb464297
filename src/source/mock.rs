//! Mock source clients for testing.
//!
//! Provides in-memory stand-ins for the external SQL Server source.

use super::{QueryResult, SourceClient};
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// A mock source that answers queries from a fixed table of results.
///
/// Unknown query text fails the way SQL Server does for a missing object.
#[derive(Default)]
pub struct MockSourceClient {
    results: Mutex<HashMap<String, QueryResult>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl MockSourceClient {
    /// Creates a mock source with no known queries.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the result returned for `raw_query`.
    pub fn with_result(self, raw_query: impl Into<String>, result: QueryResult) -> Self {
        self.set_result(raw_query, result);
        self
    }

    /// Makes every execution take at least `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Replaces the result returned for `raw_query`.
    pub fn set_result(&self, raw_query: impl Into<String>, result: QueryResult) {
        self.results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(raw_query.into(), result);
    }

    /// Number of executions attempted.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of executions observed running at the same time.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SourceClient for MockSourceClient {
    async fn execute(&self, raw_query: &str) -> Result<QueryResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = ActiveGuard(&self.active);
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let found = self
            .results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(raw_query)
            .cloned();

        found.ok_or_else(|| {
            BridgeError::query(format!("Invalid object name in query '{raw_query}'."))
        })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// A source that fails every execution with the same error.
pub struct FailingSourceClient {
    error: BridgeError,
    calls: AtomicUsize,
}

impl FailingSourceClient {
    /// Creates a failing source returning `error` on every call.
    pub fn new(error: BridgeError) -> Self {
        Self {
            error,
            calls: AtomicUsize::new(0),
        }
    }

    /// A source whose server refuses connections.
    pub fn connection_refused() -> Self {
        Self::new(BridgeError::connection(
            "Cannot connect to erp.local:1445. Connection refused: Connection refused (os error 111)",
        ))
    }

    /// Number of executions attempted.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceClient for FailingSourceClient {
    async fn execute(&self, _raw_query: &str) -> Result<QueryResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
