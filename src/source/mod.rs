//! External source abstraction for the sync bridge.
//!
//! Provides a trait-based interface for executing stored query text on the
//! external relational source, so the runner can be driven by the real SQL
//! Server client or by in-memory fakes.

mod mock;
mod pool;
mod sqlserver;
mod types;

pub use mock::{FailingSourceClient, MockSourceClient};
pub use pool::{PooledConnection, RetryPolicy, SourcePool, TdsClient};
pub use sqlserver::SqlServerClient;
pub use types::{ColumnInfo, QueryResult, Row, Value};

use crate::error::Result;
use async_trait::async_trait;

/// Trait defining the interface for source clients.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Executes the query text verbatim and returns the first result set.
    async fn execute(&self, raw_query: &str) -> Result<QueryResult>;

    /// Releases every connection held by the client.
    async fn close(&self) -> Result<()>;
}
