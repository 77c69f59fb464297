//! Job dispatcher: the single entry point for starting work.

use super::JobStore;
use crate::error::{BridgeError, Result};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Creates `pending` jobs for the runner to pick up.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Inserts a pending job for `query_name` and returns its id.
    ///
    /// Fails with a validation error, before touching the store, when the name
    /// is blank. Store failures are returned as-is; retrying is up to the caller.
    pub async fn dispatch(&self, query_name: &str) -> Result<Uuid> {
        let query_name = query_name.trim();
        if query_name.is_empty() {
            return Err(BridgeError::validation("Missing query_name"));
        }

        let id = self.store.insert_pending(query_name).await?;
        info!("Dispatched job {} for query: {}", id, query_name);
        Ok(id)
    }
}
