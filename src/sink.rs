//! Result sink: materializes a source row set into its destination table.

use crate::error::{BridgeError, Result};
use crate::source::QueryResult;
use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;

/// Prefix used when no other is configured.
pub const DEFAULT_TABLE_PREFIX: &str = "dump_";

/// Destination table for a query: `prefix` + lowercased query name.
pub fn destination_table(prefix: &str, query_name: &str) -> String {
    format!("{prefix}{}", query_name.to_lowercase())
}

/// Quotes a PostgreSQL identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Bulk insert-or-update of a row set.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Upserts `rows` into `table` and returns the number of rows written.
    ///
    /// `key_columns` names the conflict key; `None` means the table's own
    /// primary key. An empty row set is a no-op returning 0.
    async fn upsert(
        &self,
        table: &str,
        rows: &QueryResult,
        key_columns: Option<&[String]>,
    ) -> Result<u64>;
}

/// Checks that every key column is present in the row set.
pub fn check_key_columns(table: &str, rows: &QueryResult, key_columns: &[String]) -> Result<()> {
    if key_columns.is_empty() {
        return Err(BridgeError::sink(format!(
            "No upsert key for {table}: declare a primary key or configure sink.keys"
        )));
    }

    let names = rows.column_names();
    if let Some(missing) = key_columns.iter().find(|k| !names.contains(&k.as_str())) {
        return Err(BridgeError::sink(format!(
            "Key column '{missing}' for {table} is not in the query result"
        )));
    }

    Ok(())
}

/// Row records with duplicate keys collapsed, the last occurrence winning.
///
/// First-seen order is kept. A bulk upsert cannot touch the same target row
/// twice, and this is what a row-by-row upsert would leave behind.
pub fn keyed_records(rows: &QueryResult, key_columns: &[String]) -> Vec<Map<String, JsonValue>> {
    let mut order: Vec<String> = Vec::new();
    let mut latest: HashMap<String, Map<String, JsonValue>> = HashMap::new();

    for record in rows.records() {
        let key: Vec<JsonValue> = key_columns
            .iter()
            .map(|k| record.get(k).cloned().unwrap_or(JsonValue::Null))
            .collect();
        let key = serde_json::to_string(&key).unwrap_or_default();

        if latest.insert(key.clone(), record).is_none() {
            order.push(key);
        }
    }

    order
        .into_iter()
        .filter_map(|key| latest.remove(&key))
        .collect()
}
