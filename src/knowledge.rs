//! Query knowledge store.
//!
//! Named queries live in `ai_known_queries`; the bridge only reads them. The
//! offline ingestion step that fills the table from a directory of `.sql`
//! files lives here too.

use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One column of a query's suggested result schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
}

/// A named query and its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownQuery {
    pub name: String,
    pub raw_query: String,
    #[serde(default)]
    pub suggested_schema: Vec<SchemaColumn>,
    pub filename: Option<String>,
    pub explanation: Option<String>,
    pub business_domain: Option<String>,
}

impl KnownQuery {
    /// Creates a query with no metadata.
    pub fn new(name: impl Into<String>, raw_query: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            raw_query: raw_query.into(),
            suggested_schema: Vec::new(),
            filename: None,
            explanation: None,
            business_domain: None,
        }
    }
}

/// Read access (and ingestion writes) for named queries.
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    /// Looks up a query by exact name.
    async fn lookup(&self, name: &str) -> Result<Option<KnownQuery>>;

    /// Inserts or replaces a query by name.
    async fn upsert_query(&self, query: &KnownQuery) -> Result<()>;
}

/// Outcome of a directory ingestion.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub ingested: Vec<String>,
    pub failed: Vec<(PathBuf, String)>,
}

/// Builds the knowledge entry for one `.sql` file.
pub fn query_from_file(path: &Path) -> Result<KnownQuery> {
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| BridgeError::validation(format!("Bad file name: {}", path.display())))?
        .to_string();

    let raw_query = std::fs::read_to_string(path).map_err(|e| {
        BridgeError::validation(format!("Failed to read {}: {e}", path.display()))
    })?;

    if raw_query.trim().is_empty() {
        return Err(BridgeError::validation(format!(
            "{} contains no query text",
            path.display()
        )));
    }

    Ok(KnownQuery {
        explanation: Some(format!("Query para o módulo {name}")),
        business_domain: Some("ERP".to_string()),
        filename: path.file_name().and_then(|f| f.to_str()).map(String::from),
        name,
        raw_query,
        suggested_schema: Vec::new(),
    })
}

/// Upserts every `*.sql` file in `dir` into the knowledge store.
///
/// A file that cannot be read or saved is recorded in the report and the
/// batch continues.
pub async fn ingest_dir(store: &dyn KnowledgeStore, dir: &Path) -> Result<IngestReport> {
    let entries = std::fs::read_dir(dir).map_err(|e| {
        BridgeError::validation(format!("Failed to read directory {}: {e}", dir.display()))
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "sql"))
        .collect();
    files.sort();

    info!("Found {} SQL files to ingest in {}", files.len(), dir.display());

    let mut report = IngestReport::default();
    for path in files {
        let outcome = match query_from_file(&path) {
            Ok(query) => store.upsert_query(&query).await.map(|_| query.name),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(name) => {
                info!("Ingested {}", path.display());
                report.ingested.push(name);
            }
            Err(e) => {
                warn!("Failed to ingest {}: {}", path.display(), e);
                report.failed.push((path, e.to_string()));
            }
        }
    }

    Ok(report)
}
