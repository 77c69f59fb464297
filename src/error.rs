//! Error types for the sync bridge.
//!
//! Defines the error taxonomy shared by the dispatcher, runner, source and sink.

use thiserror::Error;

/// Main error type for bridge operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Malformed dispatch request (missing query name, etc.)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Query name has no entry in the knowledge store.
    #[error("Lookup error: {0}")]
    Lookup(String),

    /// External source unreachable (host down, auth failed, pool exhausted, etc.)
    #[error("Connection error: {0}")]
    Connection(String),

    /// External source rejected or failed the query.
    #[error("Query error: {0}")]
    Query(String),

    /// Query execution exceeded the configured limit.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Destination upsert failed (missing table, schema mismatch, constraint violation).
    #[error("Sink error: {0}")]
    Sink(String),

    /// The job-tracking store itself is unavailable.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Configuration errors (invalid config file, missing required fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal application errors (unexpected states, bugs, etc.)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Creates a validation error with the given message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Creates a lookup error with the given message.
    pub fn lookup(msg: impl Into<String>) -> Self {
        Self::Lookup(msg.into())
    }

    /// Creates a connection error with the given message.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Creates a query error with the given message.
    pub fn query(msg: impl Into<String>) -> Self {
        Self::Query(msg.into())
    }

    /// Creates a timeout error with the given message.
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Creates a sink error with the given message.
    pub fn sink(msg: impl Into<String>) -> Self {
        Self::Sink(msg.into())
    }

    /// Creates a persistence error with the given message.
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Creates a configuration error with the given message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates an internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns the error category as a string for display purposes.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Validation(_) => "Validation Error",
            Self::Lookup(_) => "Lookup Error",
            Self::Connection(_) => "Connection Error",
            Self::Query(_) => "Query Error",
            Self::Timeout(_) => "Timeout",
            Self::Sink(_) => "Sink Error",
            Self::Persistence(_) => "Persistence Error",
            Self::Config(_) => "Configuration Error",
            Self::Internal(_) => "Internal Error",
        }
    }

    /// Whether this error must reach an operator rather than only a job record.
    ///
    /// A persistence failure means the job's fate could not be recorded at all.
    pub fn is_operator_visible(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::Config(_))
    }
}

/// Result type alias using BridgeError.
pub type Result<T> = std::result::Result<T, BridgeError>;
