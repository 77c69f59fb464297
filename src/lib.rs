//! sync-bridge: runs named queries against SQL Server and upserts their
//! results into PostgreSQL, tracking each request as a job.
//!
//! This library exposes the core modules for the binary and integration tests.

pub mod bridge;
pub mod cli;
pub mod config;
pub mod error;
pub mod jobs;
pub mod knowledge;
pub mod listener;
pub mod logging;
pub mod runner;
pub mod sink;
pub mod source;
pub mod store;
