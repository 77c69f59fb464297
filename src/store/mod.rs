//! Storage backends for jobs, named queries and destination tables.
//!
//! `PgStore` is the production backend over the primary PostgreSQL database;
//! `MemoryStore` keeps everything in process for tests.

mod memory;
mod migrations;
mod postgres;

pub use memory::MemoryStore;
pub use migrations::{current_version, run_migrations, NOTIFY_CHANNEL};
pub use postgres::{build_upsert_sql, PgStore};
