//! Integration tests for the sync bridge.
//!
//! Most of these tests require a running PostgreSQL database.
//! Set DATABASE_URL environment variable to run them.
//!
//! Run with: `cargo test --test integration_tests`

mod integration;
