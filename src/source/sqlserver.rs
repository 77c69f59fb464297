//! SQL Server source client implementation.
//!
//! Provides the `SqlServerClient` struct that implements the `SourceClient` trait
//! using tiberius over a [`SourcePool`].

use crate::config::SourceConfig;
use crate::error::{BridgeError, Result};
use crate::source::pool::{RetryPolicy, SourcePool};
use crate::source::{ColumnInfo, QueryResult, Row, SourceClient, Value};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use std::time::Instant;
use tiberius::{ColumnData, FromSql};
use tracing::debug;

/// SQL Server source client.
#[derive(Debug, Clone)]
pub struct SqlServerClient {
    pool: SourcePool,
}

impl SqlServerClient {
    /// Creates a client over a new pool. Connections open lazily.
    pub fn new(config: SourceConfig, retry: RetryPolicy) -> Self {
        Self {
            pool: SourcePool::new(config, retry),
        }
    }

    /// Returns the underlying pool.
    pub fn pool(&self) -> &SourcePool {
        &self.pool
    }
}

#[async_trait]
impl SourceClient for SqlServerClient {
    async fn execute(&self, raw_query: &str) -> Result<QueryResult> {
        let mut conn = self.pool.acquire().await?;
        let start = Instant::now();

        // Until the full result is read the TDS stream is mid-flight; a guard
        // dropped in that state must not return to the pool.
        conn.set_reusable(false);

        let client = conn.client()?;
        let mut stream = client
            .simple_query(raw_query)
            .await
            .map_err(|e| BridgeError::query(format_query_error(&e)))?;

        let columns: Vec<ColumnInfo> = stream
            .columns()
            .await
            .map_err(|e| BridgeError::query(format_query_error(&e)))?
            .map(|cols| {
                cols.iter()
                    .map(|col| ColumnInfo::new(col.name(), format!("{:?}", col.column_type())))
                    .collect()
            })
            .unwrap_or_default();

        let tds_rows = stream
            .into_first_result()
            .await
            .map_err(|e| BridgeError::query(format_query_error(&e)))?;

        conn.set_reusable(true);
        drop(conn);

        let rows: Vec<Row> = tds_rows.into_iter().map(convert_row).collect();
        let execution_time = start.elapsed();
        debug!(
            "Source query returned {} rows in {:?}",
            rows.len(),
            execution_time
        );

        Ok(QueryResult::with_data(columns, rows).with_execution_time(execution_time))
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// Converts a tiberius row to our Row type.
fn convert_row(row: tiberius::Row) -> Row {
    row.into_iter().map(convert_value).collect()
}

/// Converts a single column value to our Value type.
fn convert_value(data: ColumnData<'static>) -> Value {
    match &data {
        ColumnData::U8(v) => Value::from(v.map(i64::from)),
        ColumnData::I16(v) => Value::from(v.map(i64::from)),
        ColumnData::I32(v) => Value::from(*v),
        ColumnData::I64(v) => Value::from(*v),
        ColumnData::F32(v) => Value::from(v.map(f64::from)),
        ColumnData::F64(v) => Value::from(*v),
        ColumnData::Bit(v) => Value::from(*v),
        ColumnData::String(v) => v
            .as_ref()
            .map(|s| Value::String(s.to_string()))
            .unwrap_or(Value::Null),
        ColumnData::Guid(v) => v.map(Value::Uuid).unwrap_or(Value::Null),
        ColumnData::Binary(v) => v
            .as_ref()
            .map(|b| Value::Bytes(b.to_vec()))
            .unwrap_or(Value::Null),
        ColumnData::Numeric(v) => v
            .as_ref()
            .map(|n| Value::Decimal(format_numeric(n.value(), n.scale())))
            .unwrap_or(Value::Null),
        ColumnData::Xml(v) => v
            .as_ref()
            .map(|xml| Value::String((**xml).clone().into_string()))
            .unwrap_or(Value::Null),
        ColumnData::Date(_) => temporal(&data, Value::Date, NaiveDate::from_sql),
        ColumnData::Time(_) => temporal(&data, Value::Time, NaiveTime::from_sql),
        ColumnData::DateTimeOffset(_) => temporal(
            &data,
            Value::DateTimeTz,
            DateTime::<FixedOffset>::from_sql,
        ),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            temporal(&data, Value::DateTime, NaiveDateTime::from_sql)
        }
        #[allow(unreachable_patterns)]
        _ => Value::Null,
    }
}

fn temporal<'a, T>(
    data: &'a ColumnData<'static>,
    wrap: fn(T) -> Value,
    decode: fn(&'a ColumnData<'static>) -> tiberius::Result<Option<T>>,
) -> Value {
    match decode(data) {
        Ok(Some(v)) => wrap(v),
        Ok(None) => Value::Null,
        Err(e) => {
            debug!("Failed to decode temporal value: {e}");
            Value::Null
        }
    }
}

/// Renders a scaled integer as decimal text (`12345`, scale 2 → `123.45`).
fn format_numeric(value: i128, scale: u8) -> String {
    if scale == 0 {
        return value.to_string();
    }

    let negative = value < 0;
    let digits = value.unsigned_abs().to_string();
    let scale = scale as usize;
    let padded = if digits.len() <= scale {
        format!("{}{}", "0".repeat(scale - digits.len() + 1), digits)
    } else {
        digits
    };

    let (int_part, frac_part) = padded.split_at(padded.len() - scale);
    let sign = if negative { "-" } else { "" };
    format!("{sign}{int_part}.{frac_part}")
}

/// Extracts the engine's own message from a query failure.
fn format_query_error(error: &tiberius::error::Error) -> String {
    match error {
        tiberius::error::Error::Server(token) => {
            debug!(
                "Source rejected query: error {}, state {}, class {}, line {}",
                token.code(),
                token.state(),
                token.class(),
                token.line()
            );
            token.message().to_string()
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;

    #[test]
    fn test_format_numeric() {
        assert_eq!(format_numeric(12345, 2), "123.45");
        assert_eq!(format_numeric(-12345, 2), "-123.45");
        assert_eq!(format_numeric(5, 3), "0.005");
        assert_eq!(format_numeric(-5, 1), "-0.5");
        assert_eq!(format_numeric(100, 0), "100");
        assert_eq!(format_numeric(0, 2), "0.00");
    }

    #[test]
    fn test_convert_scalar_values() {
        assert_eq!(convert_value(ColumnData::I32(Some(7))), Value::Int(7));
        assert_eq!(convert_value(ColumnData::U8(Some(255))), Value::Int(255));
        assert_eq!(convert_value(ColumnData::I64(None)), Value::Null);
        assert_eq!(convert_value(ColumnData::Bit(Some(true))), Value::Bool(true));
        assert_eq!(convert_value(ColumnData::F64(Some(2.5))), Value::Float(2.5));
        assert_eq!(
            convert_value(ColumnData::String(Some(Cow::Borrowed("São Paulo")))),
            Value::String("São Paulo".to_string())
        );
        assert_eq!(
            convert_value(ColumnData::Binary(Some(Cow::Owned(vec![1, 2])))),
            Value::Bytes(vec![1, 2])
        );
    }

    // Requires a SQL Server instance; set MSSQL_TEST_URL to run.
    #[tokio::test]
    async fn test_execute_against_live_server() {
        let Ok(url) = std::env::var("MSSQL_TEST_URL") else {
            eprintln!("Skipping test: MSSQL_TEST_URL not set");
            return;
        };
        let config = SourceConfig::from_connection_string(&url).unwrap();
        let client = SqlServerClient::new(config, RetryPolicy::default());

        let result = client
            .execute("SELECT 1 AS id, CAST(100.50 AS DECIMAL(10,2)) AS total, N'olá' AS nome")
            .await
            .unwrap();

        assert_eq!(result.column_names(), vec!["id", "total", "nome"]);
        assert_eq!(result.get(0, "id"), Some(&Value::Int(1)));
        assert_eq!(
            result.get(0, "total"),
            Some(&Value::Decimal("100.50".to_string()))
        );
        assert_eq!(client.pool().idle_count(), 1);

        let err = client.execute("SELECT * FROM nonexistent_table_xyz").await.unwrap_err();
        assert!(err.to_string().contains("nonexistent_table_xyz"));

        client.close().await.unwrap();
    }
}
