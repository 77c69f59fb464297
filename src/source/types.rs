//! Query result types for the external source.
//!
//! Defines the structures used to carry a row set from the source to the sink.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::time::Duration;
use uuid::Uuid;

/// Represents the result of executing a query on the source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column metadata for the result set.
    pub columns: Vec<ColumnInfo>,

    /// Rows of data, each aligned with `columns`.
    pub rows: Vec<Row>,

    /// Time taken to execute the query.
    #[serde(with = "duration_serde")]
    pub execution_time: Duration,
}

impl QueryResult {
    /// Creates a new empty query result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query result with the given columns and rows.
    pub fn with_data(columns: Vec<ColumnInfo>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows,
            execution_time: Duration::ZERO,
        }
    }

    /// Sets the execution time.
    pub fn with_execution_time(mut self, duration: Duration) -> Self {
        self.execution_time = duration;
        self
    }

    /// Returns true if the result set is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of rows in the result.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Column names in result order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Returns each row as a column-name → JSON value record.
    pub fn records(&self) -> Vec<Map<String, JsonValue>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row.iter())
                    .map(|(col, value)| (col.name.clone(), value.to_json()))
                    .collect()
            })
            .collect()
    }

    /// Returns the value of `column` in row `row`, if both exist.
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c.name == column)?;
        self.rows.get(row)?.get(idx)
    }
}

/// Metadata about a column in a result set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,

    /// Column data type as reported by the source.
    pub data_type: String,
}

impl ColumnInfo {
    /// Creates a new column info with the given name and type.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// A row of data from a query result.
pub type Row = Vec<Value>;

/// Represents a single value from the source.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub enum Value {
    /// NULL value.
    #[default]
    Null,

    /// Boolean value (BIT).
    Bool(bool),

    /// Signed integer (TINYINT through BIGINT).
    Int(i64),

    /// Floating point number (REAL, FLOAT).
    Float(f64),

    /// Exact numeric kept in its decimal text form (DECIMAL, NUMERIC).
    Decimal(String),

    /// Text value.
    String(String),

    /// Binary data.
    Bytes(Vec<u8>),

    /// UNIQUEIDENTIFIER.
    Uuid(Uuid),

    /// DATE.
    Date(NaiveDate),

    /// TIME.
    Time(NaiveTime),

    /// DATETIME, DATETIME2, SMALLDATETIME.
    DateTime(NaiveDateTime),

    /// DATETIMEOFFSET.
    DateTimeTz(DateTime<FixedOffset>),
}

impl Value {
    /// Converts the value to JSON in a form PostgreSQL record population accepts.
    ///
    /// Exact numerics and temporal values become strings so the destination
    /// column type performs the cast without precision loss.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Decimal(d) => JsonValue::String(d.clone()),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Bytes(b) => JsonValue::String(bytea_hex(b)),
            Value::Uuid(u) => JsonValue::String(u.to_string()),
            Value::Date(d) => JsonValue::String(d.format("%Y-%m-%d").to_string()),
            Value::Time(t) => JsonValue::String(t.format("%H:%M:%S%.f").to_string()),
            Value::DateTime(dt) => JsonValue::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            Value::DateTimeTz(dt) => JsonValue::String(dt.to_rfc3339()),
        }
    }
}

/// PostgreSQL `bytea` hex input format.
fn bytea_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Value::Null,
        }
    }
}

/// Serde support for Duration (not natively supported by serde).
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_nanos().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let nanos = u128::deserialize(deserializer)?;
        Ok(Duration::from_nanos(nanos as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sales() -> QueryResult {
        QueryResult::with_data(
            vec![ColumnInfo::new("id", "int"), ColumnInfo::new("total", "decimal")],
            vec![
                vec![Value::Int(1), Value::Decimal("100.00".to_string())],
                vec![Value::Int(2), Value::Decimal("200.50".to_string())],
            ],
        )
    }

    #[test]
    fn test_records_map_columns_to_values() {
        let records = sales().records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["id"], json!(1));
        assert_eq!(records[1]["total"], json!("200.50"));
    }

    #[test]
    fn test_get_by_column_name() {
        let result = sales();
        assert_eq!(result.get(1, "id"), Some(&Value::Int(2)));
        assert_eq!(result.get(0, "missing"), None);
        assert_eq!(result.get(5, "id"), None);
    }

    #[test]
    fn test_temporal_values_to_json() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let dt = date.and_hms_opt(14, 5, 0).unwrap();
        assert_eq!(Value::Date(date).to_json(), json!("2024-03-09"));
        assert_eq!(Value::DateTime(dt).to_json(), json!("2024-03-09T14:05:00"));

        let offset = FixedOffset::west_opt(3 * 3600).unwrap();
        let tz = dt.and_local_timezone(offset).unwrap();
        assert_eq!(Value::DateTimeTz(tz).to_json(), json!("2024-03-09T14:05:00-03:00"));
    }

    #[test]
    fn test_bytes_use_bytea_hex() {
        assert_eq!(Value::Bytes(vec![0x01, 0xab]).to_json(), json!("\\x01ab"));
    }

    #[test]
    fn test_non_finite_float_becomes_null() {
        assert_eq!(Value::Float(f64::NAN).to_json(), JsonValue::Null);
        assert_eq!(Value::Float(1.5).to_json(), json!(1.5));
    }

    #[test]
    fn test_value_from_conversions() {
        assert_eq!(Value::from(true), Value::Bool(true));
        assert_eq!(Value::from(42i32), Value::Int(42));
        assert_eq!(Value::from(Some(2.5)), Value::Float(2.5));
        assert_eq!(Value::from(None::<i32>), Value::Null);
    }

    #[test]
    fn test_query_result_empty() {
        let result = QueryResult::new().with_execution_time(Duration::from_millis(5));
        assert!(result.is_empty());
        assert_eq!(result.row_count(), 0);
        assert!(result.records().is_empty());
    }
}
