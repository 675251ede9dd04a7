//! Values, positional bindings and result rows.

use std::collections::{BTreeMap, HashMap};

use rusqlite::types::{ToSql, ToSqlOutput, Value as SqlValue, ValueRef};
use serde::{Deserialize, Serialize};

/// Core value types for SQLite operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Boolean(bool),
}

impl Value {
    /// Text content, or `None` for anything that is not `Value::Text`.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Render a column value the way rows are delivered to callers: every
    /// non-null storage class becomes text, NULL stays an explicit marker.
    pub(crate) fn from_column(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Text(i.to_string()),
            ValueRef::Real(f) => Value::Text(format_real(f)),
            ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
                Value::Text(String::from_utf8_lossy(bytes).into_owned())
            }
        }
    }
}

// SQLite prints integral reals with a trailing ".0".
fn format_real(f: f64) -> String {
    if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{f:.1}")
    } else {
        f.to_string()
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Integer(i) => ToSqlOutput::from(*i),
            Value::Real(f) => ToSqlOutput::from(*f),
            Value::Text(s) => ToSqlOutput::from(s.as_str()),
            Value::Blob(b) => ToSqlOutput::from(b.as_slice()),
            Value::Boolean(b) => ToSqlOutput::from(*b),
        })
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Integer(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Real(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Blob(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Positional parameter bindings, keyed by 1-based parameter index.
///
/// Indices that are not set are bound as NULL when the statement runs, so a
/// reused statement never sees a value left over from a previous call.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Bindings {
    pub values: BTreeMap<usize, Value>,
}

impl Bindings {
    /// Create an empty set of bindings
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `values` to parameters `1..=n` in order.
    pub fn positional<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values = values
            .into_iter()
            .enumerate()
            .map(|(i, value)| (i + 1, value.into()))
            .collect();
        Self { values }
    }

    /// Add a value at a 1-based parameter index
    pub fn with_value(mut self, index: usize, value: impl Into<Value>) -> Self {
        self.values.insert(index, value.into());
        self
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(&index)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One result row: column name to value. NULL columns are present as
/// [`Value::Null`] rather than missing.
pub type Row = HashMap<String, Value>;

/// Rows produced by one query. Finite and consumed once.
#[derive(Debug)]
pub struct QueryRows {
    rows: std::vec::IntoIter<Row>,
}

impl QueryRows {
    pub(crate) fn new(rows: Vec<Row>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }
}

impl Iterator for QueryRows {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        self.rows.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.rows.size_hint()
    }
}

impl ExactSizeIterator for QueryRows {}
