//! Encoding and decoding helpers between odstage values and SQLite storage
//! classes.
//!
//! Booleans are stored as `INTEGER 0/1`, dates as `YYYY-MM-DD` text and
//! timestamps as `YYYY-MM-DD HH:MM:SS[.fff]` text, so lexical order on the
//! stored text is chronological order.

use chrono::{NaiveDate, NaiveDateTime};
use odstage_core::value::{DATE_FORMAT, DataType, TIMESTAMP_FORMAT, Value};
use rusqlite::types::Value as SqlValue;

use crate::{Error, Result};

// ─── Identifiers ─────────────────────────────────────────────────────────────

/// Quote a table or column name for use in SQL text.
pub fn quote(ident: &str) -> String { format!("\"{}\"", ident.replace('"', "\"\"")) }

pub fn quote_list<S: AsRef<str>>(idents: &[S]) -> String {
  idents
    .iter()
    .map(|i| quote(i.as_ref()))
    .collect::<Vec<_>>()
    .join(", ")
}

// ─── Types ───────────────────────────────────────────────────────────────────

pub fn sql_type(t: DataType) -> &'static str {
  match t {
    DataType::Integer | DataType::Boolean => "INTEGER",
    DataType::Float => "REAL",
    DataType::Text | DataType::Date | DataType::Timestamp => "TEXT",
  }
}

// ─── Values ──────────────────────────────────────────────────────────────────

pub fn encode_value(v: &Value) -> SqlValue {
  match v {
    Value::Null => SqlValue::Null,
    Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
    Value::Int(n) => SqlValue::Integer(*n),
    Value::Float(x) => SqlValue::Real(*x),
    Value::Text(s) => SqlValue::Text(s.clone()),
    Value::Date(d) => SqlValue::Text(d.format(DATE_FORMAT).to_string()),
    Value::Timestamp(ts) => SqlValue::Text(encode_dt(*ts)),
  }
}

/// Decode a stored value with no type information, as raw relations are.
pub fn decode_raw(v: SqlValue) -> Value {
  match v {
    SqlValue::Null => Value::Null,
    SqlValue::Integer(n) => Value::Int(n),
    SqlValue::Real(x) => Value::Float(x),
    SqlValue::Text(s) => Value::Text(s),
    SqlValue::Blob(b) => Value::Text(String::from_utf8_lossy(&b).into_owned()),
  }
}

/// Decode a stored value of a staged column.
///
/// Anything that does not fit the declared type comes back as stored; a
/// boolean column holding `2` reads back as `Int(2)`.
pub fn decode_typed(v: SqlValue, t: DataType) -> Value {
  let raw = decode_raw(v);
  match (t, raw) {
    (DataType::Boolean, Value::Int(0)) => Value::Bool(false),
    (DataType::Boolean, Value::Int(1)) => Value::Bool(true),
    (DataType::Float, Value::Int(n)) => Value::Float(n as f64),
    (DataType::Date, Value::Text(s)) => match NaiveDate::parse_from_str(&s, DATE_FORMAT) {
      Ok(d) => Value::Date(d),
      Err(_) => Value::Text(s),
    },
    (DataType::Timestamp, Value::Text(s)) => match decode_dt(&s) {
      Ok(ts) => Value::Timestamp(ts),
      Err(_) => Value::Text(s),
    },
    (_, other) => other,
  }
}

// ─── Timestamps ──────────────────────────────────────────────────────────────

pub fn encode_dt(ts: NaiveDateTime) -> String { ts.format(TIMESTAMP_FORMAT).to_string() }

pub fn decode_dt(s: &str) -> Result<NaiveDateTime> {
  NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).map_err(|e| Error::DateParse(format!("{s:?}: {e}")))
}
