//! Dynamically typed cell values, rows and relations.
//!
//! Raw relations arrive with whatever types the extract produced (dates are
//! usually text, flags are usually integers). Staged relations carry a
//! declared [`DataType`] per column, which storage backends use to decode
//! values on the way back in.

use std::{cmp::Ordering, collections::BTreeMap, fmt};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

// ─── Value ───────────────────────────────────────────────────────────────────

/// A single nullable cell.
///
/// Deserialises untagged, so YAML/JSON scalars map onto the narrowest
/// variant: `1` is an `Int`, `1.5` a `Float`, `"2023-01-01"` a `Date`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
  #[default]
  Null,
  Bool(bool),
  Int(i64),
  Float(f64),
  Date(NaiveDate),
  Timestamp(NaiveDateTime),
  Text(String),
}

impl Value {
  pub fn text(s: impl Into<String>) -> Self { Self::Text(s.into()) }

  pub fn is_null(&self) -> bool { matches!(self, Self::Null) }

  /// Interpret the value as a point in time.
  ///
  /// Dates are taken as midnight; text is parsed with [`parse_temporal`].
  pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
    match self {
      Self::Timestamp(ts) => Some(*ts),
      Self::Date(d) => Some(d.and_time(NaiveTime::MIN)),
      Self::Text(s) => parse_temporal(s),
      _ => None,
    }
  }

  fn as_f64(&self) -> Option<f64> {
    match self {
      Self::Int(n) => Some(*n as f64),
      Self::Float(f) => Some(*f),
      Self::Bool(b) => Some(i64::from(*b) as f64),
      _ => None,
    }
  }

  /// Canonical text form used for uniqueness and referential comparisons.
  ///
  /// Integral floats collapse onto the integer form so that `5` and `5.0`
  /// refer to the same key. Returns `None` for null.
  pub fn key(&self) -> Option<String> {
    match self {
      Self::Null => None,
      Self::Float(f) if f.is_finite() && f.fract() == 0.0 => {
        Some((*f as i64).to_string())
      }
      other => Some(other.to_string()),
    }
  }

  /// SQL-style comparison. `None` when either side is null or the two values
  /// are not comparable.
  pub fn compare(&self, other: &Value) -> Option<Ordering> {
    use Value::*;
    match (self, other) {
      (Null, _) | (_, Null) => None,
      (Text(a), Text(b)) => Some(a.cmp(b)),
      (Bool(a), Bool(b)) => Some(a.cmp(b)),
      (Date(_) | Timestamp(_), _) | (_, Date(_) | Timestamp(_)) => {
        self.as_timestamp()?.partial_cmp(&other.as_timestamp()?)
      }
      _ => self.as_f64()?.partial_cmp(&other.as_f64()?),
    }
  }
}

impl fmt::Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Null => f.write_str("null"),
      Self::Bool(b) => write!(f, "{b}"),
      Self::Int(n) => write!(f, "{n}"),
      Self::Float(x) => write!(f, "{x}"),
      Self::Date(d) => write!(f, "{}", d.format(DATE_FORMAT)),
      Self::Timestamp(ts) => write!(f, "{}", ts.format(TIMESTAMP_FORMAT)),
      Self::Text(s) => f.write_str(s),
    }
  }
}

impl From<bool> for Value {
  fn from(b: bool) -> Self { Self::Bool(b) }
}

impl From<i32> for Value {
  fn from(n: i32) -> Self { Self::Int(i64::from(n)) }
}

impl From<i64> for Value {
  fn from(n: i64) -> Self { Self::Int(n) }
}

impl From<f64> for Value {
  fn from(x: f64) -> Self { Self::Float(x) }
}

impl From<&str> for Value {
  fn from(s: &str) -> Self { Self::Text(s.to_owned()) }
}

impl From<String> for Value {
  fn from(s: String) -> Self { Self::Text(s) }
}

impl From<NaiveDate> for Value {
  fn from(d: NaiveDate) -> Self { Self::Date(d) }
}

impl From<NaiveDateTime> for Value {
  fn from(ts: NaiveDateTime) -> Self { Self::Timestamp(ts) }
}

impl<T: Into<Value>> From<Option<T>> for Value {
  fn from(v: Option<T>) -> Self { v.map_or(Self::Null, Into::into) }
}

// ─── Temporal parsing ────────────────────────────────────────────────────────

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Parse the date and timestamp spellings the source extracts use.
pub fn parse_temporal(s: &str) -> Option<NaiveDateTime> {
  let s = s.trim();
  for fmt in [TIMESTAMP_FORMAT, "%Y-%m-%dT%H:%M:%S%.f"] {
    if let Ok(ts) = NaiveDateTime::parse_from_str(s, fmt) {
      return Some(ts);
    }
  }
  NaiveDate::parse_from_str(s, DATE_FORMAT)
    .ok()
    .map(|d| d.and_time(NaiveTime::MIN))
}

// ─── DataType ────────────────────────────────────────────────────────────────

/// Declared type of a staged column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
  Integer,
  Float,
  #[default]
  Text,
  Boolean,
  Date,
  Timestamp,
}

// ─── Row ─────────────────────────────────────────────────────────────────────

static NULL: Value = Value::Null;

/// One record, keyed by column name. Missing columns read as null.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(BTreeMap<String, Value>);

impl Row {
  pub fn new() -> Self { Self::default() }

  pub fn get(&self, column: &str) -> &Value { self.0.get(column).unwrap_or(&NULL) }

  pub fn insert(&mut self, column: impl Into<String>, value: impl Into<Value>) {
    self.0.insert(column.into(), value.into());
  }

  /// Builder-style [`Row::insert`].
  pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
    self.insert(column, value);
    self
  }

  pub fn contains(&self, column: &str) -> bool { self.0.contains_key(column) }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
    self.0.iter().map(|(k, v)| (k.as_str(), v))
  }

  pub fn len(&self) -> usize { self.0.len() }

  pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl FromIterator<(String, Value)> for Row {
  fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
    Self(iter.into_iter().collect())
  }
}

// ─── Relation ────────────────────────────────────────────────────────────────

/// A named, fully materialised set of rows.
#[derive(Debug, Clone, Default)]
pub struct Relation {
  pub name:    String,
  pub columns: Vec<String>,
  /// Column that identifies a row in check samples, if the relation has one.
  pub key:     Option<String>,
  pub rows:    Vec<Row>,
}

impl Relation {
  pub fn new(name: impl Into<String>, columns: Vec<String>, rows: Vec<Row>) -> Self {
    Self { name: name.into(), columns, key: None, rows }
  }

  pub fn with_key(mut self, key: Option<String>) -> Self {
    self.key = key;
    self
  }

  /// Text identifying `row` in reports: its key when the relation has one,
  /// otherwise `fallback`.
  pub fn describe_row(&self, row: &Row, fallback: &Value) -> String {
    let value = match &self.key {
      Some(key) => row.get(key),
      None => fallback,
    };
    value.to_string()
  }

  pub fn len(&self) -> usize { self.rows.len() }

  pub fn is_empty(&self) -> bool { self.rows.is_empty() }
}
