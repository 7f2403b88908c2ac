//! Per-column coercions applied while mapping raw rows to staged rows.
//!
//! Every function here is total: it accepts any [`Value`] (null included) and
//! never fails. Input a transform does not recognise is passed through
//! unchanged so that anomalies stay visible to the assertion suite instead of
//! silently turning into nulls.

use chrono::{Datelike, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::value::{Value, parse_temporal};

// ─── Transforms ──────────────────────────────────────────────────────────────

/// A named coercion. Columns declare an ordered list, applied left to right.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transform {
  BooleanCoerce,
  DateClean,
  ZeroAsNull,
  StringClean,
  ToInteger,
  ToFloat,
  ToText,
  ToDate,
  ToTimestamp,
}

impl Transform {
  pub fn apply(self, value: Value) -> Value {
    match self {
      Self::BooleanCoerce => boolean_coerce(value),
      Self::DateClean => date_clean(value),
      Self::ZeroAsNull => zero_as_null(value),
      Self::StringClean => string_clean(value),
      Self::ToInteger => to_integer(value),
      Self::ToFloat => to_float(value),
      Self::ToText => to_text(value),
      Self::ToDate => to_date(value),
      Self::ToTimestamp => to_timestamp(value),
    }
  }
}

/// Run `transforms` over `value` in order.
pub fn apply_all(transforms: &[Transform], value: Value) -> Value {
  transforms.iter().fold(value, |v, t| t.apply(v))
}

// ─── Cleaning ────────────────────────────────────────────────────────────────

/// `0 → false`, `1 → true`; every other value is returned as-is.
pub fn boolean_coerce(value: Value) -> Value {
  match value {
    Value::Int(0) => Value::Bool(false),
    Value::Int(1) => Value::Bool(true),
    other => other,
  }
}

/// The source system writes `0001-01-01` to mean "no date".
pub fn is_zero_date(d: NaiveDate) -> bool {
  d.year() == 1 && d.month() == 1 && d.day() == 1
}

/// Null out the sentinel zero date, in any of its stored spellings.
pub fn date_clean(value: Value) -> Value {
  let sentinel = match &value {
    Value::Date(d) => is_zero_date(*d),
    Value::Timestamp(ts) => is_zero_date(ts.date()),
    // MySQL's `0000-00-00` is not a valid calendar date, so it never parses.
    Value::Text(s) => {
      let s = s.trim();
      s.starts_with("0000-00-00")
        || parse_temporal(s).is_some_and(|ts| is_zero_date(ts.date()))
    }
    _ => false,
  };
  if sentinel { Value::Null } else { value }
}

/// `0` means "no reference" for optional foreign keys.
pub fn zero_as_null(value: Value) -> Value {
  match value {
    Value::Int(0) => Value::Null,
    other => other,
  }
}

/// Trim surrounding whitespace; an empty result becomes null.
pub fn string_clean(value: Value) -> Value {
  match value {
    Value::Text(s) => {
      let trimmed = s.trim();
      if trimmed.is_empty() {
        Value::Null
      } else if trimmed.len() == s.len() {
        Value::Text(s)
      } else {
        Value::Text(trimmed.to_owned())
      }
    }
    other => other,
  }
}

// ─── Casts ───────────────────────────────────────────────────────────────────

pub fn to_integer(value: Value) -> Value {
  match value {
    Value::Bool(b) => Value::Int(i64::from(b)),
    Value::Float(f) if f.is_finite() && f.fract() == 0.0 => Value::Int(f as i64),
    Value::Text(ref s) => match s.trim().parse::<i64>() {
      Ok(n) => Value::Int(n),
      Err(_) => value,
    },
    other => other,
  }
}

pub fn to_float(value: Value) -> Value {
  match value {
    Value::Int(n) => Value::Float(n as f64),
    Value::Text(ref s) => match s.trim().parse::<f64>() {
      Ok(x) => Value::Float(x),
      Err(_) => value,
    },
    other => other,
  }
}

pub fn to_text(value: Value) -> Value {
  match value {
    Value::Null | Value::Text(_) => value,
    other => Value::Text(other.to_string()),
  }
}

pub fn to_date(value: Value) -> Value {
  match value {
    Value::Timestamp(ts) => Value::Date(ts.date()),
    Value::Text(ref s) => match parse_temporal(s) {
      Some(ts) => Value::Date(ts.date()),
      None => value,
    },
    other => other,
  }
}

pub fn to_timestamp(value: Value) -> Value {
  match value {
    Value::Date(d) => Value::Timestamp(d.and_time(NaiveTime::MIN)),
    Value::Text(ref s) => match parse_temporal(s) {
      Some(ts) => Value::Timestamp(ts),
      None => value,
    },
    other => other,
  }
}
