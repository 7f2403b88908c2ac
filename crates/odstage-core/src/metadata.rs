//! Standard audit columns appended to every staged row.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::{
  coerce::{date_clean, to_timestamp, zero_as_null},
  value::{DataType, Row, Value},
};

pub const LOADED_AT: &str = "_loaded_at";
pub const CREATED_AT: &str = "_created_at";
pub const UPDATED_AT: &str = "_updated_at";
pub const CREATED_BY: &str = "_created_by";

/// Names of every audit column a model may emit.
pub const AUDIT_COLUMNS: [&str; 4] = [LOADED_AT, CREATED_AT, UPDATED_AT, CREATED_BY];

/// Source columns feeding the audit columns. Any of them may be absent; not
/// every raw table tracks who created a row or when.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetadataSpec {
  pub created_at: Option<String>,
  pub updated_at: Option<String>,
  pub created_by: Option<String>,
}

impl MetadataSpec {
  /// Audit columns emitted for this model, with their declared types.
  pub fn columns(&self) -> Vec<(&'static str, DataType)> {
    let mut cols = vec![
      (LOADED_AT, DataType::Timestamp),
      (CREATED_AT, DataType::Timestamp),
      (UPDATED_AT, DataType::Timestamp),
    ];
    if self.created_by.is_some() {
      cols.push((CREATED_BY, DataType::Integer));
    }
    cols
  }

  /// Compute the audit values for one raw row.
  ///
  /// `_created_at` falls back to the updated column and then to `run_time`;
  /// `_updated_at` falls back the other way round.
  pub fn standardize(&self, raw: &Row, run_time: NaiveDateTime) -> Vec<(&'static str, Value)> {
    let created = self.created_at.as_deref().and_then(|c| clean_timestamp(raw.get(c)));
    let updated = self.updated_at.as_deref().and_then(|c| clean_timestamp(raw.get(c)));

    let mut out = vec![
      (LOADED_AT, Value::Timestamp(run_time)),
      (CREATED_AT, Value::Timestamp(created.or(updated).unwrap_or(run_time))),
      (UPDATED_AT, Value::Timestamp(updated.or(created).unwrap_or(run_time))),
    ];
    if let Some(col) = &self.created_by {
      out.push((CREATED_BY, zero_as_null(raw.get(col).clone())));
    }
    out
  }
}

/// `None` when the value is null, the zero date, or not a timestamp at all.
fn clean_timestamp(value: &Value) -> Option<NaiveDateTime> {
  match to_timestamp(date_clean(value.clone())) {
    Value::Timestamp(ts) => Some(ts),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use chrono::NaiveDate;

  use super::*;

  fn ts(y: i32, m: u32, d: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(0, 0, 0).unwrap()
  }

  fn spec() -> MetadataSpec {
    MetadataSpec {
      created_at: Some("SecDateEntry".into()),
      updated_at: Some("DateTStamp".into()),
      created_by: Some("SecUserNumEntry".into()),
    }
  }

  fn lookup<'a>(cols: &'a [(&'static str, Value)], name: &str) -> &'a Value {
    &cols.iter().find(|(n, _)| *n == name).unwrap().1
  }

  #[test]
  fn uses_source_columns_when_present() {
    let now = ts(2024, 7, 1);
    let raw = Row::new()
      .with("SecDateEntry", "2020-01-02")
      .with("DateTStamp", "2024-06-01 10:00:00")
      .with("SecUserNumEntry", 12);
    let cols = spec().standardize(&raw, now);

    assert_eq!(lookup(&cols, LOADED_AT), &Value::Timestamp(now));
    assert_eq!(lookup(&cols, CREATED_AT), &Value::Timestamp(ts(2020, 1, 2)));
    assert_eq!(
      lookup(&cols, UPDATED_AT),
      &Value::Timestamp(ts(2024, 6, 1) + chrono::Duration::hours(10))
    );
    assert_eq!(lookup(&cols, CREATED_BY), &Value::Int(12));
  }

  #[test]
  fn zero_date_created_falls_back_to_updated() {
    let raw = Row::new()
      .with("SecDateEntry", "0001-01-01")
      .with("DateTStamp", "2024-06-01");
    let cols = spec().standardize(&raw, ts(2024, 7, 1));
    assert_eq!(lookup(&cols, CREATED_AT), &Value::Timestamp(ts(2024, 6, 1)));
  }

  #[test]
  fn missing_sources_fall_back_to_run_time() {
    let now = ts(2024, 7, 1);
    let cols = MetadataSpec::default().standardize(&Row::new(), now);
    assert_eq!(cols.len(), 3);
    assert_eq!(lookup(&cols, CREATED_AT), &Value::Timestamp(now));
    assert_eq!(lookup(&cols, UPDATED_AT), &Value::Timestamp(now));
  }

  #[test]
  fn system_user_zero_becomes_null() {
    let raw = Row::new().with("SecUserNumEntry", 0);
    let cols = spec().standardize(&raw, ts(2024, 7, 1));
    assert_eq!(lookup(&cols, CREATED_BY), &Value::Null);
  }

  #[test]
  fn created_by_column_only_when_configured() {
    assert_eq!(MetadataSpec::default().columns().len(), 3);
    assert_eq!(spec().columns().len(), 4);
  }
}
