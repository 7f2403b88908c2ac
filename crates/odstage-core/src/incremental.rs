//! Row selection for incremental loads.
//!
//! The previous run's high-water mark is read back from the target relation by
//! the caller and passed in explicitly; nothing here touches storage.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::{
  metadata::UPDATED_AT,
  value::{Row, Value},
};

// ─── Configuration ───────────────────────────────────────────────────────────

/// Which source column advances between runs, and where the target keeps it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatermarkConfig {
  /// Source column compared against the previous maximum.
  pub column: String,
  /// Target column whose maximum is the previous high-water mark.
  #[serde(default = "default_target")]
  pub target: String,
}

fn default_target() -> String { UPDATED_AT.to_owned() }

/// Fixed lower bound on the analytical scope of a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CutoffConfig {
  /// Source column the cutoff applies to; defaults to the watermark column.
  pub column: Option<String>,
  pub date:   NaiveDate,
}

// ─── Filter ──────────────────────────────────────────────────────────────────

/// Selects rows with `watermark > last_watermark AND cutoff_value >= cutoff`.
///
/// Either bound may be absent. With no bounds at all every row is selected.
/// Once any bound is set, rows whose compared value is null (or not a date)
/// are dropped; the source leaves some audit columns unset and those rows are
/// knowingly skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IncrementalFilter {
  pub cutoff:         Option<NaiveDateTime>,
  pub last_watermark: Option<NaiveDateTime>,
}

impl IncrementalFilter {
  pub fn new(cutoff: Option<NaiveDate>, last_watermark: Option<NaiveDateTime>) -> Self {
    Self { cutoff: cutoff.map(|d| d.and_time(NaiveTime::MIN)), last_watermark }
  }

  /// Single-column form: the watermark value is also the cutoff value.
  pub fn selects(&self, watermark: &Value) -> bool { self.selects_pair(watermark, watermark) }

  /// Apply the filter to a raw row.
  pub fn selects_row(&self, raw: &Row, watermark_column: &str, cutoff_column: &str) -> bool {
    self.selects_pair(raw.get(watermark_column), raw.get(cutoff_column))
  }

  fn selects_pair(&self, watermark: &Value, cutoff_value: &Value) -> bool {
    let after_watermark = match self.last_watermark {
      Some(w) => watermark.as_timestamp().is_some_and(|v| v > w),
      None => true,
    };
    let within_scope = match self.cutoff {
      Some(c) => cutoff_value.as_timestamp().is_some_and(|v| v >= c),
      None => true,
    };
    after_watermark && within_scope
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn d(y: i32, m: u32, day: u32) -> NaiveDate { NaiveDate::from_ymd_opt(y, m, day).unwrap() }

  fn midnight(y: i32, m: u32, day: u32) -> NaiveDateTime { d(y, m, day).and_time(NaiveTime::MIN) }

  #[test]
  fn selects_only_rows_past_watermark_and_cutoff() {
    let filter = IncrementalFilter::new(Some(d(2023, 1, 1)), Some(midnight(2024, 6, 1)));
    assert!(!filter.selects(&Value::text("2024-05-30")));
    assert!(!filter.selects(&Value::text("2024-06-01")));
    assert!(filter.selects(&Value::text("2024-06-02")));
  }

  #[test]
  fn empty_target_degrades_to_cutoff() {
    let filter = IncrementalFilter::new(Some(d(2023, 1, 1)), None);
    assert!(!filter.selects(&Value::text("2022-12-31 23:59:59")));
    assert!(filter.selects(&Value::text("2023-01-01")));
    assert!(!filter.selects(&Value::Date(d(2019, 1, 1))));
  }

  #[test]
  fn no_bounds_selects_everything() {
    let filter = IncrementalFilter::default();
    assert!(filter.selects(&Value::Null));
    assert!(filter.selects(&Value::text("garbage")));
  }

  #[test]
  fn null_watermark_is_excluded_once_bounded() {
    let filter = IncrementalFilter::new(None, Some(midnight(2024, 1, 1)));
    assert!(!filter.selects(&Value::Null));
    let filter = IncrementalFilter::new(Some(d(2023, 1, 1)), None);
    assert!(!filter.selects(&Value::Null));
  }

  #[test]
  fn cutoff_can_use_a_separate_column() {
    let filter = IncrementalFilter::new(Some(d(2023, 1, 1)), Some(midnight(2024, 6, 1)));
    let raw = Row::new()
      .with("DateTStamp", "2024-06-05 08:00:00")
      .with("ProcDate", "2022-11-30");
    assert!(!filter.selects_row(&raw, "DateTStamp", "ProcDate"));
    assert!(filter.selects_row(&raw, "DateTStamp", "DateTStamp"));
  }

  #[test]
  fn matches_the_exhaustive_predicate() {
    let w = midnight(2024, 6, 1);
    let c = midnight(2023, 1, 1);
    let filter = IncrementalFilter { cutoff: Some(c), last_watermark: Some(w) };
    let mut day = d(2022, 12, 1);
    while day < d(2024, 7, 1) {
      let v = day.and_hms_opt(12, 0, 0).unwrap();
      assert_eq!(filter.selects(&Value::Timestamp(v)), v > w && v >= c, "{v}");
      day = day.succ_opt().unwrap();
    }
  }
}
