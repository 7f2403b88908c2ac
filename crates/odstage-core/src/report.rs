//! Per-run results: what each model built and how each check fared.

use std::{collections::BTreeSet, fmt};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::assertion::Severity;

// ─── Check results ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
  Pass,
  /// Failed, but the check is advisory.
  Warn,
  /// Failed an `error`-severity check.
  Fail,
}

impl fmt::Display for CheckStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Pass => "PASS",
      Self::Warn => "WARN",
      Self::Fail => "FAIL",
    })
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
  pub name:     String,
  pub model:    String,
  pub column:   Option<String>,
  pub test:     String,
  pub severity: Severity,
  pub status:   CheckStatus,
  /// Number of failing rows (or duplicated keys, for uniqueness checks).
  pub failures: usize,
  pub samples:  Vec<String>,
  pub note:     Option<String>,
  /// Set when the check could not be evaluated normally.
  pub message:  Option<String>,
}

// ─── Model outcomes ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStrategy {
  /// Replace the relation's contents.
  Replace,
  /// Upsert keyed on the unique key.
  Merge,
  /// Insert only.
  Append,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelOutcome {
  pub model:          String,
  pub strategy:       WriteStrategy,
  pub last_watermark: Option<NaiveDateTime>,
  pub source_rows:    usize,
  /// Rows that passed the incremental filter.
  pub selected_rows:  usize,
  /// Size of the relation the checks ran against.
  pub relation_rows:  usize,
  pub published:      bool,
}

// ─── Run report ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
  /// Build, check, publish.
  Run,
  /// Check published relations only.
  Test,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
  pub run_id:     Uuid,
  pub kind:       RunKind,
  pub started_at: NaiveDateTime,
  pub models:     Vec<ModelOutcome>,
  pub checks:     Vec<CheckResult>,
}

impl RunReport {
  pub fn new(kind: RunKind, started_at: NaiveDateTime) -> Self {
    Self { run_id: Uuid::new_v4(), kind, started_at, models: Vec::new(), checks: Vec::new() }
  }

  pub fn count(&self, status: CheckStatus) -> usize {
    self.checks.iter().filter(|c| c.status == status).count()
  }

  /// True when any `error`-severity check failed.
  pub fn has_failures(&self) -> bool { self.count(CheckStatus::Fail) > 0 }

  /// Models with at least one failing `error`-severity check.
  pub fn blocked_models(&self) -> BTreeSet<&str> {
    self
      .checks
      .iter()
      .filter(|c| c.status == CheckStatus::Fail)
      .map(|c| c.model.as_str())
      .collect()
  }

  /// One-line totals, e.g. `PASS=12 WARN=2 FAIL=0 TOTAL=14`.
  pub fn summary(&self) -> String {
    format!(
      "PASS={} WARN={} FAIL={} TOTAL={}",
      self.count(CheckStatus::Pass),
      self.count(CheckStatus::Warn),
      self.count(CheckStatus::Fail),
      self.checks.len()
    )
  }
}
