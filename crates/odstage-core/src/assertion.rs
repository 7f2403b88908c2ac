//! Declarative data-quality checks and their evaluator.
//!
//! Checks are plain data read from model files. Each one is evaluated on its
//! own over a fully materialised relation; no check can stop another from
//! running, so a run always reports the complete picture.

use std::{
  cmp::Ordering,
  collections::{HashMap, HashSet},
  fmt,
  hash::BuildHasher,
};

use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  report::{CheckResult, CheckStatus},
  value::{Relation, Row, Value},
};

/// Maximum number of failing rows quoted in a result.
pub const SAMPLE_LIMIT: usize = 5;

// ─── Severity ────────────────────────────────────────────────────────────────

/// `error` blocks publication of the model; `warn` is recorded only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  #[default]
  Error,
  Warn,
}

impl fmt::Display for Severity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Error => "error",
      Self::Warn => "warn",
    })
  }
}

// ─── Operators ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
  #[serde(rename = "=")]
  Eq,
  #[serde(rename = "!=")]
  Ne,
  #[serde(rename = ">")]
  Gt,
  #[serde(rename = ">=")]
  Ge,
  #[serde(rename = "<")]
  Lt,
  #[serde(rename = "<=")]
  Le,
}

impl CompareOp {
  pub fn holds(self, ord: Ordering) -> bool {
    match self {
      Self::Eq => ord == Ordering::Equal,
      Self::Ne => ord != Ordering::Equal,
      Self::Gt => ord == Ordering::Greater,
      Self::Ge => ord != Ordering::Less,
      Self::Lt => ord == Ordering::Less,
      Self::Le => ord != Ordering::Greater,
    }
  }

  pub fn symbol(self) -> &'static str {
    match self {
      Self::Eq => "=",
      Self::Ne => "!=",
      Self::Gt => ">",
      Self::Ge => ">=",
      Self::Lt => "<",
      Self::Le => "<=",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionOp {
  Compare(CompareOp),
  Null(NullTest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullTest {
  IsNull,
  NotNull,
}

// ─── Conditions ──────────────────────────────────────────────────────────────

/// One clause of a check's `where` list. Clauses are ANDed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Condition {
  pub column: String,
  pub op:     ConditionOp,
  #[serde(default)]
  pub value:  Value,
}

impl Condition {
  /// Null on either side of a comparison is unknown, and unknown does not
  /// match, as in SQL.
  pub fn matches(&self, row: &Row) -> bool {
    let left = row.get(&self.column);
    match self.op {
      ConditionOp::Null(NullTest::IsNull) => left.is_null(),
      ConditionOp::Null(NullTest::NotNull) => !left.is_null(),
      ConditionOp::Compare(op) => left.compare(&self.value).is_some_and(|o| op.holds(o)),
    }
  }
}

// ─── Check definitions ───────────────────────────────────────────────────────

fn yes() -> bool { true }

/// What a check asserts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "test", rename_all = "snake_case")]
pub enum CheckKind {
  Unique,
  NotNull,
  AcceptedValues {
    values: Vec<Value>,
  },
  AcceptedRange {
    #[serde(default)]
    min:       Option<Value>,
    #[serde(default)]
    max:       Option<Value>,
    #[serde(default = "yes")]
    inclusive: bool,
  },
  /// Every non-null value must exist in `to.field`.
  Relationships {
    to:    String,
    field: String,
  },
  /// Row-wise comparison between two columns, e.g. `_updated_at >= _created_at`.
  ColumnComparison {
    left:  String,
    op:    CompareOp,
    right: String,
  },
  UniqueCombination {
    columns: Vec<String>,
  },
}

impl CheckKind {
  pub fn label(&self) -> &'static str {
    match self {
      Self::Unique => "unique",
      Self::NotNull => "not_null",
      Self::AcceptedValues { .. } => "accepted_values",
      Self::AcceptedRange { .. } => "accepted_range",
      Self::Relationships { .. } => "relationships",
      Self::ColumnComparison { .. } => "column_comparison",
      Self::UniqueCombination { .. } => "unique_combination",
    }
  }

  fn needs_column(&self) -> bool {
    !matches!(self, Self::ColumnComparison { .. } | Self::UniqueCombination { .. })
  }

  /// Columns of the tested relation this check reads, besides `where` clauses.
  pub fn referenced_columns<'a>(&'a self, column: Option<&'a str>) -> Vec<&'a str> {
    match self {
      Self::ColumnComparison { left, right, .. } => vec![left.as_str(), right.as_str()],
      Self::UniqueCombination { columns } => columns.iter().map(String::as_str).collect(),
      _ => column.into_iter().collect(),
    }
  }
}

/// A test as written in a model file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestDef {
  #[serde(flatten)]
  pub kind:       CheckKind,
  /// Tested column. Implied for tests attached to a column.
  #[serde(default)]
  pub column:     Option<String>,
  #[serde(default)]
  pub name:       Option<String>,
  #[serde(default)]
  pub severity:   Severity,
  #[serde(default, rename = "where")]
  pub conditions: Vec<Condition>,
  /// Documented exceptions: why this check is advisory, which rows are known
  /// to violate it.
  #[serde(default)]
  pub note:       Option<String>,
}

/// Either a bare test name (`- not_null`) or a full definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TestSpec {
  Name(String),
  Full(TestDef),
}

impl TestSpec {
  /// Resolve into a [`Check`] for `model`, with `column` as the implied
  /// column for column-attached tests.
  pub fn resolve(&self, model: &str, column: Option<&str>) -> Result<Check> {
    let def = match self {
      Self::Full(def) => def.clone(),
      Self::Name(name) => {
        let kind = match name.as_str() {
          "unique" => CheckKind::Unique,
          "not_null" => CheckKind::NotNull,
          other => {
            return Err(Error::invalid(
              model,
              format!("test {other:?} needs arguments and must be written as a mapping"),
            ));
          }
        };
        TestDef {
          kind,
          column: None,
          name: None,
          severity: Severity::default(),
          conditions: Vec::new(),
          note: None,
        }
      }
    };

    let column = def.column.clone().or_else(|| column.map(str::to_owned));
    if def.kind.needs_column() && column.is_none() {
      return Err(Error::invalid(
        model,
        format!("{} test needs a column", def.kind.label()),
      ));
    }

    let name = def.name.clone().unwrap_or_else(|| default_name(model, column.as_deref(), &def.kind));

    Ok(Check {
      name,
      model: model.to_owned(),
      column,
      kind: def.kind,
      severity: def.severity,
      conditions: def.conditions,
      note: def.note,
    })
  }
}

fn default_name(model: &str, column: Option<&str>, kind: &CheckKind) -> String {
  let suffix = match kind {
    CheckKind::ColumnComparison { left, op, right } => {
      let op = match op {
        CompareOp::Eq => "eq",
        CompareOp::Ne => "ne",
        CompareOp::Gt => "gt",
        CompareOp::Ge => "ge",
        CompareOp::Lt => "lt",
        CompareOp::Le => "le",
      };
      format!("{left}_{op}_{right}")
    }
    CheckKind::UniqueCombination { columns } => columns.join("_"),
    CheckKind::Relationships { to, .. } => {
      format!("{}_to_{to}", column.unwrap_or_default())
    }
    _ => column.unwrap_or_default().to_owned(),
  };
  format!("{}_{model}_{suffix}", kind.label())
}

// ─── Resolved checks ─────────────────────────────────────────────────────────

/// A fully resolved check bound to one model.
#[derive(Debug, Clone, PartialEq)]
pub struct Check {
  pub name:       String,
  pub model:      String,
  pub column:     Option<String>,
  pub kind:       CheckKind,
  pub severity:   Severity,
  pub conditions: Vec<Condition>,
  pub note:       Option<String>,
}

/// Resolves relations referenced by `relationships` checks.
pub trait RelationLookup {
  fn relation(&self, name: &str) -> Option<&Relation>;
}

impl<S: BuildHasher> RelationLookup for HashMap<String, Relation, S> {
  fn relation(&self, name: &str) -> Option<&Relation> { self.get(name) }
}

/// Running tally of failing rows.
#[derive(Default)]
struct Failures {
  count:   usize,
  samples: Vec<String>,
}

impl Failures {
  fn push(&mut self, sample: String) {
    self.count += 1;
    if self.samples.len() < SAMPLE_LIMIT {
      self.samples.push(sample);
    }
  }
}

impl Check {
  /// Relation this check needs besides the one it tests, if any.
  pub fn referenced_relation(&self) -> Option<&str> {
    match &self.kind {
      CheckKind::Relationships { to, .. } => Some(to),
      _ => None,
    }
  }

  /// Evaluate the check over `relation`.
  pub fn evaluate(&self, relation: &Relation, lookup: &dyn RelationLookup) -> CheckResult {
    let rows: Vec<&Row> = relation
      .rows
      .iter()
      .filter(|row| self.conditions.iter().all(|c| c.matches(row)))
      .collect();

    let column = self.column.as_deref().unwrap_or_default();
    let mut failures = Failures::default();
    let mut message = None;

    match &self.kind {
      CheckKind::NotNull => {
        for row in &rows {
          if row.get(column).is_null() {
            failures.push(relation.describe_row(row, &Value::Null));
          }
        }
      }

      CheckKind::Unique => {
        let values = rows.iter().map(|row| row.get(column).key());
        for dup in duplicates(values) {
          failures.push(dup);
        }
      }

      CheckKind::UniqueCombination { columns } => {
        let values = rows.iter().map(|row| {
          let parts: Vec<String> = columns
            .iter()
            .map(|c| row.get(c).key().unwrap_or_else(|| "null".to_owned()))
            .collect();
          Some(parts.join(", "))
        });
        for dup in duplicates(values) {
          failures.push(format!("({dup})"));
        }
      }

      CheckKind::AcceptedValues { values } => {
        let allowed: HashSet<String> = values.iter().filter_map(Value::key).collect();
        for row in &rows {
          let v = row.get(column);
          if let Some(key) = v.key()
            && !allowed.contains(&key)
          {
            failures.push(format!("{} = {v}", relation.describe_row(row, v)));
          }
        }
      }

      CheckKind::AcceptedRange { min, max, inclusive } => {
        for row in &rows {
          let v = row.get(column);
          if v.is_null() {
            continue;
          }
          let above_min = min.as_ref().is_none_or(|m| bound_holds(v, m, *inclusive, Ordering::Greater));
          let below_max = max.as_ref().is_none_or(|m| bound_holds(v, m, *inclusive, Ordering::Less));
          if !(above_min && below_max) {
            failures.push(format!("{} = {v}", relation.describe_row(row, v)));
          }
        }
      }

      CheckKind::Relationships { to, field } => match lookup.relation(to) {
        Some(parent) => {
          let keys: HashSet<String> =
            parent.rows.iter().filter_map(|r| r.get(field).key()).collect();
          for row in &rows {
            let v = row.get(column);
            if let Some(key) = v.key()
              && !keys.contains(&key)
            {
              failures.push(format!("{} -> {v}", relation.describe_row(row, v)));
            }
          }
        }
        None => {
          message = Some(format!("referenced relation {to:?} is not available"));
          for row in &rows {
            let v = row.get(column);
            if !v.is_null() {
              failures.push(relation.describe_row(row, v));
            }
          }
        }
      },

      CheckKind::ColumnComparison { left, op, right } => {
        for row in &rows {
          let (l, r) = (row.get(left), row.get(right));
          if l.is_null() || r.is_null() {
            continue;
          }
          if !l.compare(r).is_some_and(|o| op.holds(o)) {
            failures.push(format!(
              "{}: {l} {} {r}",
              relation.describe_row(row, l),
              op.symbol()
            ));
          }
        }
      }
    }

    let status = match (failures.count, message.is_some(), self.severity) {
      (0, false, _) => CheckStatus::Pass,
      (_, _, Severity::Warn) => CheckStatus::Warn,
      (_, _, Severity::Error) => CheckStatus::Fail,
    };

    CheckResult {
      name: self.name.clone(),
      model: self.model.clone(),
      column: self.column.clone(),
      test: self.kind.label().to_owned(),
      severity: self.severity,
      status,
      failures: failures.count,
      samples: failures.samples,
      note: self.note.clone(),
      message,
    }
  }
}

/// `ordering` is the side of `bound` the value must lie on.
fn bound_holds(v: &Value, bound: &Value, inclusive: bool, ordering: Ordering) -> bool {
  match v.compare(bound) {
    Some(Ordering::Equal) => inclusive,
    Some(o) => o == ordering,
    None => false,
  }
}

/// Keys that occur more than once, in first-seen order. Nulls are ignored.
fn duplicates(values: impl Iterator<Item = Option<String>>) -> Vec<String> {
  let mut counts: HashMap<String, usize> = HashMap::new();
  let mut order = Vec::new();
  for key in values.flatten() {
    let n = counts.entry(key.clone()).or_insert(0);
    *n += 1;
    if *n == 2 {
      order.push(key);
    }
  }
  order
}
