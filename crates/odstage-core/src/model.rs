//! Staging model definitions and the project that holds them.
//!
//! A model is pure configuration: one raw source relation, a column mapping,
//! a load strategy and a list of checks. Models are written in YAML files
//! under a `models:` key, several per file if convenient.

use std::{
  collections::{HashMap, HashSet},
  fs,
  path::{Path, PathBuf},
  str::FromStr,
};

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

use crate::{
  Error, Result,
  assertion::{Check, TestSpec},
  coerce::{Transform, apply_all},
  incremental::{CutoffConfig, IncrementalFilter, WatermarkConfig},
  metadata::{AUDIT_COLUMNS, MetadataSpec},
  report::WriteStrategy,
  value::{DataType, Relation, Row, Value},
};

// ─── Columns ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnDef {
  /// Target column name.
  pub name:        String,
  /// Source column name; defaults to `name`.
  #[serde(default)]
  pub source:      Option<String>,
  #[serde(default, rename = "type")]
  pub data_type:   DataType,
  #[serde(default)]
  pub transforms:  Vec<Transform>,
  #[serde(default)]
  pub description: Option<String>,
  #[serde(default)]
  pub tests:       Vec<TestSpec>,
}

impl ColumnDef {
  pub fn source_column(&self) -> &str { self.source.as_deref().unwrap_or(&self.name) }
}

// ─── Joins ───────────────────────────────────────────────────────────────────

/// A second raw relation left-joined onto the model source.
///
/// Joined columns are exposed to the column mapper as `<source>.<column>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinConfig {
  pub source: String,
  /// Column of the model source.
  pub left:   String,
  /// Column of the joined relation.
  pub right:  String,
}

impl JoinConfig {
  pub fn qualify(&self, column: &str) -> String { format!("{}.{column}", self.source) }

  /// Left-join `joined` onto `rows`. The first joined row per key wins; null
  /// keys never match.
  pub fn apply(&self, rows: &[Row], joined: &Relation) -> Vec<Row> {
    let mut index: HashMap<String, &Row> = HashMap::new();
    for row in &joined.rows {
      if let Some(key) = row.get(&self.right).key() {
        index.entry(key).or_insert(row);
      }
    }

    rows
      .iter()
      .map(|row| {
        let matched = row.get(&self.left).key().and_then(|k| index.get(&k).copied());
        let mut out = row.clone();
        for column in &joined.columns {
          let value = matched.map_or(Value::Null, |m| m.get(column).clone());
          out.insert(self.qualify(column), value);
        }
        out
      })
      .collect()
  }
}

// ─── Models ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Materialization {
  /// Rebuilt from the full source on every run.
  #[default]
  Table,
  /// Only rows past the previous watermark are loaded.
  Incremental,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelDef {
  pub name:         String,
  /// Raw relation the model reads.
  pub source:       String,
  #[serde(default)]
  pub description:  Option<String>,
  #[serde(default)]
  pub materialized: Materialization,
  /// Upsert key for incremental models. Without one, incremental loads are
  /// insert-only.
  #[serde(default)]
  pub unique_key:   Option<String>,
  #[serde(default)]
  pub schema:       Option<String>,
  #[serde(default)]
  pub tags:         Vec<String>,
  #[serde(default)]
  pub watermark:    Option<WatermarkConfig>,
  #[serde(default)]
  pub cutoff:       Option<CutoffConfig>,
  #[serde(default)]
  pub join:         Option<JoinConfig>,
  #[serde(default)]
  pub metadata:     MetadataSpec,
  pub columns:      Vec<ColumnDef>,
  /// Model-level tests; they name their own columns.
  #[serde(default)]
  pub tests:        Vec<TestSpec>,
}

impl Materialization {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Table => "table",
      Self::Incremental => "incremental",
    }
  }
}

impl ModelDef {
  /// `schema.name` when a schema is set.
  pub fn qualified_name(&self) -> String {
    match &self.schema {
      Some(schema) => format!("{schema}.{}", self.name),
      None => self.name.clone(),
    }
  }

  pub fn has_tag(&self, tag: &str) -> bool { self.tags.iter().any(|t| t == tag) }

  /// How new rows reach the target relation.
  pub fn strategy(&self, full_refresh: bool) -> WriteStrategy {
    match (self.materialized, &self.unique_key) {
      (Materialization::Table, _) => WriteStrategy::Replace,
      _ if full_refresh => WriteStrategy::Replace,
      (Materialization::Incremental, Some(_)) => WriteStrategy::Merge,
      (Materialization::Incremental, None) => WriteStrategy::Append,
    }
  }

  /// Every column of the staged relation, mapped columns first.
  pub fn output_columns(&self) -> Vec<(String, DataType)> {
    self
      .columns
      .iter()
      .map(|c| (c.name.clone(), c.data_type))
      .chain(
        self
          .metadata
          .columns()
          .into_iter()
          .map(|(n, t)| (n.to_owned(), t)),
      )
      .collect()
  }

  pub fn column_names(&self) -> Vec<String> {
    self.output_columns().into_iter().map(|(n, _)| n).collect()
  }

  /// Rename and coerce one raw row, then append audit columns.
  pub fn map_row(&self, raw: &Row, run_time: NaiveDateTime) -> Row {
    let mut row = Row::new();
    for col in &self.columns {
      let value = apply_all(&col.transforms, raw.get(col.source_column()).clone());
      row.insert(col.name.clone(), value);
    }
    for (name, value) in self.metadata.standardize(raw, run_time) {
      row.insert(name, value);
    }
    row
  }

  /// Source column the cutoff is compared against, if any.
  fn cutoff_column(&self) -> Option<&str> {
    self
      .cutoff
      .as_ref()
      .and_then(|c| c.column.as_deref())
      .or(self.watermark.as_ref().map(|w| w.column.as_str()))
  }

  /// Build the row filter for this run.
  ///
  /// `default_cutoff` applies when the model names no cutoff date of its own
  /// but has a column to compare one against.
  pub fn filter(
    &self,
    last_watermark: Option<NaiveDateTime>,
    default_cutoff: Option<NaiveDate>,
  ) -> IncrementalFilter {
    let cutoff = match &self.cutoff {
      Some(c) => Some(c.date),
      None if self.cutoff_column().is_some() => default_cutoff,
      None => None,
    };
    let last_watermark = self.watermark.as_ref().and(last_watermark);
    IncrementalFilter::new(cutoff, last_watermark)
  }

  /// Whether `filter` keeps the raw row.
  pub fn selects(&self, filter: &IncrementalFilter, raw: &Row) -> bool {
    let watermark = self.watermark.as_ref().map(|w| w.column.as_str());
    let cutoff = self.cutoff_column();
    match (watermark, cutoff) {
      (Some(w), Some(c)) => filter.selects_row(raw, w, c),
      (None, Some(c)) => filter.selects_row(raw, c, c),
      _ => true,
    }
  }

  /// Resolve column-level and model-level tests.
  pub fn checks(&self) -> Result<Vec<Check>> {
    let column_checks = self
      .columns
      .iter()
      .flat_map(|c| c.tests.iter().map(move |t| t.resolve(&self.name, Some(c.name.as_str()))));
    let model_checks = self.tests.iter().map(|t| t.resolve(&self.name, None));
    column_checks.chain(model_checks).collect()
  }

  /// Relations referenced by this model's `relationships` checks.
  pub fn references(&self) -> Result<Vec<String>> {
    Ok(
      self
        .checks()?
        .iter()
        .filter_map(|c| c.referenced_relation().map(str::to_owned))
        .collect(),
    )
  }

  pub fn validate(&self) -> Result<()> {
    let fail = |reason: String| Err(Error::invalid(&self.name, reason));

    if self.name.trim().is_empty() {
      return Err(Error::invalid("<unnamed>", "model name is empty"));
    }
    if self.source.trim().is_empty() {
      return fail("source relation is empty".into());
    }
    if self.columns.is_empty() {
      return fail("no columns declared".into());
    }

    let mut seen = HashSet::new();
    for col in &self.columns {
      if AUDIT_COLUMNS.contains(&col.name.as_str()) {
        return fail(format!("column {:?} collides with an audit column", col.name));
      }
      if !seen.insert(col.name.as_str()) {
        return fail(format!("column {:?} declared twice", col.name));
      }
    }

    let outputs: HashSet<String> = self.column_names().into_iter().collect();

    if let Some(key) = &self.unique_key
      && !outputs.contains(key)
    {
      return fail(format!("unique_key {key:?} is not a declared column"));
    }

    match (&self.watermark, self.materialized) {
      (None, Materialization::Incremental) => {
        return fail("incremental models need a watermark".into());
      }
      (Some(w), _) if !outputs.contains(&w.target) => {
        return fail(format!("watermark target {:?} is not an output column", w.target));
      }
      _ => {}
    }

    if let Some(join) = &self.join
      && [&join.source, &join.left, &join.right].iter().any(|s| s.trim().is_empty())
    {
      return fail("join needs a source, a left column and a right column".into());
    }

    if self.cutoff.is_some() && self.cutoff_column().is_none() {
      return fail("cutoff needs a column when the model has no watermark".into());
    }

    let mut names = HashSet::new();
    for check in self.checks()? {
      if !names.insert(check.name.clone()) {
        return fail(format!("check {:?} defined twice; give one an explicit name", check.name));
      }
      let cols = check
        .kind
        .referenced_columns(check.column.as_deref())
        .into_iter()
        .chain(check.conditions.iter().map(|c| c.column.as_str()));
      for col in cols {
        if !outputs.contains(col) {
          return fail(format!("check {:?} reads unknown column {col:?}", check.name));
        }
      }
    }

    Ok(())
  }
}

// ─── Selection ───────────────────────────────────────────────────────────────

/// `name` selects one model; `tag:x` selects every model tagged `x`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
  Name(String),
  Tag(String),
}

impl FromStr for Selector {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let s = s.trim();
    match s.strip_prefix("tag:") {
      Some("") => Err(Error::InvalidSelector(s.to_owned())),
      Some(tag) => Ok(Self::Tag(tag.to_owned())),
      None if s.is_empty() => Err(Error::InvalidSelector(s.to_owned())),
      None => Ok(Self::Name(s.to_owned())),
    }
  }
}

// ─── Project ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModelFile {
  #[serde(default)]
  models: Vec<ModelDef>,
}

/// A validated set of models, in build order.
#[derive(Debug, Clone, Default)]
pub struct Project {
  models: Vec<ModelDef>,
}

impl Project {
  pub fn new(models: Vec<ModelDef>) -> Result<Self> {
    let mut names = HashSet::new();
    let mut check_owners: HashMap<String, &str> = HashMap::new();
    for model in &models {
      model.validate()?;
      if !names.insert(model.name.clone()) {
        return Err(Error::DuplicateModel(model.name.clone()));
      }
      // Run history keys check results by name.
      for check in model.checks()? {
        if let Some(owner) = check_owners.insert(check.name.clone(), &model.name) {
          return Err(Error::invalid(
            &model.name,
            format!("check {:?} is already defined by model {owner:?}", check.name),
          ));
        }
      }
    }
    Ok(Self { models: build_order(models)? })
  }

  /// Parse a single YAML document with a `models:` list.
  pub fn from_yaml(text: &str) -> Result<Self> {
    let file: ModelFile = serde_yaml::from_str(text)
      .map_err(|source| Error::Yaml { path: PathBuf::from("<inline>"), source })?;
    Self::new(file.models)
  }

  /// Load every `*.yml` / `*.yaml` file below `dir`, in path order.
  pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
    let mut files = Vec::new();
    collect_yaml_files(dir.as_ref(), &mut files)?;
    files.sort();

    let mut models = Vec::new();
    for path in files {
      let text = fs::read_to_string(&path)
        .map_err(|source| Error::Io { path: path.clone(), source })?;
      let file: ModelFile =
        serde_yaml::from_str(&text).map_err(|source| Error::Yaml { path: path.clone(), source })?;
      tracing::debug!(path = %path.display(), models = file.models.len(), "loaded model file");
      models.extend(file.models);
    }
    Self::new(models)
  }

  pub fn models(&self) -> &[ModelDef] { &self.models }

  pub fn get(&self, name: &str) -> Option<&ModelDef> { self.models.iter().find(|m| m.name == name) }

  /// Models matching any selector, in build order. No selectors selects all.
  pub fn select(&self, selectors: &[Selector]) -> Result<Vec<&ModelDef>> {
    if selectors.is_empty() {
      return Ok(self.models.iter().collect());
    }
    for sel in selectors {
      if let Selector::Name(name) = sel
        && self.get(name).is_none()
      {
        return Err(Error::UnknownModel(name.clone()));
      }
    }
    Ok(
      self
        .models
        .iter()
        .filter(|m| {
          selectors.iter().any(|sel| match sel {
            Selector::Name(name) => &m.name == name,
            Selector::Tag(tag) => m.has_tag(tag),
          })
        })
        .collect(),
    )
  }
}

fn collect_yaml_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
  let io_err = |source| Error::Io { path: dir.to_path_buf(), source };
  for entry in fs::read_dir(dir).map_err(io_err)? {
    let path = entry.map_err(io_err)?.path();
    if path.is_dir() {
      collect_yaml_files(&path, out)?;
    } else if matches!(path.extension().and_then(|e| e.to_str()), Some("yml" | "yaml")) {
      out.push(path);
    }
  }
  Ok(())
}

/// Order models so that a model referenced by another model's
/// `relationships` check is built first. Declaration order breaks ties; a
/// cycle falls back to declaration order for the models involved.
fn build_order(models: Vec<ModelDef>) -> Result<Vec<ModelDef>> {
  let names: HashSet<&str> = models.iter().map(|m| m.name.as_str()).collect();
  let mut deps: HashMap<String, HashSet<String>> = HashMap::new();
  for m in &models {
    let refs = m
      .references()?
      .into_iter()
      .filter(|r| r != &m.name && names.contains(r.as_str()))
      .collect();
    deps.insert(m.name.clone(), refs);
  }

  let mut pending = models;
  let mut placed: HashSet<String> = HashSet::new();
  let mut ordered = Vec::with_capacity(pending.len());
  while !pending.is_empty() {
    let next = pending
      .iter()
      .position(|m| deps[&m.name].iter().all(|d| placed.contains(d)))
      .unwrap_or(0);
    let model = pending.remove(next);
    placed.insert(model.name.clone());
    ordered.push(model);
  }
  Ok(ordered)
}
