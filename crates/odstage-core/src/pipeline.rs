//! Drives models through build, check and publish against a [`Warehouse`].
//!
//! A run builds every selected model into an in-memory candidate relation
//! first, then evaluates all checks over those candidates, and only then
//! publishes. A model with a failing `error` check is not published; warnings
//! never block. Warehouse errors abort the whole run.

use std::collections::{HashMap, HashSet};

use chrono::{NaiveDate, NaiveDateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::{
  Error, Result,
  assertion::{SAMPLE_LIMIT, Severity},
  model::{ModelDef, Project, Selector},
  report::{CheckResult, CheckStatus, ModelOutcome, RunKind, RunReport, WriteStrategy},
  store::Warehouse,
  value::{Relation, Row},
};

/// Knobs for a single run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
  /// Rebuild incremental models from scratch, ignoring their watermark.
  pub full_refresh:   bool,
  /// Cutoff for models that have a cutoff column but no cutoff date.
  pub default_cutoff: Option<NaiveDate>,
  /// Models to run; empty runs everything.
  pub selectors:      Vec<Selector>,
}

/// A built model waiting for its checks.
struct Build<'m> {
  model:         &'m ModelDef,
  strategy:      WriteStrategy,
  delta:         Vec<Row>,
  outcome:       ModelOutcome,
  /// Set when the delta repeats a unique key; blocks publication.
  key_violation: Option<CheckResult>,
}

/// Build, check and publish the selected models.
pub async fn run<W: Warehouse>(
  warehouse: &W,
  project: &Project,
  options: &RunOptions,
) -> Result<RunReport> {
  run_at(warehouse, project, options, Utc::now().naive_utc()).await
}

/// [`run`] with an explicit wall-clock time for the load timestamp.
pub async fn run_at<W: Warehouse>(
  warehouse: &W,
  project: &Project,
  options: &RunOptions,
  run_time: NaiveDateTime,
) -> Result<RunReport> {
  let mut report = RunReport::new(RunKind::Run, run_time);
  let models = project.select(&options.selectors)?;
  info!(run_id = %report.run_id, models = models.len(), "starting run");

  let mut relations: HashMap<String, Relation> = HashMap::new();
  let mut builds = Vec::with_capacity(models.len());
  for model in &models {
    let (build, relation) = build_model(warehouse, model, options, run_time).await?;
    relations.insert(model.name.clone(), relation);
    builds.push(build);
  }

  load_references(warehouse, project, &models, &mut relations).await?;
  report.checks = evaluate(&models, &relations)?;
  for build in &builds {
    if let Some(violation) = &build.key_violation {
      log_result(violation);
      report.checks.push(violation.clone());
    }
  }

  let blocked: HashSet<String> =
    report.blocked_models().into_iter().map(str::to_owned).collect();

  for build in builds {
    let mut outcome = build.outcome;
    if blocked.contains(&build.model.name) {
      warn!(model = %build.model.name, "not published: error-severity checks failed");
    } else {
      let written = warehouse
        .publish(build.model, build.strategy, build.delta)
        .await
        .map_err(Error::store)?;
      info!(model = %build.model.name, strategy = ?build.strategy, rows = written, "published");
      outcome.published = true;
    }
    report.models.push(outcome);
  }

  warehouse.record_run(&report).await.map_err(Error::store)?;
  info!(run_id = %report.run_id, summary = %report.summary(), "run finished");
  Ok(report)
}

/// Evaluate the checks of the selected models over their published
/// relations, without building anything.
pub async fn test<W: Warehouse>(
  warehouse: &W,
  project: &Project,
  selectors: &[Selector],
) -> Result<RunReport> {
  let mut report = RunReport::new(RunKind::Test, Utc::now().naive_utc());
  let models = project.select(selectors)?;

  let mut relations = HashMap::new();
  for model in &models {
    let relation = warehouse.read_relation(model).await.map_err(Error::store)?;
    relations.insert(model.name.clone(), relation.with_key(model.unique_key.clone()));
  }

  load_references(warehouse, project, &models, &mut relations).await?;
  report.checks = evaluate(&models, &relations)?;

  warehouse.record_run(&report).await.map_err(Error::store)?;
  info!(run_id = %report.run_id, summary = %report.summary(), "test finished");
  Ok(report)
}

async fn build_model<'m, W: Warehouse>(
  warehouse: &W,
  model: &'m ModelDef,
  options: &RunOptions,
  run_time: NaiveDateTime,
) -> Result<(Build<'m>, Relation)> {
  warehouse.ensure_relation(model).await.map_err(Error::store)?;

  let strategy = model.strategy(options.full_refresh);
  let last_watermark = match (&model.watermark, strategy) {
    (Some(wm), WriteStrategy::Merge | WriteStrategy::Append) => warehouse
      .max_watermark(model.name.clone(), wm.target.clone())
      .await
      .map_err(Error::store)?,
    _ => None,
  };
  debug!(model = %model.name, ?last_watermark, "read watermark");

  let filter = model.filter(last_watermark, options.default_cutoff);
  let mut source = warehouse
    .read_source(model.source.clone())
    .await
    .map_err(Error::store)?;
  if let Some(join) = &model.join {
    let joined = warehouse
      .read_source(join.source.clone())
      .await
      .map_err(Error::store)?;
    source.rows = join.apply(&source.rows, &joined);
  }

  let delta: Vec<Row> = source
    .rows
    .iter()
    .filter(|raw| model.selects(&filter, raw))
    .map(|raw| model.map_row(raw, run_time))
    .collect();

  let mut rows = match strategy {
    WriteStrategy::Replace => Vec::new(),
    WriteStrategy::Merge | WriteStrategy::Append => {
      warehouse.read_relation(model).await.map_err(Error::store)?.rows
    }
  };
  merge_rows(&mut rows, &delta, strategy, model.unique_key.as_deref());
  let violation = model
    .unique_key
    .as_deref()
    .and_then(|key| key_violation(model, key, &delta));

  info!(
    model = %model.name,
    source_rows = source.rows.len(),
    selected = delta.len(),
    "built model"
  );

  let outcome = ModelOutcome {
    model:          model.name.clone(),
    strategy,
    last_watermark,
    source_rows:    source.rows.len(),
    selected_rows:  delta.len(),
    relation_rows:  rows.len(),
    published:      false,
  };
  let relation = Relation::new(model.name.clone(), model.column_names(), rows)
    .with_key(model.unique_key.clone());

  Ok((Build { model, strategy, delta, outcome, key_violation: violation }, relation))
}

/// Apply `delta` to `rows` the way the warehouse will on publish: upsert by
/// key for merges, append otherwise. Rows with a null key are appended, as
/// are repeats of a key within `delta`, so checks over the candidate see
/// them.
fn merge_rows(rows: &mut Vec<Row>, delta: &[Row], strategy: WriteStrategy, key: Option<&str>) {
  let key = match (strategy, key) {
    (WriteStrategy::Merge, Some(key)) => key,
    _ => {
      rows.extend(delta.iter().cloned());
      return;
    }
  };

  let mut index: HashMap<String, usize> = rows
    .iter()
    .enumerate()
    .filter_map(|(i, r)| r.get(key).key().map(|k| (k, i)))
    .collect();

  let mut seen = HashSet::new();
  for row in delta {
    match row.get(key).key() {
      Some(k) if seen.insert(k.clone()) => match index.get(&k) {
        Some(&i) => rows[i] = row.clone(),
        None => {
          index.insert(k, rows.len());
          rows.push(row.clone());
        }
      },
      _ => rows.push(row.clone()),
    }
  }
}

/// Keys that occur more than once in `delta`, reported as a failing
/// `error` check regardless of the severity of the model's own checks. Such
/// a batch cannot be stored under the relation's unique index.
fn key_violation(model: &ModelDef, key: &str, delta: &[Row]) -> Option<CheckResult> {
  let mut counts: HashMap<String, usize> = HashMap::new();
  let mut order = Vec::new();
  for k in delta.iter().filter_map(|r| r.get(key).key()) {
    let n = counts.entry(k.clone()).or_default();
    *n += 1;
    if *n == 2 {
      order.push(k);
    }
  }
  if order.is_empty() {
    return None;
  }

  Some(CheckResult {
    name:     format!("unique_key_{}", model.name),
    model:    model.name.clone(),
    column:   Some(key.to_owned()),
    test:     "unique_key".to_owned(),
    severity: Severity::Error,
    status:   CheckStatus::Fail,
    failures: order.len(),
    samples:  order.iter().take(SAMPLE_LIMIT).cloned().collect(),
    note:     None,
    message:  Some(format!("loaded rows repeat unique_key {key:?}; relation not published")),
  })
}

/// Make relations referenced by `relationships` checks available: project
/// models are read from their published relation, anything else as a raw
/// relation. Relations already built in this run take precedence.
async fn load_references<W: Warehouse>(
  warehouse: &W,
  project: &Project,
  models: &[&ModelDef],
  relations: &mut HashMap<String, Relation>,
) -> Result<()> {
  for model in models {
    for name in model.references()? {
      if relations.contains_key(&name) {
        continue;
      }
      let relation = if let Some(parent) = project.get(&name) {
        warehouse
          .read_relation(parent)
          .await
          .map_err(Error::store)?
          .with_key(parent.unique_key.clone())
      } else if warehouse.relation_exists(name.clone()).await.map_err(Error::store)? {
        warehouse.read_source(name.clone()).await.map_err(Error::store)?
      } else {
        warn!(model = %model.name, relation = %name, "referenced relation does not exist");
        continue;
      };
      relations.insert(name, relation);
    }
  }
  Ok(())
}

fn evaluate(models: &[&ModelDef], relations: &HashMap<String, Relation>) -> Result<Vec<CheckResult>> {
  let mut results = Vec::new();
  for model in models {
    let Some(relation) = relations.get(&model.name) else {
      continue;
    };
    for check in model.checks()? {
      let result = check.evaluate(relation, relations);
      log_result(&result);
      results.push(result);
    }
  }
  Ok(results)
}

fn log_result(result: &CheckResult) {
  match result.status {
    CheckStatus::Pass => debug!(check = %result.name, "pass"),
    CheckStatus::Warn => warn!(
      check = %result.name,
      failures = result.failures,
      samples = ?result.samples,
      "check failed (warn)"
    ),
    CheckStatus::Fail => error!(
      check = %result.name,
      failures = result.failures,
      samples = ?result.samples,
      "check failed (error)"
    ),
  }
}
