//! Integration tests for `SqliteWarehouse` and full pipeline runs against an
//! in-memory database.

use chrono::{NaiveDate, NaiveDateTime};
use odstage_core::{
  model::{Project, Selector},
  pipeline::{self, RunOptions},
  report::{CheckStatus, WriteStrategy},
  store::Warehouse,
  value::{Row, Value},
};

use crate::{Error, SqliteWarehouse};

async fn warehouse() -> SqliteWarehouse {
  SqliteWarehouse::open_in_memory()
    .await
    .expect("in-memory warehouse")
}

fn ts(y: i32, m: u32, d: u32) -> NaiveDateTime {
  NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(0, 0, 0).unwrap()
}

const MODELS: &str = r#"
models:
  - name: stg_provider
    source: provider
    columns:
      - { name: provider_id, source: ProvNum, type: integer, tests: [unique, not_null] }
      - { name: abbreviation, source: Abbr, type: text, transforms: [string_clean] }

  - name: stg_patient
    source: patient
    materialized: incremental
    unique_key: patient_id
    tags: [clinical]
    watermark: { column: DateTStamp }
    cutoff: { date: 2023-01-01 }
    metadata: { created_at: SecDateEntry, updated_at: DateTStamp }
    columns:
      - { name: patient_id, source: PatNum, type: integer, transforms: [zero_as_null], tests: [not_null] }
      - { name: is_hidden, source: IsHidden, type: boolean, transforms: [boolean_coerce] }
      - { name: created_at, source: SecDateEntry, type: date, transforms: [date_clean, to_date] }
      - name: provider_id
        source: PriProv
        type: integer
        transforms: [zero_as_null]
        tests:
          - test: relationships
            to: stg_provider
            field: provider_id
            severity: warn
            note: Providers deleted after the fact leave orphans.
"#;

fn patient(id: i64, hidden: i64, provider: i64, stamp: &str) -> Row {
  Row::new()
    .with("PatNum", id)
    .with("IsHidden", hidden)
    .with("PriProv", provider)
    .with("SecDateEntry", "0001-01-01")
    .with("DateTStamp", stamp)
}

fn provider(id: i64, abbr: &str) -> Row { Row::new().with("ProvNum", id).with("Abbr", abbr) }

async fn seeded() -> (SqliteWarehouse, Project) {
  let w = warehouse().await;
  w.seed("provider".into(), vec![provider(1, " DOC1 "), provider(2, "HYG")])
    .await
    .unwrap();
  w.seed("patient".into(), vec![patient(10, 1, 1, "2024-06-01 00:00:00")])
    .await
    .unwrap();
  (w, Project::from_yaml(MODELS).unwrap())
}

// ─── Raw relations ───────────────────────────────────────────────────────────

#[tokio::test]
async fn seed_and_read_source_keep_storage_classes() {
  let w = warehouse().await;
  let written = w
    .seed("patient".into(), vec![
      Row::new().with("PatNum", 1).with("LName", "Smith").with("EstBalance", 12.5),
      Row::new().with("PatNum", 2).with("LName", Value::Null),
    ])
    .await
    .unwrap();
  assert_eq!(written, 2);

  let rel = w.read_source("patient".into()).await.unwrap();
  assert_eq!(rel.len(), 2);
  assert_eq!(rel.rows[0].get("PatNum"), &Value::Int(1));
  assert_eq!(rel.rows[0].get("EstBalance"), &Value::Float(12.5));
  assert_eq!(rel.rows[1].get("LName"), &Value::Null);
  assert!(w.relation_exists("patient".into()).await.unwrap());
  assert!(!w.relation_exists("appointment".into()).await.unwrap());
}

#[tokio::test]
async fn seed_adds_columns_to_existing_relation() {
  let w = warehouse().await;
  w.seed("patient".into(), vec![Row::new().with("PatNum", 1)]).await.unwrap();
  w.seed("patient".into(), vec![Row::new().with("PatNum", 2).with("LName", "Jones")])
    .await
    .unwrap();

  let rel = w.read_source("patient".into()).await.unwrap();
  assert_eq!(rel.len(), 2);
  assert!(rel.rows[0].get("LName").is_null());
  assert_eq!(rel.rows[1].get("LName"), &Value::text("Jones"));
}

#[tokio::test]
async fn seed_rejects_reserved_and_empty_input() {
  let w = warehouse().await;
  let reserved = w.seed("_odstage_runs".into(), vec![Row::new().with("a", 1)]).await;
  assert!(matches!(reserved, Err(Error::Reserved(_))));
  let empty = w.seed("patient".into(), vec![]).await;
  assert!(matches!(empty, Err(Error::EmptySeed(_))));
}

// ─── Staged relations ────────────────────────────────────────────────────────

#[tokio::test]
async fn missing_relation_has_no_watermark() {
  let (w, project) = seeded().await;
  let model = project.get("stg_patient").unwrap();
  assert_eq!(
    w.max_watermark(model.name.clone(), "_updated_at".into()).await.unwrap(),
    None
  );
  w.ensure_relation(model).await.unwrap();
  assert_eq!(
    w.max_watermark(model.name.clone(), "_updated_at".into()).await.unwrap(),
    None
  );
  assert!(w.read_relation(model).await.unwrap().is_empty());
}

#[tokio::test]
async fn merge_upserts_on_unique_key() {
  let (w, project) = seeded().await;
  let model = project.get("stg_patient").unwrap();
  w.ensure_relation(model).await.unwrap();

  let first = model.map_row(&patient(10, 0, 1, "2024-06-01"), ts(2024, 7, 1));
  let second = model.map_row(&patient(10, 1, 2, "2024-06-03"), ts(2024, 7, 2));
  w.publish(model, WriteStrategy::Merge, vec![first]).await.unwrap();
  w.publish(model, WriteStrategy::Merge, vec![second]).await.unwrap();

  let rel = w.read_relation(model).await.unwrap();
  assert_eq!(rel.len(), 1);
  assert_eq!(rel.rows[0].get("is_hidden"), &Value::Bool(true));
  assert_eq!(rel.rows[0].get("provider_id"), &Value::Int(2));
  assert_eq!(rel.rows[0].get("_updated_at"), &Value::Timestamp(ts(2024, 6, 3)));
  assert_eq!(
    w.max_watermark(model.name.clone(), "_updated_at".into()).await.unwrap(),
    Some(ts(2024, 6, 3))
  );
}

#[tokio::test]
async fn boolean_anomalies_survive_storage() {
  let (w, project) = seeded().await;
  let model = project.get("stg_patient").unwrap();
  w.ensure_relation(model).await.unwrap();
  let row = model.map_row(&patient(11, 2, 1, "2024-06-01"), ts(2024, 7, 1));
  w.publish(model, WriteStrategy::Append, vec![row]).await.unwrap();

  let rel = w.read_relation(model).await.unwrap();
  assert_eq!(rel.rows[0].get("is_hidden"), &Value::Int(2));
}

#[tokio::test]
async fn ensure_relation_adds_new_model_columns() {
  let (w, project) = seeded().await;
  let model = project.get("stg_provider").unwrap();
  w.ensure_relation(model).await.unwrap();

  let mut extended = model.clone();
  extended.columns.push(serde_yaml::from_str("{ name: is_hidden, source: IsHidden, type: boolean }").unwrap());
  w.ensure_relation(&extended).await.unwrap();

  let row = extended.map_row(&provider(5, "X").with("IsHidden", 0), ts(2024, 7, 1));
  w.publish(&extended, WriteStrategy::Replace, vec![row]).await.unwrap();
  let rel = w.read_relation(&extended).await.unwrap();
  assert_eq!(rel.rows[0].get("is_hidden"), &Value::Bool(false));
}

// ─── Pipeline runs ───────────────────────────────────────────────────────────

#[tokio::test]
async fn zero_sentinels_become_nulls_end_to_end() {
  let w = warehouse().await;
  w.seed("provider".into(), vec![provider(1, "DOC1")]).await.unwrap();
  w.seed("patient".into(), vec![patient(0, 1, 0, "2024-06-01 00:00:00")])
    .await
    .unwrap();
  let project = Project::from_yaml(MODELS).unwrap();

  let report = pipeline::run_at(&w, &project, &RunOptions::default(), ts(2024, 7, 1))
    .await
    .unwrap();

  // `patient_id` is null, so its error-severity not_null check blocks it.
  let not_null = report
    .checks
    .iter()
    .find(|c| c.name == "not_null_stg_patient_patient_id")
    .unwrap();
  assert_eq!(not_null.status, CheckStatus::Fail);
  assert!(report.blocked_models().contains("stg_patient"));

  let outcome = report.models.iter().find(|m| m.model == "stg_patient").unwrap();
  assert!(!outcome.published);
  assert!(w.read_relation(project.get("stg_patient").unwrap()).await.unwrap().is_empty());

  // The provider model is unaffected and published.
  let providers = w.read_relation(project.get("stg_provider").unwrap()).await.unwrap();
  assert_eq!(providers.len(), 1);
}

#[tokio::test]
async fn incremental_run_selects_rows_past_the_watermark() {
  let (w, project) = seeded().await;
  let options = RunOptions::default();

  let first = pipeline::run_at(&w, &project, &options, ts(2024, 6, 10)).await.unwrap();
  let outcome = first.models.iter().find(|m| m.model == "stg_patient").unwrap();
  assert_eq!(outcome.selected_rows, 1);
  assert!(outcome.published);

  w.seed("patient".into(), vec![
    patient(11, 0, 1, "2024-05-30 00:00:00"),
    patient(12, 0, 2, "2024-06-02 00:00:00"),
  ])
  .await
  .unwrap();

  let second = pipeline::run_at(&w, &project, &options, ts(2024, 6, 11)).await.unwrap();
  let outcome = second.models.iter().find(|m| m.model == "stg_patient").unwrap();
  assert_eq!(outcome.last_watermark, Some(ts(2024, 6, 1)));
  assert_eq!(outcome.selected_rows, 1);
  assert_eq!(outcome.strategy, WriteStrategy::Merge);

  let rel = w.read_relation(project.get("stg_patient").unwrap()).await.unwrap();
  let ids: Vec<_> = rel.rows.iter().map(|r| r.get("patient_id").clone()).collect();
  assert_eq!(ids, vec![Value::Int(10), Value::Int(12)]);
}

#[tokio::test]
async fn cutoff_excludes_history_on_first_load() {
  let w = warehouse().await;
  w.seed("provider".into(), vec![provider(1, "DOC1")]).await.unwrap();
  w.seed("patient".into(), vec![
    patient(1, 0, 1, "2022-12-31 23:59:59"),
    patient(2, 0, 1, "2023-01-01 00:00:00"),
    patient(3, 0, 1, ""),
  ])
  .await
  .unwrap();
  let project = Project::from_yaml(MODELS).unwrap();

  let report = pipeline::run_at(&w, &project, &RunOptions::default(), ts(2024, 1, 1))
    .await
    .unwrap();
  let outcome = report.models.iter().find(|m| m.model == "stg_patient").unwrap();
  assert_eq!(outcome.source_rows, 3);
  assert_eq!(outcome.selected_rows, 1);
}

#[tokio::test]
async fn joined_relation_feeds_mapped_columns() {
  let w = warehouse().await;
  w.seed("patient".into(), vec![
    patient(1, 0, 0, "2024-06-01"),
    patient(2, 0, 0, "2024-06-01"),
  ])
  .await
  .unwrap();
  w.seed("patientnote".into(), vec![Row::new().with("PatNum", 1).with("Medical", " latex ")])
    .await
    .unwrap();
  let project = Project::from_yaml(
    r#"
models:
  - name: stg_patient_note
    source: patient
    join: { source: patientnote, left: PatNum, right: PatNum }
    columns:
      - { name: patient_id, source: PatNum, type: integer }
      - { name: medical, source: patientnote.Medical, type: text, transforms: [string_clean] }
"#,
  )
  .unwrap();

  pipeline::run_at(&w, &project, &RunOptions::default(), ts(2024, 6, 10)).await.unwrap();
  let rel = w.read_relation(project.get("stg_patient_note").unwrap()).await.unwrap();
  assert_eq!(rel.rows[0].get("medical"), &Value::text("latex"));
  assert!(rel.rows[1].get("medical").is_null());
}

#[tokio::test]
async fn full_refresh_rebuilds_from_scratch() {
  let (w, project) = seeded().await;
  pipeline::run_at(&w, &project, &RunOptions::default(), ts(2024, 6, 10)).await.unwrap();

  let options = RunOptions { full_refresh: true, ..RunOptions::default() };
  let report = pipeline::run_at(&w, &project, &options, ts(2024, 6, 11)).await.unwrap();
  let outcome = report.models.iter().find(|m| m.model == "stg_patient").unwrap();
  assert_eq!(outcome.strategy, WriteStrategy::Replace);
  assert_eq!(outcome.last_watermark, None);
  assert_eq!(outcome.selected_rows, 1);

  let rel = w.read_relation(project.get("stg_patient").unwrap()).await.unwrap();
  assert_eq!(rel.len(), 1);
  assert_eq!(rel.rows[0].get("_loaded_at"), &Value::Timestamp(ts(2024, 6, 11)));
}

#[tokio::test]
async fn warn_failures_do_not_block_and_error_checks_still_run() {
  let (w, project) = seeded().await;
  // Provider 9 does not exist: the warn-severity relationship check fails.
  w.seed("patient".into(), vec![patient(20, 0, 9, "2024-06-05 00:00:00")])
    .await
    .unwrap();

  let report = pipeline::run_at(&w, &project, &RunOptions::default(), ts(2024, 6, 10))
    .await
    .unwrap();

  let rel_check = report
    .checks
    .iter()
    .find(|c| c.test == "relationships")
    .unwrap();
  assert_eq!(rel_check.status, CheckStatus::Warn);
  assert_eq!(rel_check.failures, 1);
  assert_eq!(rel_check.samples, vec!["20 -> 9".to_owned()]);

  let not_null = report
    .checks
    .iter()
    .find(|c| c.name == "not_null_stg_patient_patient_id")
    .unwrap();
  assert_eq!(not_null.status, CheckStatus::Pass);
  assert!(!report.has_failures());
  assert!(report.models.iter().all(|m| m.published));
}

#[tokio::test]
async fn selection_limits_run_and_references_read_published_parents() {
  let (w, project) = seeded().await;
  pipeline::run_at(
    &w,
    &project,
    &RunOptions { selectors: vec![Selector::Name("stg_provider".into())], ..Default::default() },
    ts(2024, 6, 10),
  )
  .await
  .unwrap();

  let options = RunOptions { selectors: vec!["tag:clinical".parse().unwrap()], ..Default::default() };
  let report = pipeline::run_at(&w, &project, &options, ts(2024, 6, 11)).await.unwrap();
  assert_eq!(report.models.len(), 1);
  let rel_check = report.checks.iter().find(|c| c.test == "relationships").unwrap();
  assert_eq!(rel_check.status, CheckStatus::Pass);
}

#[tokio::test]
async fn test_command_checks_published_relations() {
  let (w, project) = seeded().await;
  pipeline::run_at(&w, &project, &RunOptions::default(), ts(2024, 6, 10)).await.unwrap();

  let report = pipeline::test(&w, &project, &[]).await.unwrap();
  assert!(report.models.is_empty());
  assert_eq!(report.count(CheckStatus::Fail), 0);
  assert_eq!(report.checks.len(), 4);
}

#[tokio::test]
async fn runs_are_recorded_in_history() {
  let (w, project) = seeded().await;
  let first = pipeline::run_at(&w, &project, &RunOptions::default(), ts(2024, 6, 10)).await.unwrap();
  let second = pipeline::run_at(&w, &project, &RunOptions::default(), ts(2024, 6, 11)).await.unwrap();

  let runs = w.recent_runs(10).await.unwrap();
  assert_eq!(runs.len(), 2);
  assert_eq!(runs[0].run_id, second.run_id);
  assert_eq!(runs[1].run_id, first.run_id);
  assert_eq!(runs[0].kind, "run");
  assert_eq!(runs[0].passed, second.count(CheckStatus::Pass));

  let json = serde_json::to_value(&runs[0]).unwrap();
  assert_eq!(json["kind"], "run");
  assert_eq!(json["run_id"], second.run_id.to_string());
}

#[tokio::test]
async fn bundled_models_run_against_bundled_seeds() {
  let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../..");
  let project = Project::load_dir(root.join("models")).unwrap();
  let w = warehouse().await;
  for relation in ["provider", "patient", "procedurelog"] {
    let raw = std::fs::read_to_string(root.join(format!("seeds/{relation}.json"))).unwrap();
    let rows: Vec<Row> = serde_json::from_str(&raw).unwrap();
    w.seed(relation.into(), rows).await.unwrap();
  }

  let report = pipeline::run_at(&w, &project, &RunOptions::default(), ts(2024, 6, 10))
    .await
    .unwrap();

  assert!(!report.has_failures(), "{:#?}", report.checks);
  assert_eq!(report.count(CheckStatus::Warn), 3);
  assert!(report.models.iter().all(|m| m.published));

  let patients = report
    .models
    .iter()
    .find(|m| m.model == "stg_opendental__patient")
    .unwrap();
  assert_eq!(patients.source_rows, 4);
  assert_eq!(patients.selected_rows, 3);
}

#[tokio::test]
async fn repeated_keys_block_publication_without_aborting_the_run() {
  let w = warehouse().await;
  w.seed("provider".into(), vec![provider(1, "DOC1"), provider(1, "DOC1-DUP"), provider(2, "HYG")])
    .await
    .unwrap();
  w.seed("clinic".into(), vec![Row::new().with("ClinicNum", 1)]).await.unwrap();
  let project = Project::from_yaml(
    r#"
models:
  - name: stg_clinic
    source: clinic
    columns:
      - { name: clinic_id, source: ClinicNum, type: integer }
  - name: stg_provider
    source: provider
    unique_key: provider_id
    columns:
      - name: provider_id
        source: ProvNum
        type: integer
        tests: [{ test: unique, severity: warn }]
"#,
  )
  .unwrap();

  let report = pipeline::run_at(&w, &project, &RunOptions::default(), ts(2024, 6, 10))
    .await
    .unwrap();

  let unique = report.checks.iter().find(|c| c.test == "unique").unwrap();
  assert_eq!(unique.status, CheckStatus::Warn);
  let key = report.checks.iter().find(|c| c.test == "unique_key").unwrap();
  assert_eq!(key.status, CheckStatus::Fail);
  assert_eq!(key.samples, vec!["1".to_owned()]);
  assert!(report.has_failures());

  let provider_outcome = report.models.iter().find(|m| m.model == "stg_provider").unwrap();
  assert!(!provider_outcome.published);
  let clinic_outcome = report.models.iter().find(|m| m.model == "stg_clinic").unwrap();
  assert!(clinic_outcome.published);

  assert!(w.read_relation(project.get("stg_provider").unwrap()).await.unwrap().is_empty());
  let runs = w.recent_runs(10).await.unwrap();
  assert_eq!(runs.len(), 1);
  assert_eq!(runs[0].failed, 1);

  // A full refresh of the same batch is refused the same way.
  let options = RunOptions { full_refresh: true, ..RunOptions::default() };
  let again = pipeline::run_at(&w, &project, &options, ts(2024, 6, 11)).await.unwrap();
  assert!(again.blocked_models().contains("stg_provider"));
}

#[tokio::test]
async fn repeated_keys_in_an_incremental_batch_fail_unique_checks() {
  let (w, _) = seeded().await;
  w.seed("patient".into(), vec![patient(10, 0, 1, "2024-06-02 00:00:00")])
    .await
    .unwrap();
  let project = Project::from_yaml(
    r#"
models:
  - name: stg_patient
    source: patient
    materialized: incremental
    unique_key: patient_id
    watermark: { column: DateTStamp }
    columns:
      - { name: patient_id, source: PatNum, type: integer, tests: [not_null, unique] }
"#,
  )
  .unwrap();

  let report = pipeline::run_at(&w, &project, &RunOptions::default(), ts(2024, 6, 10))
    .await
    .unwrap();

  let unique = report.checks.iter().find(|c| c.test == "unique").unwrap();
  assert_eq!(unique.status, CheckStatus::Fail);
  assert_eq!(unique.failures, 1);
  assert!(!report.models[0].published);
}
