//! [`SqliteWarehouse`]: the SQLite implementation of [`Warehouse`].

use std::{collections::BTreeSet, path::Path};

use chrono::NaiveDateTime;
use rusqlite::{OptionalExtension as _, params_from_iter, types::Value as SqlValue};
use serde::Serialize;
use uuid::Uuid;

use odstage_core::{
  model::ModelDef,
  report::{CheckStatus, RunKind, RunReport, WriteStrategy},
  store::Warehouse,
  value::{DataType, Relation, Row, parse_temporal},
};

use crate::{
  Error, Result,
  encode::{decode_dt, decode_raw, decode_typed, encode_dt, encode_value, quote, quote_list, sql_type},
  schema::{INTERNAL_PREFIX, SCHEMA},
};

// ─── Store ───────────────────────────────────────────────────────────────────

/// A warehouse backed by a single SQLite file.
///
/// Cloning is cheap; the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteWarehouse {
  conn: tokio_rusqlite::Connection,
}

/// Summary row from the run history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunRecord {
  pub run_id:     Uuid,
  pub kind:       String,
  pub started_at: NaiveDateTime,
  pub passed:     usize,
  pub warned:     usize,
  pub failed:     usize,
}

impl SqliteWarehouse {
  /// Open (or create) a warehouse at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory warehouse; useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  /// Most recent runs first.
  pub async fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
    let limit = limit as i64;
    let raws: Vec<(String, String, String, i64, i64, i64)> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT run_id, kind, started_at, passed, warned, failed
           FROM _odstage_runs
           ORDER BY started_at DESC, rowid DESC
           LIMIT ?1",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![limit], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws
      .into_iter()
      .map(|(id, kind, started_at, passed, warned, failed)| {
        Ok(RunRecord {
          run_id: Uuid::parse_str(&id)?,
          kind,
          started_at: decode_dt(&started_at)?,
          passed: passed as usize,
          warned: warned as usize,
          failed: failed as usize,
        })
      })
      .collect()
  }

  /// Column names of `table`, empty when it does not exist.
  fn table_columns(conn: &rusqlite::Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote(table)))?;
    let cols = stmt
      .query_map([], |r| r.get::<_, String>(1))?
      .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(cols)
  }
}

fn check_reserved(name: &str) -> Result<()> {
  if name.starts_with(INTERNAL_PREFIX) {
    return Err(Error::Reserved(name.to_owned()));
  }
  Ok(())
}

/// Insert `rows` into `table` column by column, in one prepared statement.
fn insert_rows(
  tx: &rusqlite::Transaction<'_>,
  table: &str,
  columns: &[String],
  rows: &[Vec<SqlValue>],
  upsert_key: Option<&str>,
) -> rusqlite::Result<usize> {
  let placeholders = (1..=columns.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ");
  let mut sql = format!(
    "INSERT INTO {} ({}) VALUES ({placeholders})",
    quote(table),
    quote_list(columns)
  );
  if let Some(key) = upsert_key {
    let updates = columns
      .iter()
      .filter(|c| c.as_str() != key)
      .map(|c| format!("{0} = excluded.{0}", quote(c)))
      .collect::<Vec<_>>()
      .join(", ");
    sql.push_str(&format!(" ON CONFLICT ({}) DO UPDATE SET {updates}", quote(key)));
  }

  let mut stmt = tx.prepare(&sql)?;
  let mut written = 0;
  for row in rows {
    written += stmt.execute(params_from_iter(row.iter()))?;
  }
  Ok(written)
}

// ─── Warehouse impl ──────────────────────────────────────────────────────────

impl Warehouse for SqliteWarehouse {
  type Error = Error;

  // ── Raw relations ─────────────────────────────────────────────────────────

  async fn relation_exists(&self, name: String) -> Result<bool> {
    let exists = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
              rusqlite::params![name],
              |_| Ok(true),
            )
            .optional()?
            .unwrap_or(false),
        )
      })
      .await?;
    Ok(exists)
  }

  async fn read_source(&self, name: String) -> Result<Relation> {
    let table = name.clone();
    let (columns, rows): (Vec<String>, Vec<Row>) = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!("SELECT * FROM {}", quote(&table)))?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(str::to_owned).collect();
        let names = columns.clone();
        let rows = stmt
          .query_map([], |r| {
            let mut row = Row::new();
            for (i, name) in names.iter().enumerate() {
              row.insert(name.clone(), decode_raw(r.get::<_, SqlValue>(i)?));
            }
            Ok(row)
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok((columns, rows))
      })
      .await?;

    tracing::debug!(relation = %name, rows = rows.len(), "read source");
    Ok(Relation::new(name, columns, rows))
  }

  async fn seed(&self, name: String, rows: Vec<Row>) -> Result<usize> {
    check_reserved(&name)?;

    let columns: Vec<String> = rows
      .iter()
      .flat_map(|r| r.iter().map(|(c, _)| c.to_owned()))
      .collect::<BTreeSet<_>>()
      .into_iter()
      .collect();
    if columns.is_empty() {
      return Err(Error::EmptySeed(name));
    }

    let encoded: Vec<Vec<SqlValue>> = rows
      .iter()
      .map(|r| columns.iter().map(|c| encode_value(r.get(c))).collect())
      .collect();

    let written = self
      .conn
      .call(move |conn| {
        // Untyped columns: raw relations keep whatever storage class the
        // extract produced.
        conn.execute_batch(&format!(
          "CREATE TABLE IF NOT EXISTS {} ({})",
          quote(&name),
          quote_list(&columns)
        ))?;
        let existing = Self::table_columns(conn, &name)?;
        let tx = conn.transaction()?;
        for col in columns.iter().filter(|c| !existing.contains(c)) {
          tx.execute_batch(&format!("ALTER TABLE {} ADD COLUMN {}", quote(&name), quote(col)))?;
        }
        let written = insert_rows(&tx, &name, &columns, &encoded, None)?;
        tx.commit()?;
        Ok(written)
      })
      .await?;
    Ok(written)
  }

  // ── Staged relations ──────────────────────────────────────────────────────

  async fn ensure_relation(&self, model: &ModelDef) -> Result<()> {
    check_reserved(&model.name)?;

    let name = model.name.clone();
    let columns = model.output_columns();
    let key = model.unique_key.clone();

    self
      .conn
      .call(move |conn| {
        let defs = columns
          .iter()
          .map(|(c, t)| format!("{} {}", quote(c), sql_type(*t)))
          .collect::<Vec<_>>()
          .join(", ");
        conn.execute_batch(&format!("CREATE TABLE IF NOT EXISTS {} ({defs})", quote(&name)))?;

        // Columns added to the model after the relation was first built.
        let existing = Self::table_columns(conn, &name)?;
        for (col, t) in columns.iter().filter(|(c, _)| !existing.contains(c)) {
          conn.execute_batch(&format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            quote(&name),
            quote(col),
            sql_type(*t)
          ))?;
        }

        if let Some(key) = key {
          conn.execute_batch(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} ({})",
            quote(&format!("{name}__{key}__uq")),
            quote(&name),
            quote(&key)
          ))?;
        }
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn read_relation(&self, model: &ModelDef) -> Result<Relation> {
    let name = model.name.clone();
    let declared = model.output_columns();

    let rows: Vec<Row> = self
      .conn
      .call(move |conn| {
        let existing = Self::table_columns(conn, &name)?;
        // Declared columns the stored relation lacks read as null.
        let present: Vec<(String, DataType)> =
          declared.into_iter().filter(|(c, _)| existing.contains(c)).collect();
        if present.is_empty() {
          return Ok(Vec::new());
        }

        let names: Vec<&str> = present.iter().map(|(c, _)| c.as_str()).collect();
        let mut stmt = conn.prepare(&format!(
          "SELECT {} FROM {} ORDER BY rowid",
          quote_list(&names),
          quote(&name)
        ))?;
        let rows = stmt
          .query_map([], |r| {
            let mut row = Row::new();
            for (i, (col, t)) in present.iter().enumerate() {
              row.insert(col.clone(), decode_typed(r.get::<_, SqlValue>(i)?, *t));
            }
            Ok(row)
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    Ok(Relation::new(model.name.clone(), model.column_names(), rows))
  }

  async fn max_watermark(&self, relation: String, column: String) -> Result<Option<NaiveDateTime>> {
    let max: Option<SqlValue> = self
      .conn
      .call(move |conn| {
        if !Self::table_columns(conn, &relation)?.contains(&column) {
          return Ok(None);
        }
        let v = conn.query_row(
          &format!("SELECT MAX({}) FROM {}", quote(&column), quote(&relation)),
          [],
          |r| r.get::<_, SqlValue>(0),
        )?;
        Ok(Some(v))
      })
      .await?;

    Ok(match max {
      Some(SqlValue::Text(s)) => parse_temporal(&s),
      _ => None,
    })
  }

  async fn publish(
    &self,
    model: &ModelDef,
    strategy: WriteStrategy,
    delta: Vec<Row>,
  ) -> Result<usize> {
    let name = model.name.clone();
    let columns = model.column_names();
    let upsert_key = match strategy {
      WriteStrategy::Merge => model.unique_key.clone(),
      WriteStrategy::Replace | WriteStrategy::Append => None,
    };
    let encoded: Vec<Vec<SqlValue>> = delta
      .iter()
      .map(|r| columns.iter().map(|c| encode_value(r.get(c))).collect())
      .collect();

    let written = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        if strategy == WriteStrategy::Replace {
          tx.execute(&format!("DELETE FROM {}", quote(&name)), [])?;
        }
        let written = insert_rows(&tx, &name, &columns, &encoded, upsert_key.as_deref())?;
        tx.commit()?;
        Ok(written)
      })
      .await?;
    Ok(written)
  }

  // ── Run history ───────────────────────────────────────────────────────────

  async fn record_run(&self, report: &RunReport) -> Result<()> {
    let run_id = report.run_id.hyphenated().to_string();
    let kind = match report.kind {
      RunKind::Run => "run",
      RunKind::Test => "test",
    };
    let started_at = encode_dt(report.started_at);
    let models_json = serde_json::to_string(&report.models)?;
    let counts = [
      report.count(CheckStatus::Pass) as i64,
      report.count(CheckStatus::Warn) as i64,
      report.count(CheckStatus::Fail) as i64,
    ];

    let mut results = Vec::with_capacity(report.checks.len());
    for c in &report.checks {
      results.push((
        c.name.clone(),
        c.model.clone(),
        c.column.clone(),
        c.test.clone(),
        c.severity.to_string(),
        c.status.to_string().to_lowercase(),
        c.failures as i64,
        serde_json::to_string(&c.samples)?,
        c.note.clone(),
        c.message.clone(),
      ));
    }

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
          "INSERT INTO _odstage_runs (run_id, kind, started_at, models_json, passed, warned, failed)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
          rusqlite::params![run_id, kind, started_at, models_json, counts[0], counts[1], counts[2]],
        )?;
        {
          let mut stmt = tx.prepare(
            "INSERT INTO _odstage_check_results (
               run_id, name, model, column_name, test, severity,
               status, failures, samples, note, message
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
          )?;
          for r in &results {
            stmt.execute(rusqlite::params![
              run_id, r.0, r.1, r.2, r.3, r.4, r.5, r.6, r.7, r.8, r.9,
            ])?;
          }
        }
        tx.commit()?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}
