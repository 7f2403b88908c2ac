//! The `Warehouse` trait: where raw relations are read and staged relations
//! are written.
//!
//! Implemented by storage backends (e.g. `odstage-store-sqlite`). The
//! [`pipeline`](crate::pipeline) depends on this abstraction only.

use std::future::Future;

use chrono::NaiveDateTime;

use crate::{
  model::ModelDef,
  report::{RunReport, WriteStrategy},
  value::{Relation, Row},
};

/// Abstraction over the analytical warehouse.
///
/// All methods return `Send` futures so the trait can be driven from a
/// multi-threaded tokio runtime.
pub trait Warehouse: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Raw relations ─────────────────────────────────────────────────────

  /// Whether a relation (raw or staged) named `name` exists.
  fn relation_exists(
    &self,
    name: String,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + '_;

  /// Read every row of a raw relation, with the types the extract stored.
  fn read_source(
    &self,
    name: String,
  ) -> impl Future<Output = Result<Relation, Self::Error>> + Send + '_;

  /// Load rows into a raw relation, creating it if needed. Used for seeding
  /// fixtures; returns the number of rows written.
  fn seed(
    &self,
    name: String,
    rows: Vec<Row>,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + '_;

  // ── Staged relations ──────────────────────────────────────────────────

  /// Create the model's target relation if it does not exist yet.
  fn ensure_relation<'a>(
    &'a self,
    model: &'a ModelDef,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Read the model's published relation, decoded with its declared column
  /// types. A missing relation reads as empty.
  fn read_relation<'a>(
    &'a self,
    model: &'a ModelDef,
  ) -> impl Future<Output = Result<Relation, Self::Error>> + Send + 'a;

  /// Maximum of `column` in the published relation; `None` when the relation
  /// is missing, empty, or the column holds no timestamps.
  fn max_watermark(
    &self,
    relation: String,
    column: String,
  ) -> impl Future<Output = Result<Option<NaiveDateTime>, Self::Error>> + Send + '_;

  /// Write `delta` to the model's relation atomically using `strategy`.
  /// Returns the number of rows written.
  fn publish<'a>(
    &'a self,
    model: &'a ModelDef,
    strategy: WriteStrategy,
    delta: Vec<Row>,
  ) -> impl Future<Output = Result<usize, Self::Error>> + Send + 'a;

  // ── Run history ───────────────────────────────────────────────────────

  /// Persist a run report and its check results.
  fn record_run<'a>(
    &'a self,
    report: &'a RunReport,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;
}
