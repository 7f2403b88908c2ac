//! Error type for `odstage-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  #[error("date/time parse error: {0}")]
  DateParse(String),

  /// A seeded row set had no columns at all.
  #[error("cannot seed {0:?}: rows have no columns")]
  EmptySeed(String),

  #[error("relation name {0:?} is reserved for run history")]
  Reserved(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
