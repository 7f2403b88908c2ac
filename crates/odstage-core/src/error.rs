//! Error types for `odstage-core`.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("model {model}: {reason}")]
  InvalidModel { model: String, reason: String },

  #[error("model {0} is defined more than once")]
  DuplicateModel(String),

  #[error("unknown model: {0}")]
  UnknownModel(String),

  #[error("invalid selector: {0:?}")]
  InvalidSelector(String),

  #[error("failed to read {path:?}: {source}")]
  Io {
    path:   PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse {path:?}: {source}")]
  Yaml {
    path:   PathBuf,
    #[source]
    source: serde_yaml::Error,
  },

  #[error("warehouse error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
  pub(crate) fn invalid(model: &str, reason: impl Into<String>) -> Self {
    Self::InvalidModel { model: model.to_owned(), reason: reason.into() }
  }

  pub(crate) fn store<E>(e: E) -> Self
  where
    E: std::error::Error + Send + Sync + 'static,
  {
    Self::Store(Box::new(e))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
