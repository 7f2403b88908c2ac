//! Runner configuration, read from `odstage.toml` and `ODSTAGE_*` variables.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::NaiveDate;
use serde::Deserialize;

/// Settings shared by every subcommand.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
  /// SQLite file holding raw and staged relations.
  #[serde(default = "default_warehouse_path")]
  pub warehouse_path: PathBuf,
  /// Directory scanned recursively for model YAML files.
  #[serde(default = "default_models_dir")]
  pub models_dir:     PathBuf,
  /// Cutoff for models that declare a cutoff column without a date.
  #[serde(default)]
  pub default_cutoff: Option<NaiveDate>,
  /// Treat every run as a full refresh.
  #[serde(default)]
  pub full_refresh:   bool,
}

fn default_warehouse_path() -> PathBuf { PathBuf::from("warehouse.db") }

fn default_models_dir() -> PathBuf { PathBuf::from("models") }

impl RunnerConfig {
  /// Merge the config file (optional) with the environment.
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let settings = config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(config::Environment::with_prefix("ODSTAGE"))
      .build()
      .with_context(|| format!("failed to read config file {}", path.display()))?;

    let mut cfg: RunnerConfig = settings
      .try_deserialize()
      .context("failed to deserialise RunnerConfig")?;
    cfg.warehouse_path = expand_tilde(&cfg.warehouse_path);
    cfg.models_dir = expand_tilde(&cfg.models_dir);
    Ok(cfg)
  }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
