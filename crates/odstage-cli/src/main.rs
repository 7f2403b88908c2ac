//! `odstage` — builds and checks the staging layer.
//!
//! Reads `odstage.toml` (or the path given with `--config`), loads the model
//! YAML files under `models_dir`, and runs them against the SQLite warehouse.
//!
//! # Usage
//!
//! ```
//! odstage seed patient seeds/patient.json
//! odstage run --select tag:clinical
//! odstage test --json
//! ```

mod config;
mod docs;

use std::{path::PathBuf, process::ExitCode};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use odstage_core::{
  model::{Project, Selector},
  pipeline::{self, RunOptions},
  report::{CheckStatus, RunReport},
  store::Warehouse as _,
  value::Row,
};
use odstage_store_sqlite::SqliteWarehouse;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::config::RunnerConfig;

// ─── CLI args ─────────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "odstage", version, about = "Staging-layer builder for practice management data")]
struct Cli {
  /// Path to the TOML configuration file.
  #[arg(short, long, default_value = "odstage.toml")]
  config: PathBuf,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Build, check and publish models.
  Run {
    /// Model names or `tag:<tag>`; repeatable. Defaults to every model.
    #[arg(short, long = "select")]
    select:       Vec<Selector>,
    /// Rebuild incremental models from scratch.
    #[arg(long)]
    full_refresh: bool,
    /// Print the run report as JSON.
    #[arg(long)]
    json:         bool,
  },
  /// Check published relations without rebuilding them.
  Test {
    #[arg(short, long = "select")]
    select: Vec<Selector>,
    #[arg(long)]
    json:   bool,
  },
  /// Load a JSON array of rows into a raw relation.
  Seed {
    /// Raw relation to create or append to.
    relation: String,
    /// File holding a JSON array of objects.
    file:     PathBuf,
  },
  /// List models in build order.
  Ls {
    #[arg(short, long = "select")]
    select: Vec<Selector>,
  },
  /// Print markdown documentation for the models.
  Docs {
    #[arg(short, long = "select")]
    select: Vec<Selector>,
  },
  /// Show recent runs from the warehouse history.
  History {
    #[arg(short = 'n', long, default_value_t = 10)]
    limit: usize,
    #[arg(long)]
    json:  bool,
  },
}

// ─── Entry point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
  // Initialise tracing.
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .with_writer(std::io::stderr)
    .init();

  let cli = Cli::parse();
  let cfg = RunnerConfig::load(&cli.config)?;

  match cli.command {
    Command::Run { select, full_refresh, json } => {
      let project = load_project(&cfg)?;
      let warehouse = open_warehouse(&cfg).await?;
      let options = RunOptions {
        full_refresh:   full_refresh || cfg.full_refresh,
        default_cutoff: cfg.default_cutoff,
        selectors:      select,
      };
      let report = pipeline::run(&warehouse, &project, &options)
        .await
        .context("run failed")?;
      finish(&report, json)
    }
    Command::Test { select, json } => {
      let project = load_project(&cfg)?;
      let warehouse = open_warehouse(&cfg).await?;
      let report = pipeline::test(&warehouse, &project, &select)
        .await
        .context("test failed")?;
      finish(&report, json)
    }
    Command::Seed { relation, file } => {
      let raw = std::fs::read_to_string(&file)
        .with_context(|| format!("reading seed file {}", file.display()))?;
      let rows: Vec<Row> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing seed file {}", file.display()))?;
      let warehouse = open_warehouse(&cfg).await?;
      let written = warehouse
        .seed(relation.clone(), rows)
        .await
        .with_context(|| format!("failed to seed {relation}"))?;
      tracing::info!(relation = %relation, rows = written, "seeded");
      Ok(ExitCode::SUCCESS)
    }
    Command::Ls { select } => {
      let project = load_project(&cfg)?;
      for model in project.select(&select)? {
        println!(
          "{:<40} {:<12} {:<24} {}",
          model.qualified_name(),
          model.materialized.as_str(),
          model.source,
          model.tags.join(",")
        );
      }
      Ok(ExitCode::SUCCESS)
    }
    Command::Docs { select } => {
      let project = load_project(&cfg)?;
      print!("{}", docs::render(&project.select(&select)?)?);
      Ok(ExitCode::SUCCESS)
    }
    Command::History { limit, json } => {
      let warehouse = open_warehouse(&cfg).await?;
      let runs = warehouse.recent_runs(limit).await?;
      if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(ExitCode::SUCCESS);
      }
      for run in runs {
        println!(
          "{}  {:<4}  {}  PASS={} WARN={} FAIL={}",
          run.run_id, run.kind, run.started_at, run.passed, run.warned, run.failed
        );
      }
      Ok(ExitCode::SUCCESS)
    }
  }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn load_project(cfg: &RunnerConfig) -> anyhow::Result<Project> {
  Project::load_dir(&cfg.models_dir)
    .with_context(|| format!("failed to load models from {}", cfg.models_dir.display()))
}

async fn open_warehouse(cfg: &RunnerConfig) -> anyhow::Result<SqliteWarehouse> {
  SqliteWarehouse::open(&cfg.warehouse_path)
    .await
    .with_context(|| format!("failed to open warehouse at {:?}", cfg.warehouse_path))
}

/// Print the report and map failing error-severity checks to a non-zero exit.
fn finish(report: &RunReport, json: bool) -> anyhow::Result<ExitCode> {
  if json {
    println!("{}", serde_json::to_string_pretty(report)?);
  } else {
    for check in &report.checks {
      if check.status == CheckStatus::Pass {
        continue;
      }
      println!("{:<4}  {}  ({} failing)", check.status, check.name, check.failures);
      for sample in &check.samples {
        println!("        {sample}");
      }
      if let Some(message) = &check.message {
        println!("        {message}");
      }
    }
    println!("{}", report.summary());
  }

  Ok(if report.has_failures() { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}
