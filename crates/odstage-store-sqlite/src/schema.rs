//! SQL schema for the odstage run history.
//!
//! Executed once at connection startup. Staged relations are created per
//! model from their declared columns; see `SqliteWarehouse::ensure_relation`.

/// Run history DDL; idempotent thanks to `CREATE TABLE IF NOT EXISTS`.
pub const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS _odstage_runs (
    run_id      TEXT PRIMARY KEY,
    kind        TEXT NOT NULL,      -- 'run' | 'test'
    started_at  TEXT NOT NULL,
    models_json TEXT NOT NULL,      -- JSON array of model outcomes
    passed      INTEGER NOT NULL,
    warned      INTEGER NOT NULL,
    failed      INTEGER NOT NULL
);

-- One row per evaluated check. Never updated.
CREATE TABLE IF NOT EXISTS _odstage_check_results (
    run_id      TEXT NOT NULL REFERENCES _odstage_runs(run_id),
    name        TEXT NOT NULL,
    model       TEXT NOT NULL,
    column_name TEXT,
    test        TEXT NOT NULL,
    severity    TEXT NOT NULL,      -- 'error' | 'warn'
    status      TEXT NOT NULL,      -- 'pass' | 'warn' | 'fail'
    failures    INTEGER NOT NULL,
    samples     TEXT NOT NULL DEFAULT '[]',
    note        TEXT,
    message     TEXT,
    PRIMARY KEY (run_id, name)
);

CREATE INDEX IF NOT EXISTS check_results_model_idx ON _odstage_check_results(model);

PRAGMA user_version = 1;
";

/// Prefix reserved for bookkeeping tables.
pub const INTERNAL_PREFIX: &str = "_odstage_";
