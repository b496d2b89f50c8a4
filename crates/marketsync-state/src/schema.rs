//! `SQLite` DDL for the state database.

/// Fixed-width UTC timestamp format; lexical order equals time order.
pub const TIMESTAMP_FMT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

/// Idempotent DDL for every state table.
///
/// `idx_pipeline_runs_single_running` backs the single-running-run rule at
/// the storage level: a second `running` row for the same pipeline fails
/// with a constraint violation even if two processes race.
pub const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS pipeline_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    records_processed INTEGER NOT NULL DEFAULT 0,
    records_failed INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    resumed_from INTEGER REFERENCES pipeline_runs(id),
    owner TEXT NOT NULL,
    heartbeat_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_pipeline_runs_single_running
    ON pipeline_runs (pipeline) WHERE status = 'running';

CREATE INDEX IF NOT EXISTS idx_pipeline_runs_pipeline ON pipeline_runs (pipeline, id);

CREATE TABLE IF NOT EXISTS run_sources (
    run_id INTEGER NOT NULL REFERENCES pipeline_runs(id),
    source TEXT NOT NULL,
    status TEXT NOT NULL,
    cursor TEXT,
    records_processed INTEGER NOT NULL DEFAULT 0,
    records_failed INTEGER NOT NULL DEFAULT 0,
    records_skipped INTEGER NOT NULL DEFAULT 0,
    carried_over INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (run_id, source)
);

CREATE TABLE IF NOT EXISTS market_records (
    symbol TEXT NOT NULL,
    observed_at TEXT NOT NULL,
    price REAL NOT NULL,
    volume REAL,
    market_cap REAL,
    source_name TEXT NOT NULL,
    ingested_at TEXT NOT NULL,
    PRIMARY KEY (symbol, observed_at)
);

CREATE TABLE IF NOT EXISTS source_watermarks (
    pipeline TEXT NOT NULL,
    source TEXT NOT NULL,
    high_watermark TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (pipeline, source)
);

CREATE TABLE IF NOT EXISTS rejected_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pipeline TEXT NOT NULL,
    run_id INTEGER NOT NULL REFERENCES pipeline_runs(id),
    source TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    error_message TEXT NOT NULL,
    error_category TEXT NOT NULL,
    failed_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_rejected_pipeline_run ON rejected_records (pipeline, run_id);
";
