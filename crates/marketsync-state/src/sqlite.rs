//! `SQLite`-backed implementation of the storage contracts.
//!
//! Uses a single `Mutex<Connection>` for thread safety. Run creation takes
//! an `IMMEDIATE` transaction so the single-running check and the insert
//! cannot interleave with another process sharing the file.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use marketsync_types::error::ErrorCategory;
use marketsync_types::record::{RecordKey, UnifiedRecord};
use marketsync_types::state::{
    Checkpoint, NewRun, PipelineId, ProgressUpdate, RunError, RunStatus, SourceCheckpoint,
    SourceName, SourceStatus,
};
use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior};

use crate::backend::{
    lease_expired, CheckpointStore, RecordStore, RejectStore, RejectedRecord, UpsertSummary,
    WatermarkStore,
};
use crate::error::{self, StateError};
use crate::schema::{CREATE_TABLES, TIMESTAMP_FMT};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const RUN_COLUMNS: &str = "id, pipeline, status, started_at, finished_at, records_processed, \
     records_failed, last_error, resumed_from, owner, heartbeat_at";

const RECORD_COLUMNS: &str =
    "symbol, observed_at, price, volume, market_cap, source_name, ingested_at";

/// `SQLite`-backed state storage.
///
/// Create with [`SqliteStateBackend::open`] for file-backed persistence
/// or [`SqliteStateBackend::in_memory`] for tests.
pub struct SqliteStateBackend {
    conn: Mutex<Connection>,
}

/// Raw `pipeline_runs` row before decoding.
struct RunRow {
    id: i64,
    pipeline: String,
    status: String,
    started_at: String,
    finished_at: Option<String>,
    records_processed: i64,
    records_failed: i64,
    last_error: Option<String>,
    resumed_from: Option<i64>,
    owner: String,
    heartbeat_at: String,
}

/// Raw `run_sources` row before decoding.
struct SourceRow {
    source: String,
    status: String,
    cursor: Option<String>,
    records_processed: i64,
    records_failed: i64,
    records_skipped: i64,
    carried_over: bool,
    error: Option<String>,
    updated_at: String,
}

/// Raw `market_records` row before decoding.
struct RecordRow {
    symbol: String,
    observed_at: String,
    price: f64,
    volume: Option<f64>,
    market_cap: Option<f64>,
    source_name: String,
    ingested_at: String,
}

impl SqliteStateBackend {
    /// Open or create a `SQLite` state database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Io`] if the directory can't be created,
    /// or [`StateError::Sqlite`] if the database can't be opened.
    pub fn open(path: &Path) -> error::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Self::init(conn)
    }

    /// Create an in-memory `SQLite` backend (for testing).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Sqlite`] if the in-memory database can't
    /// be initialized.
    pub fn in_memory() -> error::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> error::Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Acquire the connection lock.
    fn lock_conn(&self) -> error::Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StateError::LockPoisoned)
    }

    fn read_run(conn: &Connection, run_id: i64) -> error::Result<Option<Checkpoint>> {
        let row = conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE id = ?1"),
                [run_id],
                |row| {
                    Ok(RunRow {
                        id: row.get(0)?,
                        pipeline: row.get(1)?,
                        status: row.get(2)?,
                        started_at: row.get(3)?,
                        finished_at: row.get(4)?,
                        records_processed: row.get(5)?,
                        records_failed: row.get(6)?,
                        last_error: row.get(7)?,
                        resumed_from: row.get(8)?,
                        owner: row.get(9)?,
                        heartbeat_at: row.get(10)?,
                    })
                },
            )
            .optional()
            .map_err(StateError::context("read_run: select run"))?;
        let Some(row) = row else {
            return Ok(None);
        };

        let mut stmt = conn
            .prepare(
                "SELECT source, status, cursor, records_processed, records_failed, \
                 records_skipped, carried_over, error, updated_at \
                 FROM run_sources WHERE run_id = ?1 ORDER BY source",
            )
            .map_err(StateError::context("read_run: prepare sources"))?;
        let source_rows = stmt
            .query_map([run_id], |row| {
                Ok(SourceRow {
                    source: row.get(0)?,
                    status: row.get(1)?,
                    cursor: row.get(2)?,
                    records_processed: row.get(3)?,
                    records_failed: row.get(4)?,
                    records_skipped: row.get(5)?,
                    carried_over: row.get(6)?,
                    error: row.get(7)?,
                    updated_at: row.get(8)?,
                })
            })
            .map_err(StateError::context("read_run: query sources"))?
            .collect::<Result<Vec<_>, _>>()?;

        let sources = source_rows
            .into_iter()
            .map(decode_source)
            .collect::<error::Result<Vec<_>>>()?;
        decode_run(row, sources).map(Some)
    }

    fn run_status(tx: &Transaction<'_>, run_id: i64) -> error::Result<RunStatus> {
        let raw: Option<String> = tx
            .query_row(
                "SELECT status FROM pipeline_runs WHERE id = ?1",
                [run_id],
                |row| row.get(0),
            )
            .optional()?;
        let raw = raw.ok_or(StateError::RunNotFound(run_id))?;
        RunStatus::parse(&raw).ok_or_else(|| StateError::corrupt("pipeline_runs.status", raw))
    }

    fn close_run(
        tx: &Transaction<'_>,
        run_id: i64,
        status: RunStatus,
        error: Option<&RunError>,
        now: DateTime<Utc>,
    ) -> error::Result<()> {
        let error_json = error.map(serde_json::to_string).transpose()?;
        tx.execute(
            "UPDATE pipeline_runs SET status = ?1, finished_at = ?2, \
             last_error = COALESCE(?3, last_error) WHERE id = ?4",
            rusqlite::params![status.as_str(), fmt_ts(now), error_json, run_id],
        )
        .map_err(StateError::context("close_run: update"))?;
        Ok(())
    }

    fn running_run(tx: &Transaction<'_>, pipeline: &PipelineId) -> error::Result<Option<(i64, String)>> {
        Ok(tx
            .query_row(
                "SELECT id, heartbeat_at FROM pipeline_runs \
                 WHERE pipeline = ?1 AND status = 'running'",
                [pipeline.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?)
    }
}

impl CheckpointStore for SqliteStateBackend {
    fn create_run(&self, new_run: &NewRun) -> error::Result<i64> {
        let mut conn = self.lock_conn()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(StateError::context("create_run: begin tx"))?;
        let now = Utc::now();

        if let Some((active_id, heartbeat_raw)) = Self::running_run(&tx, &new_run.pipeline)? {
            let heartbeat = parse_ts(&heartbeat_raw, "pipeline_runs.heartbeat_at")?;
            if !lease_expired(heartbeat, now, new_run.lease_ttl) {
                return Err(StateError::AlreadyRunning {
                    pipeline: new_run.pipeline.clone(),
                    run_id: active_id,
                });
            }
            tracing::warn!(
                pipeline = %new_run.pipeline,
                run_id = active_id,
                heartbeat_at = %heartbeat,
                "Abandoning run with expired lease"
            );
            let err = RunError::new(
                ErrorCategory::Abandoned,
                format!("lease expired, last heartbeat at {heartbeat}"),
            );
            Self::close_run(&tx, active_id, RunStatus::Failed, Some(&err), now)?;
        }

        tx.execute(
            "INSERT INTO pipeline_runs (pipeline, status, started_at, resumed_from, owner, heartbeat_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?3)",
            rusqlite::params![
                new_run.pipeline.as_str(),
                RunStatus::Running.as_str(),
                fmt_ts(now),
                new_run.resumed_from,
                new_run.owner,
            ],
        )
        .map_err(StateError::context("create_run: insert run"))?;
        let run_id = tx.last_insert_rowid();

        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO run_sources (run_id, source, status, cursor, carried_over, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .map_err(StateError::context("create_run: prepare sources"))?;
            for source in &new_run.sources {
                let carried = new_run.carried.iter().find(|(name, _)| name == source);
                let (status, cursor) = match carried {
                    Some((_, cursor)) => (SourceStatus::Completed, cursor.clone()),
                    None => (SourceStatus::Pending, None),
                };
                stmt.execute(rusqlite::params![
                    run_id,
                    source.as_str(),
                    status.as_str(),
                    cursor,
                    carried.is_some(),
                    fmt_ts(now),
                ])
                .map_err(StateError::context("create_run: insert source"))?;
            }
        }

        tx.commit()
            .map_err(StateError::context("create_run: commit"))?;
        Ok(run_id)
    }

    fn update_progress(
        &self,
        run_id: i64,
        source: &SourceName,
        update: &ProgressUpdate,
    ) -> error::Result<()> {
        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(StateError::context("update_progress: begin tx"))?;

        let current = Self::run_status(&tx, run_id)?;
        if current != RunStatus::Running {
            return Err(StateError::InvalidTransition {
                run_id,
                from: current,
                to: RunStatus::Running,
            });
        }

        let now = fmt_ts(Utc::now());
        let error_json = update.error.as_ref().map(serde_json::to_string).transpose()?;
        tx.execute(
            "INSERT INTO run_sources \
             (run_id, source, status, cursor, records_processed, records_failed, records_skipped, error, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
             ON CONFLICT(run_id, source) DO UPDATE SET \
             status = excluded.status, \
             cursor = COALESCE(excluded.cursor, run_sources.cursor), \
             records_processed = run_sources.records_processed + excluded.records_processed, \
             records_failed = run_sources.records_failed + excluded.records_failed, \
             records_skipped = run_sources.records_skipped + excluded.records_skipped, \
             error = COALESCE(excluded.error, run_sources.error), \
             updated_at = excluded.updated_at",
            rusqlite::params![
                run_id,
                source.as_str(),
                update.status.as_str(),
                update.cursor,
                to_i64(update.delta_processed),
                to_i64(update.delta_failed),
                to_i64(update.delta_skipped),
                error_json,
                now,
            ],
        )
        .map_err(StateError::context("update_progress: upsert source"))?;
        tx.execute(
            "UPDATE pipeline_runs SET records_processed = records_processed + ?1, \
             records_failed = records_failed + ?2, heartbeat_at = ?3 WHERE id = ?4",
            rusqlite::params![
                to_i64(update.delta_processed),
                to_i64(update.delta_failed),
                now,
                run_id,
            ],
        )
        .map_err(StateError::context("update_progress: update run"))?;

        tx.commit()
            .map_err(StateError::context("update_progress: commit"))?;
        Ok(())
    }

    fn heartbeat(&self, run_id: i64) -> error::Result<bool> {
        let conn = self.lock_conn()?;
        let updated = conn
            .execute(
                "UPDATE pipeline_runs SET heartbeat_at = ?1 WHERE id = ?2 AND status = ?3",
                rusqlite::params![fmt_ts(Utc::now()), run_id, RunStatus::Running.as_str()],
            )
            .map_err(StateError::context("heartbeat: update run"))?;
        Ok(updated > 0)
    }

    fn finalize(
        &self,
        run_id: i64,
        status: RunStatus,
        error: Option<&RunError>,
    ) -> error::Result<()> {
        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(StateError::context("finalize: begin tx"))?;

        let current = Self::run_status(&tx, run_id)?;
        if current == status && status.is_terminal() {
            return Ok(());
        }
        if !status.is_terminal() || current.is_terminal() {
            return Err(StateError::InvalidTransition {
                run_id,
                from: current,
                to: status,
            });
        }

        Self::close_run(&tx, run_id, status, error, Utc::now())?;
        tx.commit().map_err(StateError::context("finalize: commit"))?;
        Ok(())
    }

    fn load_latest(&self, pipeline: &PipelineId) -> error::Result<Option<Checkpoint>> {
        let conn = self.lock_conn()?;
        let latest: Option<i64> = conn
            .query_row(
                "SELECT id FROM pipeline_runs WHERE pipeline = ?1 ORDER BY id DESC LIMIT 1",
                [pipeline.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        match latest {
            Some(run_id) => Self::read_run(&conn, run_id),
            None => Ok(None),
        }
    }

    fn get_run(&self, run_id: i64) -> error::Result<Option<Checkpoint>> {
        let conn = self.lock_conn()?;
        Self::read_run(&conn, run_id)
    }

    fn list_runs(&self, pipeline: &PipelineId, limit: usize) -> error::Result<Vec<Checkpoint>> {
        let conn = self.lock_conn()?;
        let ids = {
            let mut stmt = conn
                .prepare("SELECT id FROM pipeline_runs WHERE pipeline = ?1 ORDER BY id DESC LIMIT ?2")
                .map_err(StateError::context("list_runs: prepare"))?;
            let rows = stmt.query_map(
                rusqlite::params![pipeline.as_str(), i64::try_from(limit).unwrap_or(i64::MAX)],
                |row| row.get::<_, i64>(0),
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        let mut runs = Vec::with_capacity(ids.len());
        for run_id in ids {
            if let Some(run) = Self::read_run(&conn, run_id)? {
                runs.push(run);
            }
        }
        Ok(runs)
    }

    fn abandon_running(&self, pipeline: &PipelineId, reason: &str) -> error::Result<Option<i64>> {
        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(StateError::context("abandon_running: begin tx"))?;
        let Some((run_id, _)) = Self::running_run(&tx, pipeline)? else {
            return Ok(None);
        };
        let err = RunError::new(ErrorCategory::Abandoned, reason);
        Self::close_run(&tx, run_id, RunStatus::Failed, Some(&err), Utc::now())?;
        tx.commit()
            .map_err(StateError::context("abandon_running: commit"))?;
        Ok(Some(run_id))
    }
}

impl RecordStore for SqliteStateBackend {
    fn upsert_batch(&self, records: &[UnifiedRecord]) -> error::Result<UpsertSummary> {
        if records.is_empty() {
            return Ok(UpsertSummary::default());
        }

        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(StateError::context("upsert_batch: begin tx"))?;
        let mut exists = tx
            .prepare("SELECT 1 FROM market_records WHERE symbol = ?1 AND observed_at = ?2")
            .map_err(StateError::context("upsert_batch: prepare lookup"))?;
        let mut upsert = tx
            .prepare(&format!(
                "INSERT INTO market_records ({RECORD_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
                 ON CONFLICT(symbol, observed_at) DO UPDATE SET \
                 price = excluded.price, volume = excluded.volume, \
                 market_cap = excluded.market_cap, source_name = excluded.source_name, \
                 ingested_at = excluded.ingested_at \
                 WHERE excluded.ingested_at > market_records.ingested_at"
            ))
            .map_err(StateError::context("upsert_batch: prepare upsert"))?;

        let mut summary = UpsertSummary::default();
        for record in records {
            let observed_at = fmt_ts(record.observed_at);
            let existed = exists
                .exists(rusqlite::params![record.symbol, observed_at])
                .map_err(StateError::context("upsert_batch: lookup"))?;
            let changed = upsert
                .execute(rusqlite::params![
                    record.symbol,
                    observed_at,
                    record.price,
                    record.volume,
                    record.market_cap,
                    record.source_name.as_str(),
                    fmt_ts(record.ingested_at),
                ])
                .map_err(StateError::context("upsert_batch: execute"))?;
            match (existed, changed) {
                (false, _) => summary.inserted += 1,
                (true, 0) => summary.unchanged += 1,
                (true, _) => summary.updated += 1,
            }
        }
        drop(exists);
        drop(upsert);
        tx.commit()
            .map_err(StateError::context("upsert_batch: commit"))?;

        Ok(summary)
    }

    fn get_record(&self, key: &RecordKey) -> error::Result<Option<UnifiedRecord>> {
        let conn = self.lock_conn()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM market_records \
                     WHERE symbol = ?1 AND observed_at = ?2"
                ),
                rusqlite::params![key.symbol, fmt_ts(key.observed_at)],
                record_row,
            )
            .optional()?;
        row.map(decode_record).transpose()
    }

    fn count_records(&self) -> error::Result<u64> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM market_records", [], |row| row.get(0))?;
        Ok(to_u64(count))
    }

    fn list_records(&self) -> error::Result<Vec<UnifiedRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM market_records ORDER BY symbol, observed_at"
            ))
            .map_err(StateError::context("list_records: prepare"))?;
        let rows = stmt
            .query_map([], record_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(decode_record).collect()
    }
}

impl WatermarkStore for SqliteStateBackend {
    fn get_watermark(
        &self,
        pipeline: &PipelineId,
        source: &SourceName,
    ) -> error::Result<Option<DateTime<Utc>>> {
        let conn = self.lock_conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT high_watermark FROM source_watermarks WHERE pipeline = ?1 AND source = ?2",
                rusqlite::params![pipeline.as_str(), source.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|raw| parse_ts(&raw, "source_watermarks.high_watermark"))
            .transpose()
    }

    fn advance_watermark(
        &self,
        pipeline: &PipelineId,
        source: &SourceName,
        watermark: DateTime<Utc>,
    ) -> error::Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO source_watermarks (pipeline, source, high_watermark, updated_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(pipeline, source) DO UPDATE SET \
             high_watermark = excluded.high_watermark, updated_at = excluded.updated_at \
             WHERE excluded.high_watermark > source_watermarks.high_watermark",
            rusqlite::params![
                pipeline.as_str(),
                source.as_str(),
                fmt_ts(watermark),
                fmt_ts(Utc::now()),
            ],
        )
        .map_err(StateError::context("advance_watermark: upsert"))?;
        Ok(())
    }
}

impl RejectStore for SqliteStateBackend {
    fn insert_rejected(
        &self,
        pipeline: &PipelineId,
        run_id: i64,
        records: &[RejectedRecord],
    ) -> error::Result<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let conn = self.lock_conn()?;
        let tx = conn
            .unchecked_transaction()
            .map_err(StateError::context("insert_rejected: begin tx"))?;
        let mut stmt = tx
            .prepare(
                "INSERT INTO rejected_records \
                 (pipeline, run_id, source, payload_json, error_message, error_category, failed_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )
            .map_err(StateError::context("insert_rejected: prepare"))?;

        let mut count = 0u64;
        for record in records {
            stmt.execute(rusqlite::params![
                pipeline.as_str(),
                run_id,
                record.source.as_str(),
                record.payload_json,
                record.error_message,
                record.error_category.to_string(),
                fmt_ts(record.failed_at),
            ])
            .map_err(StateError::context("insert_rejected: execute"))?;
            count += 1;
        }
        drop(stmt);
        tx.commit()
            .map_err(StateError::context("insert_rejected: commit"))?;

        Ok(count)
    }

    fn count_rejected(&self, pipeline: &PipelineId, run_id: i64) -> error::Result<u64> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM rejected_records WHERE pipeline = ?1 AND run_id = ?2",
            rusqlite::params![pipeline.as_str(), run_id],
            |row| row.get(0),
        )?;
        Ok(to_u64(count))
    }
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FMT).to_string()
}

fn parse_ts(raw: &str, column: &'static str) -> error::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StateError::corrupt(column, raw))
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn record_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecordRow> {
    Ok(RecordRow {
        symbol: row.get(0)?,
        observed_at: row.get(1)?,
        price: row.get(2)?,
        volume: row.get(3)?,
        market_cap: row.get(4)?,
        source_name: row.get(5)?,
        ingested_at: row.get(6)?,
    })
}

fn decode_record(row: RecordRow) -> error::Result<UnifiedRecord> {
    Ok(UnifiedRecord {
        symbol: row.symbol,
        price: row.price,
        volume: row.volume,
        market_cap: row.market_cap,
        source_name: SourceName::new(row.source_name),
        observed_at: parse_ts(&row.observed_at, "market_records.observed_at")?,
        ingested_at: parse_ts(&row.ingested_at, "market_records.ingested_at")?,
    })
}

fn decode_error(raw: Option<String>) -> error::Result<Option<RunError>> {
    raw.map(|json| serde_json::from_str(&json).map_err(StateError::from))
        .transpose()
}

fn decode_source(row: SourceRow) -> error::Result<SourceCheckpoint> {
    let status = SourceStatus::parse(&row.status)
        .ok_or_else(|| StateError::corrupt("run_sources.status", row.status.clone()))?;
    Ok(SourceCheckpoint {
        source: SourceName::new(row.source),
        status,
        cursor: row.cursor,
        records_processed: to_u64(row.records_processed),
        records_failed: to_u64(row.records_failed),
        records_skipped: to_u64(row.records_skipped),
        carried_over: row.carried_over,
        error: decode_error(row.error)?,
        updated_at: parse_ts(&row.updated_at, "run_sources.updated_at")?,
    })
}

fn decode_run(row: RunRow, sources: Vec<SourceCheckpoint>) -> error::Result<Checkpoint> {
    let status = RunStatus::parse(&row.status)
        .ok_or_else(|| StateError::corrupt("pipeline_runs.status", row.status.clone()))?;
    Ok(Checkpoint {
        run_id: row.id,
        pipeline: PipelineId::new(row.pipeline),
        status,
        started_at: parse_ts(&row.started_at, "pipeline_runs.started_at")?,
        finished_at: row
            .finished_at
            .map(|raw| parse_ts(&raw, "pipeline_runs.finished_at"))
            .transpose()?,
        records_processed: to_u64(row.records_processed),
        records_failed: to_u64(row.records_failed),
        sources,
        last_error: decode_error(row.last_error)?,
        resumed_from: row.resumed_from,
        owner: row.owner,
        heartbeat_at: parse_ts(&row.heartbeat_at, "pipeline_runs.heartbeat_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const LONG_LEASE: Duration = Duration::from_secs(300);

    fn pid(name: &str) -> PipelineId {
        PipelineId::new(name)
    }

    fn src(name: &str) -> SourceName {
        SourceName::new(name)
    }

    fn new_run(pipeline: &str, sources: &[&str]) -> NewRun {
        NewRun {
            pipeline: pid(pipeline),
            sources: sources.iter().map(|s| src(s)).collect(),
            carried: Vec::new(),
            resumed_from: None,
            owner: "test-owner".into(),
            lease_ttl: LONG_LEASE,
        }
    }

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, hour, 0, 0).unwrap()
    }

    fn record(symbol: &str, hour: u32, price: f64, ingested: DateTime<Utc>) -> UnifiedRecord {
        UnifiedRecord {
            symbol: symbol.into(),
            price,
            volume: Some(10.0),
            market_cap: None,
            source_name: src("csv"),
            observed_at: ts(hour),
            ingested_at: ingested,
        }
    }

    #[test]
    fn run_lifecycle() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let run_id = backend.create_run(&new_run("p", &["a", "b"])).unwrap();
        assert!(run_id > 0);

        let run = backend.get_run(run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert!(run.finished_at.is_none());
        assert_eq!(run.sources.len(), 2);
        assert!(run.sources.iter().all(|s| s.status == SourceStatus::Pending));

        backend
            .update_progress(run_id, &src("a"), &ProgressUpdate::batch("{\"offset\":5}", 5, 1))
            .unwrap();
        backend
            .finalize(run_id, RunStatus::Succeeded, None)
            .unwrap();

        let run = backend.get_run(run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Succeeded);
        assert_eq!(run.records_processed, 5);
        assert_eq!(run.records_failed, 1);
        assert!(run.finished_at.is_some());
        let a = run.source(&src("a")).unwrap();
        assert_eq!(a.cursor.as_deref(), Some("{\"offset\":5}"));
    }

    #[test]
    fn progress_accumulates_and_keeps_cursor() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let run_id = backend.create_run(&new_run("p", &["a"])).unwrap();

        backend
            .update_progress(run_id, &src("a"), &ProgressUpdate::batch("c1", 3, 0))
            .unwrap();
        backend
            .update_progress(
                run_id,
                &src("a"),
                &ProgressUpdate {
                    status: SourceStatus::Completed,
                    cursor: None,
                    delta_processed: 2,
                    delta_failed: 1,
                    delta_skipped: 4,
                    error: None,
                },
            )
            .unwrap();

        let run = backend.get_run(run_id).unwrap().unwrap();
        let a = run.source(&src("a")).unwrap();
        assert_eq!(a.status, SourceStatus::Completed);
        assert_eq!(a.cursor.as_deref(), Some("c1"));
        assert_eq!(a.records_processed, 5);
        assert_eq!(a.records_failed, 1);
        assert_eq!(a.records_skipped, 4);
        assert_eq!(run.records_processed, 5);
    }

    #[test]
    fn second_create_run_is_rejected_without_mutation() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let first = backend.create_run(&new_run("p", &["a"])).unwrap();
        backend
            .update_progress(first, &src("a"), &ProgressUpdate::batch("c", 2, 0))
            .unwrap();
        let before = backend.get_run(first).unwrap().unwrap();

        let err = backend.create_run(&new_run("p", &["a"])).unwrap_err();
        match err {
            StateError::AlreadyRunning { run_id, .. } => assert_eq!(run_id, first),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(backend.get_run(first).unwrap().unwrap(), before);
        assert_eq!(backend.list_runs(&pid("p"), 10).unwrap().len(), 1);
    }

    #[test]
    fn different_pipelines_run_independently() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let a = backend.create_run(&new_run("a", &["s"])).unwrap();
        let b = backend.create_run(&new_run("b", &["s"])).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn expired_lease_is_abandoned_by_next_run() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let stale = backend.create_run(&new_run("p", &["a"])).unwrap();

        let mut next = new_run("p", &["a"]);
        next.lease_ttl = Duration::ZERO;
        let fresh = backend.create_run(&next).unwrap();
        assert!(fresh > stale);

        let old = backend.get_run(stale).unwrap().unwrap();
        assert_eq!(old.status, RunStatus::Failed);
        assert_eq!(
            old.last_error.map(|e| e.category),
            Some(ErrorCategory::Abandoned)
        );
    }

    #[test]
    fn finalize_is_idempotent_for_same_status() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let run_id = backend.create_run(&new_run("p", &["a"])).unwrap();
        backend.finalize(run_id, RunStatus::Partial, None).unwrap();
        let first = backend.get_run(run_id).unwrap().unwrap();

        backend.finalize(run_id, RunStatus::Partial, None).unwrap();
        assert_eq!(backend.get_run(run_id).unwrap().unwrap(), first);
    }

    #[test]
    fn heartbeat_refreshes_running_run_only() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let run_id = backend.create_run(&new_run("p", &["a"])).unwrap();
        let before = backend.get_run(run_id).unwrap().unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert!(backend.heartbeat(run_id).unwrap());
        let after = backend.get_run(run_id).unwrap().unwrap();
        assert!(after.heartbeat_at > before.heartbeat_at);
        assert_eq!(after.status, RunStatus::Running);
        assert_eq!(after.records_processed, 0);

        backend.finalize(run_id, RunStatus::Succeeded, None).unwrap();
        assert!(!backend.heartbeat(run_id).unwrap());
        assert!(!backend.heartbeat(run_id + 100).unwrap());
    }

    #[test]
    fn finalize_rejects_second_terminal_status() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let run_id = backend.create_run(&new_run("p", &["a"])).unwrap();
        backend.finalize(run_id, RunStatus::Failed, None).unwrap();

        let err = backend
            .finalize(run_id, RunStatus::Succeeded, None)
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
        let err = backend
            .finalize(run_id, RunStatus::Running, None)
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
    }

    #[test]
    fn finalize_unknown_run() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let err = backend.finalize(42, RunStatus::Failed, None).unwrap_err();
        assert!(matches!(err, StateError::RunNotFound(42)));
    }

    #[test]
    fn progress_after_finalize_is_rejected() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let run_id = backend.create_run(&new_run("p", &["a"])).unwrap();
        backend.finalize(run_id, RunStatus::Failed, None).unwrap();
        let err = backend
            .update_progress(run_id, &src("a"), &ProgressUpdate::batch("c", 1, 0))
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
    }

    #[test]
    fn finalize_stores_structured_error() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let run_id = backend.create_run(&new_run("p", &["a"])).unwrap();
        let err = RunError::new(ErrorCategory::Server, "HTTP 503").for_source(src("a"));
        backend
            .finalize(run_id, RunStatus::Failed, Some(&err))
            .unwrap();
        let run = backend.get_run(run_id).unwrap().unwrap();
        assert_eq!(run.last_error, Some(err));
    }

    #[test]
    fn carried_sources_start_completed() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let mut run = new_run("p", &["a", "b"]);
        run.carried = vec![(src("a"), Some("{\"offset\":10}".into()))];
        run.resumed_from = None;
        let run_id = backend.create_run(&run).unwrap();

        let checkpoint = backend.get_run(run_id).unwrap().unwrap();
        let a = checkpoint.source(&src("a")).unwrap();
        assert_eq!(a.status, SourceStatus::Completed);
        assert!(a.carried_over);
        assert_eq!(a.records_processed, 0);
        assert_eq!(a.cursor.as_deref(), Some("{\"offset\":10}"));
        let b = checkpoint.source(&src("b")).unwrap();
        assert_eq!(b.status, SourceStatus::Pending);
        assert!(!b.carried_over);
    }

    #[test]
    fn load_latest_and_history_are_newest_first() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        assert!(backend.load_latest(&pid("p")).unwrap().is_none());

        let r1 = backend.create_run(&new_run("p", &["a"])).unwrap();
        backend.finalize(r1, RunStatus::Failed, None).unwrap();
        let mut second = new_run("p", &["a"]);
        second.resumed_from = Some(r1);
        let r2 = backend.create_run(&second).unwrap();

        let latest = backend.load_latest(&pid("p")).unwrap().unwrap();
        assert_eq!(latest.run_id, r2);
        assert_eq!(latest.resumed_from, Some(r1));

        let history = backend.list_runs(&pid("p"), 10).unwrap();
        let ids: Vec<i64> = history.iter().map(|c| c.run_id).collect();
        assert_eq!(ids, vec![r2, r1]);
        assert_eq!(backend.list_runs(&pid("p"), 1).unwrap().len(), 1);
    }

    #[test]
    fn abandon_running_closes_live_run() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        assert!(backend.abandon_running(&pid("p"), "operator").unwrap().is_none());

        let run_id = backend.create_run(&new_run("p", &["a"])).unwrap();
        let closed = backend.abandon_running(&pid("p"), "operator").unwrap();
        assert_eq!(closed, Some(run_id));

        let run = backend.get_run(run_id).unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        // The slot is free again.
        backend.create_run(&new_run("p", &["a"])).unwrap();
    }

    #[test]
    fn upsert_inserts_then_is_idempotent() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let at = Utc::now();
        let batch = vec![record("BTC", 1, 100.0, at), record("ETH", 1, 3.0, at)];

        let first = backend.upsert_batch(&batch).unwrap();
        assert_eq!(first.inserted, 2);

        let second = backend.upsert_batch(&batch).unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(second.unchanged, 2);
        assert_eq!(backend.count_records().unwrap(), 2);
    }

    #[test]
    fn upsert_overwrites_only_when_newer() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let t0 = ts(10);
        let t1 = ts(11);
        backend
            .upsert_batch(&[record("BTC", 1, 100.0, t1)])
            .unwrap();

        let stale = backend
            .upsert_batch(&[record("BTC", 1, 90.0, t0)])
            .unwrap();
        assert_eq!(stale.unchanged, 1);
        let key = record("BTC", 1, 0.0, t0).key();
        assert_eq!(backend.get_record(&key).unwrap().unwrap().price, 100.0);

        let newer = backend
            .upsert_batch(&[record("BTC", 1, 110.0, ts(12))])
            .unwrap();
        assert_eq!(newer.updated, 1);
        let stored = backend.get_record(&key).unwrap().unwrap();
        assert_eq!(stored.price, 110.0);
        assert_eq!(stored.ingested_at, ts(12));
        assert_eq!(backend.count_records().unwrap(), 1);
    }

    #[test]
    fn list_records_is_ordered_by_key() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let at = Utc::now();
        backend
            .upsert_batch(&[
                record("ETH", 2, 3.0, at),
                record("BTC", 2, 100.0, at),
                record("BTC", 1, 99.0, at),
            ])
            .unwrap();
        let keys: Vec<(String, u32)> = backend
            .list_records()
            .unwrap()
            .into_iter()
            .map(|r| (r.symbol, chrono::Timelike::hour(&r.observed_at)))
            .collect();
        assert_eq!(
            keys,
            vec![("BTC".into(), 1), ("BTC".into(), 2), ("ETH".into(), 2)]
        );
    }

    #[test]
    fn watermark_only_advances() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        assert!(backend
            .get_watermark(&pid("p"), &src("csv"))
            .unwrap()
            .is_none());

        backend
            .advance_watermark(&pid("p"), &src("csv"), ts(5))
            .unwrap();
        backend
            .advance_watermark(&pid("p"), &src("csv"), ts(3))
            .unwrap();
        assert_eq!(
            backend.get_watermark(&pid("p"), &src("csv")).unwrap(),
            Some(ts(5))
        );

        backend
            .advance_watermark(&pid("p"), &src("csv"), ts(7))
            .unwrap();
        assert_eq!(
            backend.get_watermark(&pid("p"), &src("csv")).unwrap(),
            Some(ts(7))
        );
    }

    #[test]
    fn rejected_records_insert_and_count() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let run_id = backend.create_run(&new_run("p", &["csv"])).unwrap();
        let records = vec![
            RejectedRecord {
                source: src("csv"),
                payload_json: r#"{"symbol":"BTC"}"#.into(),
                error_message: "missing required field 'price'".into(),
                error_category: ErrorCategory::Validation,
                failed_at: Utc::now(),
            },
            RejectedRecord {
                source: src("csv"),
                payload_json: r#"{"price":"-1"}"#.into(),
                error_message: "missing required field 'symbol'".into(),
                error_category: ErrorCategory::Validation,
                failed_at: Utc::now(),
            },
        ];

        let count = backend
            .insert_rejected(&pid("p"), run_id, &records)
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(backend.count_rejected(&pid("p"), run_id).unwrap(), 2);
        assert_eq!(backend.insert_rejected(&pid("p"), run_id, &[]).unwrap(), 0);
    }

    #[test]
    fn rejected_records_invalid_run_id_includes_operation_context() {
        let backend = SqliteStateBackend::in_memory().unwrap();
        let records = vec![RejectedRecord {
            source: src("csv"),
            payload_json: "{}".into(),
            error_message: "bad row".into(),
            error_category: ErrorCategory::Validation,
            failed_at: Utc::now(),
        }];
        let err = backend
            .insert_rejected(&pid("p"), 999, &records)
            .expect_err("invalid run id should fail");
        assert!(err.to_string().contains("insert_rejected"));
    }

    #[test]
    fn file_backed_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.db");
        let run_id = {
            let backend = SqliteStateBackend::open(&path).unwrap();
            backend.create_run(&new_run("p", &["a"])).unwrap()
        };

        let backend = SqliteStateBackend::open(&path).unwrap();
        let latest = backend.load_latest(&pid("p")).unwrap().unwrap();
        assert_eq!(latest.run_id, run_id);
        assert_eq!(latest.status, RunStatus::Running);
        assert!(matches!(
            backend.create_run(&new_run("p", &["a"])),
            Err(StateError::AlreadyRunning { .. })
        ));
    }

    #[test]
    fn timestamp_format_sorts_lexically() {
        let early = fmt_ts(Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap());
        let late = fmt_ts(Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap());
        assert!(early < late);
        assert_eq!(early, "2025-01-01T09:00:00.000000Z");
        assert_eq!(parse_ts(&early, "t").unwrap().to_rfc3339(), "2025-01-01T09:00:00+00:00");
    }
}
