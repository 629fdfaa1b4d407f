//! Store - the DuckDB-backed persistence sink.
//!
//! One connection per store, guarded by a mutex. Every write goes through
//! `transaction`, so a failed table batch leaves nothing behind.

mod inventory;
mod runs;
mod usage;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Utc};
use duckdb::types::{TimeUnit, Value};
use duckdb::Connection;
use serde_json::{Map, Number, Value as Json};
use tracing::debug;

use crate::config::PipelineConfig;
use crate::init;
use crate::retry::{ensure_active, CancellationToken};
use crate::schema::{
    canonical_ts, from_epoch_us, sql_timestamp, PipelineRun, RunEntry, RunStatus, Table,
    UsageCounters,
};
use crate::sink::{BatchRows, BatchWrite, OpenedRun, RunRequest, Sink};
use crate::{Error, Result};

pub use runs::LoadAudit;

/// A profiling store for reading and writing snapshots.
pub struct Store {
    path: Option<PathBuf>,
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if needed) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        init::initialize(&conn)?;
        debug!(path = %path.display(), "Opened store");

        Ok(Self {
            path: Some(path.to_path_buf()),
            conn: Mutex::new(conn),
        })
    }

    /// Open an existing store for reading only. Writes through it fail.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotFound(format!("Store {}", path.display())));
        }
        let config = duckdb::Config::default().access_mode(duckdb::AccessMode::ReadOnly)?;
        let conn = Connection::open_with_flags(path, config)?;
        debug!(path = %path.display(), "Opened store read-only");

        Ok(Self {
            path: Some(path.to_path_buf()),
            conn: Mutex::new(conn),
        })
    }

    /// Open the store a pipeline config points at.
    pub fn open_for(config: &PipelineConfig) -> Result<Self> {
        Self::open(&config.db_path())
    }

    /// A private, in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init::initialize(&conn)?;
        Ok(Self {
            path: None,
            conn: Mutex::new(conn),
        })
    }

    /// Database file, or `None` for an in-memory store.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Exclusive access to the underlying connection.
    pub fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("Store connection lock poisoned".to_string()))
    }

    /// Run `f` inside a transaction: COMMIT on success, ROLLBACK on error.
    pub(crate) fn transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.connection()?;
        conn.execute("BEGIN TRANSACTION", [])?;

        match f(&conn) {
            Ok(value) => {
                if let Err(e) = conn.execute("COMMIT", []) {
                    let _ = conn.execute("ROLLBACK", []);
                    return Err(e.into());
                }
                Ok(value)
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    /// Run an ad-hoc read query. Cells keep their SQL type as JSON scalars;
    /// timestamps come back in the store's own text format.
    pub fn query(&self, sql: &str) -> Result<QueryResult> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query([])?;

        let columns: Vec<String> = rows
            .as_ref()
            .map(|stmt| stmt.column_names())
            .unwrap_or_default();

        let mut cells = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                record.push(to_json(row.get::<_, Value>(i)?));
            }
            cells.push(record);
        }

        Ok(QueryResult {
            columns,
            rows: cells,
        })
    }

    /// Every run recorded for `pipeline_name`, oldest first. All pipelines
    /// when `None`.
    pub fn runs(&self, pipeline_name: Option<&str>) -> Result<Vec<RunEntry>> {
        let conn = self.connection()?;
        runs::list(&conn, pipeline_name)
    }

    /// Ledger entry for one run.
    pub fn run(&self, run: &PipelineRun) -> Result<Option<RunEntry>> {
        let conn = self.connection()?;
        runs::get(&conn, &run.pipeline_name, run.execution_date)
    }

    /// Audit rows of the table batches committed for a run.
    pub fn load_audit(&self, run: &PipelineRun) -> Result<Vec<LoadAudit>> {
        let conn = self.connection()?;
        runs::load_audit(&conn, run)
    }
}

fn timestamp_json(unit: TimeUnit, value: i64) -> Json {
    let micros = match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    };
    match from_epoch_us(micros) {
        Ok(ts) => Json::String(sql_timestamp(&ts)),
        Err(_) => Json::Null,
    }
}

/// One result cell as a JSON scalar. Nested and exotic types fall back to
/// their debug text.
fn to_json(value: Value) -> Json {
    match value {
        Value::Null => Json::Null,
        Value::Boolean(b) => Json::Bool(b),
        Value::TinyInt(n) => n.into(),
        Value::SmallInt(n) => n.into(),
        Value::Int(n) => n.into(),
        Value::BigInt(n) => n.into(),
        Value::UTinyInt(n) => n.into(),
        Value::USmallInt(n) => n.into(),
        Value::UInt(n) => n.into(),
        Value::UBigInt(n) => n.into(),
        // SUM over BIGINT widens to HUGEINT.
        Value::HugeInt(n) => match i64::try_from(n) {
            Ok(n) => n.into(),
            Err(_) => Json::String(n.to_string()),
        },
        Value::Float(f) => Number::from_f64(f64::from(f)).map_or(Json::Null, Json::Number),
        Value::Double(f) => Number::from_f64(f).map_or(Json::Null, Json::Number),
        Value::Decimal(d) => Json::String(d.to_string()),
        Value::Timestamp(unit, value) => timestamp_json(unit, value),
        Value::Date32(days) => NaiveDate::from_num_days_from_ce_opt(days + 719_163)
            .map_or(Json::Null, |d| Json::String(d.format("%Y-%m-%d").to_string())),
        Value::Text(s) | Value::Enum(s) => Json::String(s),
        Value::Blob(b) => Json::String(format!("<blob {} bytes>", b.len())),
        other => Json::String(format!("{:?}", other)),
    }
}

/// Result of an ad-hoc query.
#[derive(Debug)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Json>>,
}

impl QueryResult {
    /// A cell as display text: strings unquoted, NULL spelled out.
    pub fn text(&self, row: usize, column: usize) -> String {
        match self.rows.get(row).and_then(|r| r.get(column)) {
            None | Some(Json::Null) => "NULL".to_string(),
            Some(Json::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }

    /// Each row as an object keyed by column name.
    pub fn records(&self) -> Vec<Map<String, Json>> {
        self.rows
            .iter()
            .map(|row| self.columns.iter().cloned().zip(row.iter().cloned()).collect())
            .collect()
    }
}

/// Insert `rows` in passes of `chunk_size`, checking `cancel` before each.
/// Runs inside the caller's transaction.
fn insert_chunks<T>(
    conn: &Connection,
    rows: &[T],
    chunk_size: usize,
    cancel: &CancellationToken,
    insert: impl Fn(&Connection, &[T]) -> Result<usize>,
) -> Result<usize> {
    let mut written = 0;
    for chunk in rows.chunks(chunk_size.max(1)) {
        ensure_active(cancel)?;
        written += insert(conn, chunk)?;
    }
    Ok(written)
}

impl Sink for Store {
    fn insert_batch(&self, batch: &BatchWrite<'_>) -> Result<usize> {
        let table = batch.rows.table();

        let written = self
            .transaction(|conn| {
                let now = canonical_ts(Utc::now());
                runs::claim_for_write(conn, batch.run, now)?;
                let written = match batch.rows {
                    BatchRows::Inventory(rows) => insert_chunks(
                        conn,
                        rows,
                        batch.chunk_size,
                        batch.cancel,
                        inventory::insert,
                    )?,
                    BatchRows::Usage(rows) => {
                        let written = insert_chunks(
                            conn,
                            rows,
                            batch.chunk_size,
                            batch.cancel,
                            usage::insert,
                        )?;
                        usage::attribute(conn, batch.run, batch.source_name, rows)?;
                        written
                    }
                };
                runs::record_batch(conn, batch, written, now)?;
                Ok(written)
            })
            .map_err(|e| match e {
                Error::SinkWrite { .. } | Error::RunNotActive { .. } | Error::Cancelled => e,
                other => Error::sink_write(table.name(), other.to_string()),
            })?;

        debug!(
            table = %table,
            source = batch.source_name,
            rows = written,
            "Committed batch"
        );
        Ok(written)
    }

    fn query_latest_run(&self, pipeline_name: &str) -> Result<Option<RunEntry>> {
        let conn = self.connection()?;
        runs::latest(&conn, pipeline_name, None)
    }

    fn query_latest_successful_run(&self, pipeline_name: &str) -> Result<Option<RunEntry>> {
        let conn = self.connection()?;
        runs::latest(&conn, pipeline_name, Some(RunStatus::Succeeded))
    }

    fn active_runs(&self, pipeline_name: &str) -> Result<Vec<RunEntry>> {
        let conn = self.connection()?;
        runs::active(&conn, pipeline_name)
    }

    fn prior_usage_counters(
        &self,
        pipeline_name: &str,
        source_name: &str,
        handles: &[&str],
        before: DateTime<Utc>,
    ) -> Result<HashMap<String, UsageCounters>> {
        let conn = self.connection()?;
        usage::prior_counters(&conn, pipeline_name, source_name, handles, before)
    }

    fn latest_source_load(
        &self,
        pipeline_name: &str,
        source_name: &str,
        table: Table,
    ) -> Result<Option<DateTime<Utc>>> {
        let conn = self.connection()?;
        runs::latest_source_load(&conn, pipeline_name, source_name, table)
    }

    fn open_run(&self, request: &RunRequest) -> Result<OpenedRun> {
        self.transaction(|conn| runs::open(conn, request))
    }

    fn transition_run(
        &self,
        run: &PipelineRun,
        from: RunStatus,
        to: RunStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.transaction(|conn| runs::transition(conn, run, from, to, error, at))
    }

    fn heartbeat(&self, run: &PipelineRun, at: DateTime<Utc>) -> Result<()> {
        let conn = self.connection()?;
        runs::heartbeat(&conn, run, at)
    }

    fn fail_stale_runs(
        &self,
        pipeline_name: &str,
        stale_before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<Vec<RunEntry>> {
        self.transaction(|conn| runs::fail_stale(conn, pipeline_name, stale_before, at))
    }
}
