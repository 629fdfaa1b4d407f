//! Run ledger storage: the `metadata` row of each run, its lifecycle state in
//! `run_ledger`, and the per-batch audit in `load_batches`.

use chrono::{DateTime, TimeDelta, Utc};
use duckdb::{params, Connection};
use serde::Serialize;
use tracing::warn;

use crate::schema::{
    canonical_ts, from_epoch_us, sql_timestamp, PipelineRun, RunEntry, RunStatus, Table,
};
use crate::sink::{BatchWrite, OpenedRun, RunRequest};
use crate::{Error, Result};

const RUN_SELECT: &str = r#"
    SELECT l.pipeline_name, epoch_us(l.execution_date), m.version, l.status, l.runner,
           epoch_us(l.heartbeat_at), epoch_us(l.finished_at), l.error
    FROM run_ledger l
    JOIN metadata m
      ON m.pipeline_name = l.pipeline_name AND m.execution_date = l.execution_date
"#;

/// A ledger row as read, before status parsing.
struct RunRow {
    pipeline_name: String,
    execution_us: i64,
    version: Option<String>,
    status: String,
    runner: String,
    heartbeat_us: i64,
    finished_us: Option<i64>,
    error: Option<String>,
}

impl RunRow {
    fn from_row(row: &duckdb::Row<'_>) -> duckdb::Result<Self> {
        Ok(Self {
            pipeline_name: row.get(0)?,
            execution_us: row.get(1)?,
            version: row.get(2)?,
            status: row.get(3)?,
            runner: row.get(4)?,
            heartbeat_us: row.get(5)?,
            finished_us: row.get(6)?,
            error: row.get(7)?,
        })
    }

    fn into_entry(self) -> Result<RunEntry> {
        Ok(RunEntry {
            run: PipelineRun {
                pipeline_name: self.pipeline_name,
                execution_date: from_epoch_us(self.execution_us)?,
                version: self.version.unwrap_or_default(),
            },
            status: self.status.parse()?,
            runner: self.runner,
            heartbeat_at: from_epoch_us(self.heartbeat_us)?,
            finished_at: self.finished_us.map(from_epoch_us).transpose()?,
            error: self.error,
        })
    }
}

fn select_runs(
    conn: &Connection,
    filter: &str,
    params: &[&dyn duckdb::ToSql],
) -> Result<Vec<RunEntry>> {
    let sql = format!("{} {}", RUN_SELECT, filter);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params, RunRow::from_row)?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?.into_entry()?);
    }
    Ok(entries)
}

pub(super) fn list(conn: &Connection, pipeline_name: Option<&str>) -> Result<Vec<RunEntry>> {
    match pipeline_name {
        Some(name) => select_runs(
            conn,
            "WHERE l.pipeline_name = ? ORDER BY l.execution_date",
            &[&name],
        ),
        None => select_runs(conn, "ORDER BY l.execution_date", &[]),
    }
}

pub(super) fn get(
    conn: &Connection,
    pipeline_name: &str,
    execution_date: DateTime<Utc>,
) -> Result<Option<RunEntry>> {
    let mut entries = select_runs(
        conn,
        "WHERE l.pipeline_name = ? AND l.execution_date = CAST(? AS TIMESTAMP)",
        &[&pipeline_name, &sql_timestamp(&execution_date)],
    )?;
    Ok(entries.pop())
}

pub(super) fn latest(
    conn: &Connection,
    pipeline_name: &str,
    status: Option<RunStatus>,
) -> Result<Option<RunEntry>> {
    let mut entries = match status {
        Some(status) => select_runs(
            conn,
            "WHERE l.pipeline_name = ? AND l.status = ? ORDER BY l.execution_date DESC LIMIT 1",
            &[&pipeline_name, &status.as_str()],
        )?,
        None => select_runs(
            conn,
            "WHERE l.pipeline_name = ? ORDER BY l.execution_date DESC LIMIT 1",
            &[&pipeline_name],
        )?,
    };
    Ok(entries.pop())
}

pub(super) fn active(conn: &Connection, pipeline_name: &str) -> Result<Vec<RunEntry>> {
    select_runs(
        conn,
        "WHERE l.pipeline_name = ? AND l.status IN ('PENDING', 'RUNNING') \
         ORDER BY l.execution_date",
        &[&pipeline_name],
    )
}

/// Mark stale non-terminal runs FAILED. Runs inside the caller's transaction.
pub(super) fn fail_stale(
    conn: &Connection,
    pipeline_name: &str,
    stale_before: DateTime<Utc>,
    at: DateTime<Utc>,
) -> Result<Vec<RunEntry>> {
    let stale: Vec<RunEntry> = active(conn, pipeline_name)?
        .into_iter()
        .filter(|entry| entry.heartbeat_at < stale_before)
        .collect();

    let mut swept = Vec::with_capacity(stale.len());
    for mut entry in stale {
        let message = format!(
            "stale run: no heartbeat from {} since {}",
            entry.runner,
            entry.heartbeat_at.to_rfc3339()
        );
        conn.execute(
            "UPDATE run_ledger SET status = 'FAILED', finished_at = ?, error = ? \
             WHERE pipeline_name = ? AND execution_date = CAST(? AS TIMESTAMP) AND status = ?",
            params![
                sql_timestamp(&at),
                message,
                entry.run.pipeline_name,
                sql_timestamp(&entry.run.execution_date),
                entry.status.as_str(),
            ],
        )?;
        warn!(
            pipeline = %entry.run.pipeline_name,
            execution_date = %entry.run.execution_date,
            was = %entry.status,
            "{}",
            Error::StaleRun {
                pipeline_name: entry.run.pipeline_name.clone(),
                execution_date: entry.run.execution_date,
            }
        );

        entry.status = RunStatus::Failed;
        entry.finished_at = Some(at);
        entry.error = Some(message);
        swept.push(entry);
    }
    Ok(swept)
}

/// Latest execution_date across every pipeline in the store.
fn latest_execution_date(conn: &Connection) -> Result<Option<DateTime<Utc>>> {
    let micros: Option<i64> = conn.query_row(
        "SELECT max(epoch_us(execution_date)) FROM metadata",
        [],
        |row| row.get(0),
    )?;
    micros.map(from_epoch_us).transpose()
}

/// Sweep, refuse, then insert. Runs inside the caller's transaction.
pub(super) fn open(conn: &Connection, request: &RunRequest) -> Result<OpenedRun> {
    let swept = fail_stale(
        conn,
        &request.pipeline_name,
        request.stale_before,
        canonical_ts(request.now),
    )?;

    if let Some(blocking) = active(conn, &request.pipeline_name)?.into_iter().next() {
        return Err(Error::RunInProgress {
            pipeline_name: blocking.run.pipeline_name,
            execution_date: blocking.run.execution_date,
        });
    }

    let mut execution_date = canonical_ts(request.now);
    if let Some(latest) = latest_execution_date(conn)? {
        if execution_date <= latest {
            execution_date = latest + TimeDelta::microseconds(1);
        }
    }

    let run = PipelineRun::new(
        request.pipeline_name.clone(),
        execution_date,
        request.version.clone(),
    );
    conn.execute(
        "INSERT INTO metadata (pipeline_name, execution_date, version) VALUES (?, ?, ?)",
        params![run.pipeline_name, sql_timestamp(&run.execution_date), run.version],
    )?;
    conn.execute(
        "INSERT INTO run_ledger (pipeline_name, execution_date, status, runner, heartbeat_at) \
         VALUES (?, ?, ?, ?, ?)",
        params![
            run.pipeline_name,
            sql_timestamp(&run.execution_date),
            RunStatus::Pending.as_str(),
            request.runner,
            sql_timestamp(&run.execution_date),
        ],
    )?;

    Ok(OpenedRun {
        entry: RunEntry {
            heartbeat_at: run.execution_date,
            run,
            status: RunStatus::Pending,
            runner: request.runner.clone(),
            finished_at: None,
            error: None,
        },
        swept,
    })
}

/// Compare-and-set on status. Runs inside the caller's transaction.
pub(super) fn transition(
    conn: &Connection,
    run: &PipelineRun,
    from: RunStatus,
    to: RunStatus,
    error: Option<&str>,
    at: DateTime<Utc>,
) -> Result<()> {
    if !from.can_transition_to(to) {
        return Err(Error::InvalidTransition { from, to });
    }

    let finished_at = to.is_terminal().then(|| sql_timestamp(&at));
    let changed = conn.execute(
        "UPDATE run_ledger SET status = ?, heartbeat_at = ?, finished_at = ?, error = ? \
         WHERE pipeline_name = ? AND execution_date = CAST(? AS TIMESTAMP) AND status = ?",
        params![
            to.as_str(),
            sql_timestamp(&at),
            finished_at,
            error,
            run.pipeline_name,
            sql_timestamp(&run.execution_date),
            from.as_str(),
        ],
    )?;

    if changed == 0 {
        return match get(conn, &run.pipeline_name, run.execution_date)? {
            Some(current) => Err(Error::InvalidTransition {
                from: current.status,
                to,
            }),
            None => Err(Error::NotFound(format!(
                "run {} at {}",
                run.pipeline_name, run.execution_date
            ))),
        };
    }
    Ok(())
}

pub(super) fn heartbeat(conn: &Connection, run: &PipelineRun, at: DateTime<Utc>) -> Result<()> {
    let changed = conn.execute(
        "UPDATE run_ledger SET heartbeat_at = ? \
         WHERE pipeline_name = ? AND execution_date = CAST(? AS TIMESTAMP) \
         AND status IN ('PENDING', 'RUNNING')",
        params![
            sql_timestamp(&at),
            run.pipeline_name,
            sql_timestamp(&run.execution_date),
        ],
    )?;
    if changed == 0 {
        return Err(Error::run_not_active(run));
    }
    Ok(())
}

/// Refresh the heartbeat of a RUNNING run as the first statement of a batch
/// transaction. A run that is no longer RUNNING, e.g. swept as stale by
/// another invocation, fails the batch before any row is written.
pub(super) fn claim_for_write(
    conn: &Connection,
    run: &PipelineRun,
    at: DateTime<Utc>,
) -> Result<()> {
    let changed = conn.execute(
        "UPDATE run_ledger SET heartbeat_at = ? \
         WHERE pipeline_name = ? AND execution_date = CAST(? AS TIMESTAMP) \
         AND status = 'RUNNING'",
        params![
            sql_timestamp(&at),
            run.pipeline_name,
            sql_timestamp(&run.execution_date),
        ],
    )?;
    if changed == 0 {
        return Err(Error::run_not_active(run));
    }
    Ok(())
}

/// Audit row for a committed table batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoadAudit {
    pub source_name: String,
    pub table_name: String,
    pub rows_written: i64,
    pub rows_rejected: i64,
    pub duplicates_skipped: i64,
    pub counter_regressions: i64,
    pub committed_at: DateTime<Utc>,
}

/// Runs inside the batch's transaction.
pub(super) fn record_batch(
    conn: &Connection,
    batch: &BatchWrite<'_>,
    rows_written: usize,
    committed_at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO load_batches (pipeline_name, execution_date, source_name, table_name, \
         rows_written, rows_rejected, duplicates_skipped, counter_regressions, committed_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            batch.run.pipeline_name,
            sql_timestamp(&batch.run.execution_date),
            batch.source_name,
            batch.rows.table().name(),
            rows_written as i64,
            batch.rows_rejected as i64,
            batch.duplicates_skipped as i64,
            batch.counter_regressions as i64,
            sql_timestamp(&committed_at),
        ],
    )?;
    Ok(())
}

/// Latest SUCCEEDED run of a pipeline that committed a `table` batch for
/// `source_name`.
pub(super) fn latest_source_load(
    conn: &Connection,
    pipeline_name: &str,
    source_name: &str,
    table: Table,
) -> Result<Option<DateTime<Utc>>> {
    let micros: Option<i64> = conn.query_row(
        "SELECT max(epoch_us(b.execution_date)) FROM load_batches b \
         JOIN run_ledger l \
           ON l.pipeline_name = b.pipeline_name AND l.execution_date = b.execution_date \
         WHERE b.pipeline_name = ? AND b.source_name = ? AND b.table_name = ? \
           AND l.status = 'SUCCEEDED'",
        params![pipeline_name, source_name, table.name()],
        |row| row.get(0),
    )?;
    micros.map(from_epoch_us).transpose()
}

pub(super) fn load_audit(conn: &Connection, run: &PipelineRun) -> Result<Vec<LoadAudit>> {
    let mut stmt = conn.prepare(
        "SELECT source_name, table_name, rows_written, rows_rejected, duplicates_skipped, \
         counter_regressions, epoch_us(committed_at) \
         FROM load_batches \
         WHERE pipeline_name = ? AND execution_date = CAST(? AS TIMESTAMP) \
         ORDER BY committed_at, source_name, table_name",
    )?;
    let rows = stmt.query_map(
        params![run.pipeline_name, sql_timestamp(&run.execution_date)],
        |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
            ))
        },
    )?;

    let mut audit = Vec::new();
    for row in rows {
        let (source_name, table_name, written, rejected, duplicates, regressions, committed_us) =
            row?;
        audit.push(LoadAudit {
            source_name,
            table_name,
            rows_written: written,
            rows_rejected: rejected,
            duplicates_skipped: duplicates,
            counter_regressions: regressions,
            committed_at: from_epoch_us(committed_us)?,
        });
    }
    Ok(audit)
}
