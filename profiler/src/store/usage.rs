//! Usage storage operations.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use duckdb::{params, Connection};

use super::Store;
use crate::schema::{from_epoch_us, sql_timestamp, PipelineRun, UsageCounters, UsageRecord};
use crate::Result;

/// Append usage rows. Runs inside the caller's transaction.
pub(super) fn insert(conn: &Connection, rows: &[UsageRecord]) -> Result<usize> {
    let mut stmt = conn.prepare(
        "INSERT INTO usage (sql_handle, creation_time, last_execution_time, execution_count, \
         total_worker_time, total_elapsed_time, total_rows, extract_ts) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )?;
    for record in rows {
        stmt.execute(params![
            record.sql_handle,
            sql_timestamp(&record.creation_time),
            sql_timestamp(&record.last_execution_time),
            record.execution_count,
            record.total_worker_time,
            record.total_elapsed_time,
            record.total_rows,
            sql_timestamp(&record.extract_ts),
        ])?;
    }
    Ok(rows.len())
}

/// Record which source reported each handle. Runs inside the caller's
/// transaction, next to the rows of `insert`.
pub(super) fn attribute(
    conn: &Connection,
    run: &PipelineRun,
    source_name: &str,
    rows: &[UsageRecord],
) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO usage_sources (pipeline_name, execution_date, source_name, sql_handle) \
         VALUES (?, ?, ?, ?)",
    )?;
    let execution_date = sql_timestamp(&run.execution_date);
    for record in rows {
        stmt.execute(params![
            run.pipeline_name,
            execution_date,
            source_name,
            record.sql_handle,
        ])?;
    }
    Ok(())
}

/// Counters of each handle's latest snapshot before `before`.
///
/// Only snapshots of SUCCEEDED runs of `pipeline_name` in which
/// `source_name` itself reported the handle count. A handle whose latest such
/// snapshot holds more than one row was also loaded by another source in
/// that run; its counters cannot be attributed and it is left out.
pub(super) fn prior_counters(
    conn: &Connection,
    pipeline_name: &str,
    source_name: &str,
    handles: &[&str],
    before: DateTime<Utc>,
) -> Result<HashMap<String, UsageCounters>> {
    if handles.is_empty() {
        return Ok(HashMap::new());
    }

    let sql = format!(
        r#"
        WITH reported AS (
            SELECT DISTINCT s.execution_date, s.sql_handle
            FROM usage_sources s
            JOIN run_ledger l
              ON l.pipeline_name = s.pipeline_name AND l.execution_date = s.execution_date
            WHERE s.pipeline_name = ? AND s.source_name = ?
              AND l.status = 'SUCCEEDED' AND s.execution_date < CAST(? AS TIMESTAMP)
        ),
        latest AS (
            SELECT u.sql_handle, u.execution_count, u.total_worker_time,
                   u.total_elapsed_time, u.total_rows,
                   count(*) OVER (PARTITION BY u.sql_handle, u.extract_ts) AS copies
            FROM usage u
            JOIN reported r
              ON r.execution_date = u.extract_ts AND r.sql_handle = u.sql_handle
            WHERE u.sql_handle IN ({})
            QUALIFY row_number() OVER (PARTITION BY u.sql_handle ORDER BY u.extract_ts DESC) = 1
        )
        SELECT sql_handle, execution_count, total_worker_time, total_elapsed_time, total_rows
        FROM latest
        WHERE copies = 1
        "#,
        vec!["?"; handles.len()].join(", ")
    );

    let before = sql_timestamp(&before);
    let mut params: Vec<&dyn duckdb::ToSql> = vec![&pipeline_name, &source_name, &before];
    params.extend(handles.iter().map(|handle| handle as &dyn duckdb::ToSql));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params.as_slice(), |row| {
        Ok((
            row.get::<_, String>(0)?,
            UsageCounters {
                execution_count: row.get(1)?,
                total_worker_time: row.get(2)?,
                total_elapsed_time: row.get(3)?,
                total_rows: row.get(4)?,
            },
        ))
    })?;

    let mut prior = HashMap::new();
    for row in rows {
        let (handle, counters) = row?;
        prior.insert(handle, counters);
    }
    Ok(prior)
}

/// Read usage rows, converting stored timestamps back to UTC.
fn read(
    conn: &Connection,
    sql: &str,
    params: &[&dyn duckdb::ToSql],
) -> Result<Vec<UsageRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
            UsageCounters {
                execution_count: row.get(3)?,
                total_worker_time: row.get(4)?,
                total_elapsed_time: row.get(5)?,
                total_rows: row.get(6)?,
            },
            row.get::<_, i64>(7)?,
        ))
    })?;

    let mut records = Vec::new();
    for row in rows {
        let (sql_handle, creation_us, last_us, counters, extract_us) = row?;
        records.push(UsageRecord {
            sql_handle,
            creation_time: from_epoch_us(creation_us)?,
            last_execution_time: from_epoch_us(last_us)?,
            execution_count: counters.execution_count,
            total_worker_time: counters.total_worker_time,
            total_elapsed_time: counters.total_elapsed_time,
            total_rows: counters.total_rows,
            extract_ts: from_epoch_us(extract_us)?,
        });
    }
    Ok(records)
}

const USAGE_COLUMNS: &str = "u.sql_handle, epoch_us(u.creation_time), \
     epoch_us(u.last_execution_time), u.execution_count, u.total_worker_time, \
     u.total_elapsed_time, u.total_rows, epoch_us(u.extract_ts)";

impl Store {
    /// Usage rows of one snapshot, ordered by handle.
    pub fn usage_snapshot(&self, extract_ts: DateTime<Utc>) -> Result<Vec<UsageRecord>> {
        let conn = self.connection()?;
        let sql = format!(
            "SELECT {} FROM usage u WHERE u.extract_ts = CAST(? AS TIMESTAMP) ORDER BY u.sql_handle",
            USAGE_COLUMNS
        );
        read(&conn, &sql, &[&sql_timestamp(&extract_ts)])
    }

    /// Every stored snapshot of one handle, oldest first.
    ///
    /// With `succeeded_only`, rows written by runs that did not succeed are
    /// left out.
    pub fn usage_history(&self, sql_handle: &str, succeeded_only: bool) -> Result<Vec<UsageRecord>> {
        let conn = self.connection()?;
        let sql = if succeeded_only {
            format!(
                "SELECT {} FROM usage u \
                 JOIN run_ledger l ON l.execution_date = u.extract_ts AND l.status = 'SUCCEEDED' \
                 WHERE u.sql_handle = ? ORDER BY u.extract_ts",
                USAGE_COLUMNS
            )
        } else {
            format!(
                "SELECT {} FROM usage u WHERE u.sql_handle = ? ORDER BY u.extract_ts",
                USAGE_COLUMNS
            )
        };
        read(&conn, &sql, &[&sql_handle])
    }
}
