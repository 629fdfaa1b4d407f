//! Read-time analysis over stored snapshots.
//!
//! Stored counters are cumulative and never modified. Everything here is
//! derived on read: statement lifetimes split at plan-cache evictions, and
//! per-snapshot deltas within each lifetime.

use chrono::{DateTime, Utc};
use duckdb::params;
use serde::Serialize;

use crate::schema::{UsageCounters, UsageRecord};
use crate::store::Store;
use crate::Result;

/// Activity between two consecutive snapshots of one statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsageDelta {
    pub extract_ts: DateTime<Utc>,
    pub execution_count: i64,
    pub total_worker_time: i64,
    pub total_elapsed_time: i64,
    pub total_rows: i64,
}

impl UsageDelta {
    fn between(prior: Option<&UsageCounters>, current: &UsageRecord) -> Self {
        let base = prior.copied().unwrap_or_default();
        Self {
            extract_ts: current.extract_ts,
            execution_count: current.execution_count - base.execution_count,
            total_worker_time: current.total_worker_time - base.total_worker_time,
            total_elapsed_time: current.total_elapsed_time - base.total_elapsed_time,
            total_rows: current.total_rows - base.total_rows,
        }
    }
}

/// Snapshots of one statement between two plan-cache evictions.
#[derive(Debug, Clone, PartialEq)]
pub struct StatementLifetime {
    pub sql_handle: String,
    pub snapshots: Vec<UsageRecord>,
}

impl StatementLifetime {
    pub fn first_seen(&self) -> Option<DateTime<Utc>> {
        self.snapshots.first().map(|s| s.extract_ts)
    }

    pub fn latest(&self) -> Option<&UsageRecord> {
        self.snapshots.last()
    }

    /// Deltas per snapshot. The first snapshot of a lifetime counts from zero,
    /// since its counters started when the plan was cached.
    pub fn deltas(&self) -> Vec<UsageDelta> {
        let mut prior: Option<UsageCounters> = None;
        self.snapshots
            .iter()
            .map(|snapshot| {
                let delta = UsageDelta::between(prior.as_ref(), snapshot);
                prior = Some(snapshot.counters());
                delta
            })
            .collect()
    }
}

/// Split a handle's snapshot history (oldest first) wherever any counter
/// decreases.
pub fn split_lifetimes(history: &[UsageRecord]) -> Vec<StatementLifetime> {
    let mut lifetimes: Vec<StatementLifetime> = Vec::new();

    for snapshot in history {
        let continues = lifetimes
            .last()
            .and_then(|lifetime| lifetime.latest())
            .filter(|prior| prior.sql_handle == snapshot.sql_handle)
            .map(|prior| snapshot.counters().regressed_from(&prior.counters()).is_empty())
            .unwrap_or(false);

        match lifetimes.last_mut() {
            Some(lifetime) if continues => lifetime.snapshots.push(snapshot.clone()),
            _ => lifetimes.push(StatementLifetime {
                sql_handle: snapshot.sql_handle.clone(),
                snapshots: vec![snapshot.clone()],
            }),
        }
    }
    lifetimes
}

/// Row counts of the canonical tables attributable to SUCCEEDED runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CommittedCounts {
    pub runs: i64,
    pub inventory: i64,
    pub usage: i64,
}

impl Store {
    /// Lifetimes of one statement, using snapshots from SUCCEEDED runs only.
    pub fn statement_lifetimes(&self, sql_handle: &str) -> Result<Vec<StatementLifetime>> {
        let history = self.usage_history(sql_handle, true)?;
        Ok(split_lifetimes(&history))
    }

    /// How much of a pipeline's output downstream consumers should see.
    pub fn committed_counts(&self, pipeline_name: &str) -> Result<CommittedCounts> {
        let conn = self.connection()?;
        let counts = conn.query_row(
            r#"
            WITH ok AS (
                SELECT execution_date FROM run_ledger
                WHERE pipeline_name = ? AND status = 'SUCCEEDED'
            )
            SELECT
                (SELECT COUNT(*) FROM ok),
                (SELECT COUNT(*) FROM inventory i JOIN ok ON ok.execution_date = i.extract_ts),
                (SELECT COUNT(*) FROM usage u JOIN ok ON ok.execution_date = u.extract_ts)
            "#,
            params![pipeline_name],
            |row| {
                Ok(CommittedCounts {
                    runs: row.get(0)?,
                    inventory: row.get(1)?,
                    usage: row.get(2)?,
                })
            },
        )?;
        Ok(counts)
    }
}
