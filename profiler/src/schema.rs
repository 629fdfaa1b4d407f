//! Schema definitions for the inventory, usage and metadata tables.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// The tables the pipeline writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Inventory,
    Usage,
    Metadata,
}

impl Table {
    pub fn name(&self) -> &'static str {
        match self {
            Table::Inventory => "inventory",
            Table::Usage => "usage",
            Table::Metadata => "metadata",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Text-comparison rules of a database object.
///
/// `Unknown` means the source does not expose collation at all, which is
/// different from a source reporting an empty collation name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Collation {
    Known(String),
    Unknown,
}

impl Collation {
    /// Value as persisted: `Unknown` becomes NULL.
    pub fn as_option(&self) -> Option<&str> {
        match self {
            Collation::Known(name) => Some(name.as_str()),
            Collation::Unknown => None,
        }
    }

    pub fn from_option(value: Option<String>) -> Self {
        match value {
            Some(name) => Collation::Known(name),
            None => Collation::Unknown,
        }
    }
}

/// One database object observed at extraction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryRecord {
    /// Identifier, unique within one source instance only.
    pub db_id: i32,

    /// Display name of the database.
    pub name: String,

    pub collation_name: Collation,

    /// Creation time at the source.
    pub create_date: DateTime<Utc>,

    /// When the pipeline captured this record. Equals the run's execution_date.
    pub extract_ts: DateTime<Utc>,
}

impl InventoryRecord {
    pub fn natural_key(&self) -> (i32, DateTime<Utc>) {
        (self.db_id, self.extract_ts)
    }
}

/// Cumulative statement counters, monotonic between plan-cache evictions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsageCounters {
    pub execution_count: i64,
    pub total_worker_time: i64,
    pub total_elapsed_time: i64,
    pub total_rows: i64,
}

impl UsageCounters {
    /// Names of the counters that are lower than in `prior`.
    pub fn regressed_from(&self, prior: &UsageCounters) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.execution_count < prior.execution_count {
            fields.push("execution_count");
        }
        if self.total_worker_time < prior.total_worker_time {
            fields.push("total_worker_time");
        }
        if self.total_elapsed_time < prior.total_elapsed_time {
            fields.push("total_elapsed_time");
        }
        if self.total_rows < prior.total_rows {
            fields.push("total_rows");
        }
        fields
    }
}

/// One statement signature observed at one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Source-defined identifier of the compiled statement.
    pub sql_handle: String,

    /// When the plan was first compiled.
    pub creation_time: DateTime<Utc>,

    /// Most recent execution as of the extraction.
    pub last_execution_time: DateTime<Utc>,

    pub execution_count: i64,

    /// Cumulative CPU time in microseconds.
    pub total_worker_time: i64,

    /// Cumulative wall-clock time in microseconds.
    pub total_elapsed_time: i64,

    pub total_rows: i64,

    /// Snapshot time. Equals the run's execution_date.
    pub extract_ts: DateTime<Utc>,
}

impl UsageRecord {
    pub fn natural_key(&self) -> (&str, DateTime<Utc>) {
        (&self.sql_handle, self.extract_ts)
    }

    pub fn counters(&self) -> UsageCounters {
        UsageCounters {
            execution_count: self.execution_count,
            total_worker_time: self.total_worker_time,
            total_elapsed_time: self.total_elapsed_time,
            total_rows: self.total_rows,
        }
    }
}

/// A normalized record of either table.
#[derive(Debug, Clone, PartialEq)]
pub enum CanonicalRecord {
    Inventory(InventoryRecord),
    Usage(UsageRecord),
}

impl CanonicalRecord {
    pub fn table(&self) -> Table {
        match self {
            CanonicalRecord::Inventory(_) => Table::Inventory,
            CanonicalRecord::Usage(_) => Table::Usage,
        }
    }

    pub fn extract_ts(&self) -> DateTime<Utc> {
        match self {
            CanonicalRecord::Inventory(r) => r.extract_ts,
            CanonicalRecord::Usage(r) => r.extract_ts,
        }
    }
}

/// Records of a single target table, written together.
#[derive(Debug, Clone, PartialEq)]
pub enum TableRows {
    Inventory(Vec<InventoryRecord>),
    Usage(Vec<UsageRecord>),
}

impl TableRows {
    pub fn table(&self) -> Table {
        match self {
            TableRows::Inventory(_) => Table::Inventory,
            TableRows::Usage(_) => Table::Usage,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TableRows::Inventory(rows) => rows.len(),
            TableRows::Usage(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One pipeline execution, as stored in the `metadata` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub pipeline_name: String,

    /// Start of the run. Unique across the store.
    pub execution_date: DateTime<Utc>,

    /// Version of the pipeline logic that produced this run's records.
    pub version: String,
}

impl PipelineRun {
    pub fn new(
        pipeline_name: impl Into<String>,
        execution_date: DateTime<Utc>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            execution_date: canonical_ts(execution_date),
            version: version.into(),
        }
    }
}

/// Lifecycle of a run in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Succeeded => "SUCCEEDED",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Pending, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Succeeded)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(RunStatus::Pending),
            "RUNNING" => Ok(RunStatus::Running),
            "SUCCEEDED" => Ok(RunStatus::Succeeded),
            "FAILED" => Ok(RunStatus::Failed),
            _ => Err(Error::Storage(format!("Invalid run status: {}", s))),
        }
    }
}

/// A run together with its ledger state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEntry {
    pub run: PipelineRun,
    pub status: RunStatus,

    /// Process that owns the run (hostname:pid).
    pub runner: String,

    /// Last sign of life from the owning process.
    pub heartbeat_at: DateTime<Utc>,

    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Truncate to the microsecond precision of the store's TIMESTAMP type.
pub fn canonical_ts(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.duration_trunc(TimeDelta::microseconds(1)).unwrap_or(ts)
}

/// Render a timestamp the way DuckDB parses a naive UTC TIMESTAMP.
pub fn sql_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
}

/// Inverse of `epoch_us(ts)` in SQL.
pub fn from_epoch_us(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_micros(micros)
        .ok_or_else(|| Error::Storage(format!("Timestamp out of range: {}", micros)))
}
