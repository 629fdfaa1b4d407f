//! Persistence sink - the transactional tabular store behind the pipeline.
//!
//! The pipeline issues logical operations only. `Store` implements this
//! trait over DuckDB; tests may substitute their own.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::schema::{
    InventoryRecord, PipelineRun, RunEntry, RunStatus, Table, UsageCounters, UsageRecord,
};
use crate::retry::CancellationToken;
use crate::Result;

/// Borrowed rows of a single table.
#[derive(Debug, Clone, Copy)]
pub enum BatchRows<'a> {
    Inventory(&'a [InventoryRecord]),
    Usage(&'a [UsageRecord]),
}

impl BatchRows<'_> {
    pub fn table(&self) -> Table {
        match self {
            BatchRows::Inventory(_) => Table::Inventory,
            BatchRows::Usage(_) => Table::Usage,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            BatchRows::Inventory(rows) => rows.len(),
            BatchRows::Usage(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One table batch of a source, written in a single transaction together
/// with its load audit row.
///
/// `chunk_size` bounds the rows sent per insert pass. Cancellation is
/// checked between passes; a cancelled or failed batch rolls back whole.
#[derive(Debug, Clone, Copy)]
pub struct BatchWrite<'a> {
    pub run: &'a PipelineRun,
    pub source_name: &'a str,
    pub rows: BatchRows<'a>,
    pub chunk_size: usize,
    pub cancel: &'a CancellationToken,
    pub rows_rejected: usize,
    pub duplicates_skipped: usize,
    pub counter_regressions: usize,
}

/// Everything needed to open a run atomically.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub pipeline_name: String,
    pub version: String,
    pub runner: String,

    /// Intended execution date. Moved forward if not after the latest one.
    pub now: DateTime<Utc>,

    /// Non-terminal runs whose heartbeat is older than this are stale.
    pub stale_before: DateTime<Utc>,
}

/// Result of opening a run.
#[derive(Debug, Clone)]
pub struct OpenedRun {
    /// The new PENDING run.
    pub entry: RunEntry,

    /// Orphaned runs that were marked FAILED first.
    pub swept: Vec<RunEntry>,
}

pub trait Sink: Send + Sync {
    /// Insert a table batch all-or-nothing, including a batch with no rows,
    /// which records only its audit row. Returns the number of rows written.
    ///
    /// The batch refreshes the run's heartbeat in the same transaction and
    /// fails with `RunNotActive` unless the run is still RUNNING.
    fn insert_batch(&self, batch: &BatchWrite<'_>) -> Result<usize>;

    /// Most recently started run of a pipeline, whatever its status.
    fn query_latest_run(&self, pipeline_name: &str) -> Result<Option<RunEntry>>;

    /// Most recently started SUCCEEDED run of a pipeline.
    fn query_latest_successful_run(&self, pipeline_name: &str) -> Result<Option<RunEntry>>;

    /// Non-terminal runs of a pipeline.
    fn active_runs(&self, pipeline_name: &str) -> Result<Vec<RunEntry>>;

    /// Latest counters per handle from snapshots strictly before `before`,
    /// taken only from SUCCEEDED runs of `pipeline_name` in which
    /// `source_name` itself reported the handle. Handles with no such snapshot are absent
    /// from the map.
    fn prior_usage_counters(
        &self,
        pipeline_name: &str,
        source_name: &str,
        handles: &[&str],
        before: DateTime<Utc>,
    ) -> Result<HashMap<String, UsageCounters>>;

    /// execution_date of the latest SUCCEEDED run of `pipeline_name` that
    /// committed a `table` batch for `source_name`.
    fn latest_source_load(
        &self,
        pipeline_name: &str,
        source_name: &str,
        table: Table,
    ) -> Result<Option<DateTime<Utc>>>;

    /// Sweep stale runs, refuse if a run is still active, then record a new
    /// PENDING run. All in one transaction.
    fn open_run(&self, request: &RunRequest) -> Result<OpenedRun>;

    /// Move a run from `from` to `to`. Fails if the run is not in `from`.
    fn transition_run(
        &self,
        run: &PipelineRun,
        from: RunStatus,
        to: RunStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Refresh the heartbeat of a non-terminal run.
    fn heartbeat(&self, run: &PipelineRun, at: DateTime<Utc>) -> Result<()>;

    /// Mark non-terminal runs with a heartbeat before `stale_before` as FAILED.
    fn fail_stale_runs(
        &self,
        pipeline_name: &str,
        stale_before: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> Result<Vec<RunEntry>>;
}
