//! Incremental loader - screens normalized records and appends each table
//! batch to the sink in one transaction.
//!
//! Inventory and usage are append-only: every snapshot becomes new rows and
//! nothing stored is ever updated. Usage counters are stored verbatim; a
//! decrease against the previous snapshot is reported, not corrected.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::normalize::NormalizedBatch;
use crate::retry::{ensure_active, CancellationToken};
use crate::schema::{
    InventoryRecord, PipelineRun, Table, TableRows, UsageCounters, UsageRecord,
};
use crate::sink::{BatchRows, BatchWrite, Sink};
use crate::Result;

/// Counts produced by loading one or more batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub rows_written: usize,
    pub rows_rejected: usize,
    pub duplicates_skipped: usize,
    pub counter_regressions: usize,
}

impl LoadReport {
    pub fn merge(&mut self, other: &LoadReport) {
        self.rows_written += other.rows_written;
        self.rows_rejected += other.rows_rejected;
        self.duplicates_skipped += other.duplicates_skipped;
        self.counter_regressions += other.counter_regressions;
    }
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} written, {} rejected, {} duplicates skipped, {} counter regressions",
            self.rows_written, self.rows_rejected, self.duplicates_skipped, self.counter_regressions
        )
    }
}

/// A usage counter went down between two snapshots of the same handle.
///
/// Not an error: the source evicted the plan and restarted its counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterRegression {
    pub sql_handle: String,
    pub fields: Vec<&'static str>,
    pub prior: UsageCounters,
    pub current: UsageCounters,
}

impl fmt::Display for CounterRegression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "counters of {} decreased ({}): execution_count {} -> {}",
            self.sql_handle,
            self.fields.join(", "),
            self.prior.execution_count,
            self.current.execution_count
        )
    }
}

/// Records that passed screening.
struct Screened<T> {
    rows: Vec<T>,
    mismatched: usize,
    duplicates: usize,
}

/// Drop records that belong to another run, then keep the first occurrence
/// of each natural key.
fn screen<T, K>(
    records: &[T],
    run: &PipelineRun,
    table: Table,
    extract_ts: impl Fn(&T) -> DateTime<Utc>,
    key: impl Fn(&T) -> K,
) -> Screened<T>
where
    T: Clone,
    K: Hash + Eq,
{
    let mut seen = HashSet::with_capacity(records.len());
    let mut screened = Screened {
        rows: Vec::with_capacity(records.len()),
        mismatched: 0,
        duplicates: 0,
    };

    for record in records {
        if extract_ts(record) != run.execution_date {
            screened.mismatched += 1;
            continue;
        }
        if !seen.insert(key(record)) {
            screened.duplicates += 1;
            continue;
        }
        screened.rows.push(record.clone());
    }

    if screened.mismatched > 0 {
        warn!(
            table = %table,
            count = screened.mismatched,
            execution_date = %run.execution_date,
            "Rejected records whose extract_ts does not match the run"
        );
    }
    if screened.duplicates > 0 {
        warn!(
            table = %table,
            count = screened.duplicates,
            "Skipped duplicate natural keys"
        );
    }
    screened
}

/// Writes normalized batches for one run.
pub struct Loader<'a> {
    sink: &'a dyn Sink,
    batch_size: usize,
    cancel: &'a CancellationToken,
}

impl<'a> Loader<'a> {
    pub fn new(sink: &'a dyn Sink, batch_size: usize, cancel: &'a CancellationToken) -> Self {
        Self {
            sink,
            batch_size: batch_size.max(1),
            cancel,
        }
    }

    /// Load one normalized batch extracted from `source_name`.
    ///
    /// The batch commits as a whole or not at all. `batch_size` only bounds
    /// the rows per insert pass inside that transaction; an error or a
    /// cancellation in any pass leaves none of the batch behind.
    pub fn load(
        &self,
        source_name: &str,
        batch: &NormalizedBatch,
        run: &PipelineRun,
    ) -> Result<LoadReport> {
        ensure_active(self.cancel)?;
        match &batch.rows {
            TableRows::Inventory(records) => {
                self.load_inventory(source_name, records, batch.rejected, run)
            }
            TableRows::Usage(records) => self.load_usage(source_name, records, batch.rejected, run),
        }
    }

    fn load_inventory(
        &self,
        source_name: &str,
        records: &[InventoryRecord],
        rejected: usize,
        run: &PipelineRun,
    ) -> Result<LoadReport> {
        let screened = screen(
            records,
            run,
            Table::Inventory,
            |r| r.extract_ts,
            |r| r.natural_key(),
        );
        let report = LoadReport {
            rows_rejected: rejected + screened.mismatched,
            duplicates_skipped: screened.duplicates,
            ..LoadReport::default()
        };

        self.write(source_name, run, BatchRows::Inventory(&screened.rows), report)
    }

    fn load_usage(
        &self,
        source_name: &str,
        records: &[UsageRecord],
        rejected: usize,
        run: &PipelineRun,
    ) -> Result<LoadReport> {
        let screened = screen(
            records,
            run,
            Table::Usage,
            |r| r.extract_ts,
            |r| r.sql_handle.clone(),
        );

        let regressions = self.detect_regressions(source_name, &screened.rows, run)?;
        for regression in &regressions {
            warn!(
                source = source_name,
                sql_handle = %regression.sql_handle,
                "Counter regression, treating as plan-cache eviction: {}",
                regression
            );
        }

        let report = LoadReport {
            rows_rejected: rejected + screened.mismatched,
            duplicates_skipped: screened.duplicates,
            counter_regressions: regressions.len(),
            ..LoadReport::default()
        };

        self.write(source_name, run, BatchRows::Usage(&screened.rows), report)
    }

    /// Compare each record with its handle's latest earlier snapshot from
    /// the same source.
    fn detect_regressions(
        &self,
        source_name: &str,
        rows: &[UsageRecord],
        run: &PipelineRun,
    ) -> Result<Vec<CounterRegression>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let handles: Vec<&str> = rows.iter().map(|r| r.sql_handle.as_str()).collect();
        let prior = self.sink.prior_usage_counters(
            &run.pipeline_name,
            source_name,
            &handles,
            run.execution_date,
        )?;

        Ok(rows
            .iter()
            .filter_map(|record| {
                let prior = prior.get(&record.sql_handle)?;
                let current = record.counters();
                let fields = current.regressed_from(prior);
                (!fields.is_empty()).then(|| CounterRegression {
                    sql_handle: record.sql_handle.clone(),
                    fields,
                    prior: *prior,
                    current,
                })
            })
            .collect())
    }

    /// Write the screened rows and their audit row in one sink transaction,
    /// which also refreshes the run's heartbeat. A batch left empty by
    /// screening still records its counts.
    fn write(
        &self,
        source_name: &str,
        run: &PipelineRun,
        rows: BatchRows<'_>,
        mut report: LoadReport,
    ) -> Result<LoadReport> {
        let table = rows.table();
        if rows.is_empty() {
            warn!(source = source_name, table = %table, "No rows to load");
        }

        ensure_active(self.cancel)?;
        report.rows_written = self.sink.insert_batch(&BatchWrite {
            run,
            source_name,
            rows,
            chunk_size: self.batch_size,
            cancel: self.cancel,
            rows_rejected: report.rows_rejected,
            duplicates_skipped: report.duplicates_skipped,
            counter_regressions: report.counter_regressions,
        })?;

        debug!(
            source = source_name,
            table = %table,
            rows = report.rows_written,
            "Batch committed"
        );
        Ok(report)
    }
}
