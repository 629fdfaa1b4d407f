//! Pipeline orchestration: one run covering every configured source.
//!
//! Sources are extracted on a rayon pool of `max_workers` threads. Within a
//! source, inventory and usage are extracted, normalized and loaded as the
//! two halves of a `rayon::join`, so they overlap whenever the pool has a
//! free thread. Connector calls run on the blocking pool of a small tokio
//! runtime, which gives them their deadline. The first failure cancels the
//! remaining work and fails the run; table batches already committed stay in
//! place.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::Serialize;
use tracing::{error, info, info_span, warn};

use crate::config::{PipelineConfig, SourceConfig};
use crate::connector::{ConnectorError, SourceConnector};
use crate::ledger::RunLedger;
use crate::loader::{LoadReport, Loader};
use crate::normalize::{normalize_inventory, normalize_usage, NormalizeContext, RawRow};
use crate::retry::{ensure_active, CallRuntime, CancellationToken, RetryPolicy};
use crate::schema::{PipelineRun, RunEntry, RunStatus};
use crate::sink::Sink;
use crate::{Error, Result};

/// A connector call, as a plain function so it can move to the blocking pool.
type ExtractFn = fn(
    &dyn SourceConnector,
    &SourceConfig,
    Option<DateTime<Utc>>,
) -> std::result::Result<Vec<RawRow>, ConnectorError>;

/// What one source contributed to a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceReport {
    pub source_name: String,
    pub inventory: LoadReport,
    pub usage: LoadReport,
}

impl SourceReport {
    pub fn total(&self) -> LoadReport {
        let mut total = self.inventory;
        total.merge(&self.usage);
        total
    }
}

/// Result of `Pipeline::run`.
#[derive(Debug)]
pub struct RunOutcome {
    pub run: PipelineRun,
    pub status: RunStatus,

    /// Sum over every source that finished.
    pub report: LoadReport,

    /// Sources that finished, in configuration order.
    pub sources: Vec<SourceReport>,

    /// Why the run failed.
    pub error: Option<Error>,

    /// Stale runs marked FAILED before this run opened.
    pub recovered: Vec<RunEntry>,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Succeeded
    }
}

/// Keep the most informative error: anything beats `Cancelled`, and among
/// the rest the earliest source in configuration order wins.
fn keep_first(slot: &mut Option<Error>, err: Error) {
    let replace = match slot {
        None => true,
        Some(Error::Cancelled) => !matches!(err, Error::Cancelled),
        Some(_) => false,
    };
    if replace {
        *slot = Some(err);
    }
}

pub struct Pipeline {
    config: PipelineConfig,
    connector: Arc<dyn SourceConnector>,
    sink: Arc<dyn Sink>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        connector: Arc<dyn SourceConnector>,
        sink: Arc<dyn Sink>,
    ) -> Self {
        Self {
            config,
            connector,
            sink,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn ledger(&self) -> RunLedger<'_> {
        RunLedger::new(
            self.sink.as_ref(),
            self.config.pipeline_name.clone(),
            self.config.version.clone(),
            self.config.run_timeout(),
        )
    }

    /// Execute one run over every configured source.
    ///
    /// Returns `Err` only when no run could be opened (invalid config, a live
    /// run of the same pipeline, store failure). Once a run exists its fate
    /// is reported through `RunOutcome`.
    pub fn run(&self, cancel: &CancellationToken) -> Result<RunOutcome> {
        self.config.validate()?;
        let ledger = self.ledger();

        let opened = ledger.open()?;
        let run = opened.entry.run;

        if let Err(e) = ledger.start(&run) {
            if let Err(fail_err) = ledger.fail(&run, RunStatus::Pending, &e.to_string()) {
                error!("Could not mark run failed: {}", fail_err);
            }
            return Err(e);
        }

        // Tripped by the first failing job; follows external cancellation.
        let jobs_cancel = cancel.child_token();
        let (sources, mut error) = match self.run_sources(&ledger, &run, &jobs_cancel) {
            Ok(done) => done,
            Err(e) => (Vec::new(), Some(e)),
        };

        if error.is_none() && cancel.is_cancelled() {
            error = Some(Error::Cancelled);
        }

        Ok(self.finish(&ledger, run, sources, error, opened.swept))
    }

    fn finish(
        &self,
        ledger: &RunLedger<'_>,
        run: PipelineRun,
        sources: Vec<SourceReport>,
        error: Option<Error>,
        recovered: Vec<RunEntry>,
    ) -> RunOutcome {
        let mut report = LoadReport::default();
        for source in &sources {
            report.merge(&source.total());
        }

        let mut error = error;
        let status = match &error {
            None => match ledger.succeed(&run) {
                Ok(()) => RunStatus::Succeeded,
                Err(e) => {
                    error!("Could not mark run succeeded: {}", e);
                    error = Some(e);
                    RunStatus::Failed
                }
            },
            Some(_) => RunStatus::Failed,
        };

        if let Some(e) = &error {
            if let Err(fail_err) = ledger.fail(&run, RunStatus::Running, &e.to_string()) {
                error!("Could not mark run failed: {}", fail_err);
            }
        } else {
            info!(pipeline = %run.pipeline_name, "Run complete: {}", report);
        }

        RunOutcome {
            run,
            status,
            report,
            sources,
            error,
            recovered,
        }
    }

    /// Work through the sources with at most `max_workers` threads.
    fn run_sources(
        &self,
        ledger: &RunLedger<'_>,
        run: &PipelineRun,
        cancel: &CancellationToken,
    ) -> Result<(Vec<SourceReport>, Option<Error>)> {
        let sources = &self.config.sources;
        // Not capped by the source count: a spare thread lets the two halves
        // of a source overlap.
        let workers = self.config.max_workers.max(1);
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("source-worker-{}", i))
            .build()?;
        let calls = CallRuntime::new(self.config.connector_timeout())?;

        let results: Vec<Result<SourceReport>> = pool.install(|| {
            sources
                .par_iter()
                .map(|source| {
                    ensure_active(cancel)?;
                    let result = self.run_source(ledger, source, run, &calls, cancel);
                    if let Err(e) = &result {
                        if !matches!(e, Error::Cancelled) {
                            error!(source = %source.name, "Source failed: {}", e);
                        }
                        cancel.cancel();
                    }
                    result
                })
                .collect()
        });

        let mut finished = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(report) => finished.push(report),
                Err(e) => keep_first(&mut first_error, e),
            }
        }
        Ok((finished, first_error))
    }

    /// Extract, normalize and load one source. Inventory and usage run
    /// concurrently; both must finish for the source to count.
    fn run_source(
        &self,
        ledger: &RunLedger<'_>,
        source: &SourceConfig,
        run: &PipelineRun,
        calls: &CallRuntime,
        cancel: &CancellationToken,
    ) -> Result<SourceReport> {
        // Entered only around synchronous work: a guard held across
        // `rayon::join` would leak into whatever job the worker steals.
        let span = info_span!("source", pipeline = %run.pipeline_name, source = %source.name);

        let (ctx, since) = span.in_scope(|| -> Result<_> {
            let ctx = NormalizeContext::new(run.execution_date, source.offset()?);
            let since = if source.incremental {
                ledger.watermark(&source.name)?
            } else {
                None
            };
            info!(kind = %source.kind, since = ?since, "Extracting");
            Ok((ctx, since))
        })?;

        let (inventory, usage) = rayon::join(
            || {
                span.in_scope(|| {
                    let list: ExtractFn = |c, s, _| c.list_databases(s);
                    let rows = self
                        .extract(ledger, run, calls, source, "list_databases", None, cancel, list)?;
                    let batch = normalize_inventory(&rows, source.kind, &ctx);
                    self.loader(cancel).load(&source.name, &batch, run)
                })
            },
            || {
                span.in_scope(|| {
                    let list: ExtractFn = |c, s, since| c.list_query_stats(s, since);
                    let rows = self
                        .extract(ledger, run, calls, source, "list_query_stats", since, cancel, list)?;
                    let batch = normalize_usage(&rows, source.kind, &ctx);
                    self.loader(cancel).load(&source.name, &batch, run)
                })
            },
        );

        match (inventory, usage) {
            (Ok(inventory), Ok(usage)) => {
                span.in_scope(|| info!(inventory = %inventory, usage = %usage, "Source loaded"));
                Ok(SourceReport {
                    source_name: source.name.clone(),
                    inventory,
                    usage,
                })
            }
            (Err(e), Err(Error::Cancelled)) | (Err(Error::Cancelled), Err(e)) => Err(e),
            (Err(e), _) | (_, Err(e)) => Err(e),
        }
    }

    fn loader<'a>(&'a self, cancel: &'a CancellationToken) -> Loader<'a> {
        Loader::new(self.sink.as_ref(), self.config.batch_size, cancel)
    }

    /// One connector call under timeout and retry. The run's heartbeat is
    /// refreshed before every retry. A failing call cancels the sibling jobs.
    #[allow(clippy::too_many_arguments)]
    fn extract(
        &self,
        ledger: &RunLedger<'_>,
        run: &PipelineRun,
        calls: &CallRuntime,
        source: &SourceConfig,
        operation: &str,
        since: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
        call: ExtractFn,
    ) -> Result<Vec<RawRow>> {
        let policy = RetryPolicy::new(self.config.retry_limit, self.config.retry_base_delay());

        let result = policy.call_with_heartbeat(
            calls,
            &source.name,
            operation,
            cancel,
            || ledger.heartbeat(run),
            || {
                let connector = Arc::clone(&self.connector);
                let source = source.clone();
                calls.call(move || call(connector.as_ref(), &source, since))
            },
        );

        match result {
            Ok(rows) => {
                if rows.is_empty() {
                    warn!(operation, "Connector returned no rows");
                }
                Ok(rows)
            }
            Err(e) => {
                cancel.cancel();
                Err(e)
            }
        }
    }
}
