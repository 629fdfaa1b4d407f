//! Run ledger - brackets each pipeline run with persisted lifecycle state.
//!
//! ```text
//! PENDING -> RUNNING -> SUCCEEDED
//!    |          |
//!    +----------+-----> FAILED
//! ```
//!
//! State lives in the sink, not in the process, so a crashed run is found by
//! the next invocation through its stale heartbeat.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{error, info};

use crate::schema::{canonical_ts, PipelineRun, RunEntry, RunStatus, Table};
use crate::sink::{OpenedRun, RunRequest, Sink};
use crate::Result;

/// Identity of this process as recorded on its runs.
pub fn runner_id() -> String {
    let host = gethostname::gethostname()
        .to_str()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{}:{}", host, std::process::id())
}

fn now() -> DateTime<Utc> {
    canonical_ts(Utc::now())
}

pub struct RunLedger<'a> {
    sink: &'a dyn Sink,
    pipeline_name: String,
    version: String,
    run_timeout: Duration,
    runner: String,
}

impl<'a> RunLedger<'a> {
    pub fn new(
        sink: &'a dyn Sink,
        pipeline_name: impl Into<String>,
        version: impl Into<String>,
        run_timeout: Duration,
    ) -> Self {
        Self {
            sink,
            pipeline_name: pipeline_name.into(),
            version: version.into(),
            run_timeout,
            runner: runner_id(),
        }
    }

    /// Override the recorded runner identity.
    pub fn with_runner(mut self, runner: impl Into<String>) -> Self {
        self.runner = runner.into();
        self
    }

    pub fn pipeline_name(&self) -> &str {
        &self.pipeline_name
    }

    fn stale_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let timeout = TimeDelta::from_std(self.run_timeout).unwrap_or(TimeDelta::MAX);
        now.checked_sub_signed(timeout)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Recover stale runs and record a new PENDING run.
    ///
    /// Fails with `RunInProgress` when another live run of the same pipeline
    /// exists.
    pub fn open(&self) -> Result<OpenedRun> {
        let now = now();
        let opened = self.sink.open_run(&RunRequest {
            pipeline_name: self.pipeline_name.clone(),
            version: self.version.clone(),
            runner: self.runner.clone(),
            now,
            stale_before: self.stale_before(now),
        })?;

        info!(
            pipeline = %self.pipeline_name,
            execution_date = %opened.entry.run.execution_date,
            version = %self.version,
            recovered = opened.swept.len(),
            "Opened run"
        );
        Ok(opened)
    }

    /// PENDING -> RUNNING.
    pub fn start(&self, run: &PipelineRun) -> Result<()> {
        self.sink
            .transition_run(run, RunStatus::Pending, RunStatus::Running, None, now())?;
        info!(pipeline = %run.pipeline_name, execution_date = %run.execution_date, "Run started");
        Ok(())
    }

    /// RUNNING -> SUCCEEDED.
    pub fn succeed(&self, run: &PipelineRun) -> Result<()> {
        self.sink
            .transition_run(run, RunStatus::Running, RunStatus::Succeeded, None, now())?;
        info!(pipeline = %run.pipeline_name, execution_date = %run.execution_date, "Run succeeded");
        Ok(())
    }

    /// `from` -> FAILED, recording the reason.
    pub fn fail(&self, run: &PipelineRun, from: RunStatus, reason: &str) -> Result<()> {
        self.sink
            .transition_run(run, from, RunStatus::Failed, Some(reason), now())?;
        error!(
            pipeline = %run.pipeline_name,
            execution_date = %run.execution_date,
            "Run failed: {}",
            reason
        );
        Ok(())
    }

    pub fn heartbeat(&self, run: &PipelineRun) -> Result<()> {
        self.sink.heartbeat(run, now())
    }

    /// Mark this pipeline's runs without a recent heartbeat as FAILED.
    pub fn sweep_stale(&self) -> Result<Vec<RunEntry>> {
        let now = now();
        let swept = self
            .sink
            .fail_stale_runs(&self.pipeline_name, self.stale_before(now), now)?;
        if swept.is_empty() {
            info!(pipeline = %self.pipeline_name, "No stale runs");
        }
        Ok(swept)
    }

    /// Lower bound for incremental extraction of one source: the
    /// execution_date of the last successful run that loaded its usage.
    /// A source new to the pipeline has none and gets a full snapshot.
    pub fn watermark(&self, source_name: &str) -> Result<Option<DateTime<Utc>>> {
        self.sink
            .latest_source_load(&self.pipeline_name, source_name, Table::Usage)
    }
}
