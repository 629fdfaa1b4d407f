//! Error types for profiling pipeline operations.

use chrono::{DateTime, Utc};

use crate::normalize::Rejection;
use crate::schema::{PipelineRun, RunStatus};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Worker pool error: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// Source unreachable after exhausting retries.
    #[error("Connection to source '{source_name}' failed: {message}")]
    Connection { source_name: String, message: String },

    /// A single raw record could not be normalized.
    #[error("Malformed record: {0}")]
    MalformedRecord(Rejection),

    /// A transactional write was rolled back.
    #[error("Write to table '{table}' failed: {message}")]
    SinkWrite { table: String, message: String },

    /// An orphaned RUNNING run was found (and resolved by marking it FAILED).
    #[error("Stale run for pipeline '{pipeline_name}' started at {execution_date}")]
    StaleRun {
        pipeline_name: String,
        execution_date: DateTime<Utc>,
    },

    #[error("Pipeline '{pipeline_name}' already has an active run started at {execution_date}")]
    RunInProgress {
        pipeline_name: String,
        execution_date: DateTime<Utc>,
    },

    /// The run was finished or swept by someone else; it takes no more writes.
    #[error("Run of pipeline '{pipeline_name}' started at {execution_date} is no longer active")]
    RunNotActive {
        pipeline_name: String,
        execution_date: DateTime<Utc>,
    },

    #[error("Invalid run transition {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    pub fn run_not_active(run: &PipelineRun) -> Self {
        Error::RunNotActive {
            pipeline_name: run.pipeline_name.clone(),
            execution_date: run.execution_date,
        }
    }

    /// Create a SinkWrite error for a table.
    pub fn sink_write(table: impl Into<String>, message: impl Into<String>) -> Self {
        Error::SinkWrite {
            table: table.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
