//! dbprofile: source database profiling pipeline
//!
//! Extracts catalog inventory and query-execution statistics from a fleet of
//! source databases, normalizes them into the `inventory`, `usage` and
//! `metadata` tables, and records every run in a DuckDB ledger.

pub mod config;
pub mod connector;
pub mod error;
pub mod init;
pub mod ledger;
pub mod loader;
pub mod normalize;
pub mod pipeline;
pub mod query;
pub mod retry;
pub mod schema;
pub mod sink;
pub mod store;

pub use config::{PipelineConfig, SourceConfig};
pub use connector::{ConnectorError, JsonFileConnector, SourceConnector};
pub use error::{Error, Result};
pub use ledger::RunLedger;
pub use loader::{CounterRegression, LoadReport, Loader};
pub use normalize::{normalize, NormalizeContext, RawRecord, RawRow, Rejection, SourceKind};
pub use pipeline::{Pipeline, RunOutcome, SourceReport};
pub use query::{split_lifetimes, CommittedCounts, StatementLifetime, UsageDelta};
pub use retry::{ensure_active, CallRuntime, CancellationToken, RetryPolicy};
pub use schema::{
    CanonicalRecord, Collation, InventoryRecord, PipelineRun, RunEntry, RunStatus, Table,
    UsageCounters, UsageRecord,
};
pub use sink::Sink;
pub use store::{LoadAudit, QueryResult, Store};
