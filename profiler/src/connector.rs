//! Source connectors - the capability that yields raw catalog and
//! query-statistics rows for one source instance.
//!
//! Authentication and drivers live outside this crate. A connector receives
//! the source's opaque connection settings and returns rows as JSON objects.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::SourceConfig;
use crate::normalize::RawRow;

/// Failure of a single connector call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    /// Source could not be reached. Retryable.
    Unreachable(String),

    /// Call did not finish in time. Retryable.
    Timeout(Duration),

    /// Source answered with an error. Not retried.
    Query(String),
}

impl ConnectorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConnectorError::Unreachable(_) | ConnectorError::Timeout(_))
    }
}

impl fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectorError::Unreachable(msg) => write!(f, "source unreachable: {}", msg),
            ConnectorError::Timeout(after) => write!(f, "timed out after {:?}", after),
            ConnectorError::Query(msg) => write!(f, "query failed: {}", msg),
        }
    }
}

impl std::error::Error for ConnectorError {}

/// Extraction capability for one kind of source.
///
/// Implementations must be shareable across worker threads.
pub trait SourceConnector: Send + Sync {
    /// Catalog rows, one per database on the instance.
    fn list_databases(&self, source: &SourceConfig) -> Result<Vec<RawRow>, ConnectorError>;

    /// Statement statistics. With `since`, sources that can filter return only
    /// statements executed at or after it; others return a full snapshot.
    fn list_query_stats(
        &self,
        source: &SourceConfig,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawRow>, ConnectorError>;
}

/// Reads exported extraction results from disk.
///
/// Layout: `<root>/<source name>/databases.json` and
/// `<root>/<source name>/query_stats.json`, each a JSON array of objects.
#[derive(Debug, Clone)]
pub struct JsonFileConnector {
    root: PathBuf,
}

impl JsonFileConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn source_dir(&self, source: &SourceConfig) -> PathBuf {
        self.root.join(&source.name)
    }

    fn read_rows(&self, source: &SourceConfig, file: &str) -> Result<Vec<RawRow>, ConnectorError> {
        let dir = self.source_dir(source);
        if !dir.is_dir() {
            return Err(ConnectorError::Unreachable(format!(
                "no export directory at {}",
                dir.display()
            )));
        }
        let path = dir.join(file);
        if !path.exists() {
            // An absent file means the source produced no rows of this kind.
            return Ok(Vec::new());
        }
        read_json_rows(&path)
    }
}

fn read_json_rows(path: &Path) -> Result<Vec<RawRow>, ConnectorError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| ConnectorError::Unreachable(format!("{}: {}", path.display(), e)))?;
    let value: Value = serde_json::from_str(&contents)
        .map_err(|e| ConnectorError::Query(format!("{}: {}", path.display(), e)))?;

    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(map) => Ok(RawRow::from(map)),
                other => Err(ConnectorError::Query(format!(
                    "{}: expected an object per row, got {}",
                    path.display(),
                    other
                ))),
            })
            .collect(),
        _ => Err(ConnectorError::Query(format!(
            "{}: expected a JSON array",
            path.display()
        ))),
    }
}

/// Column carrying the last execution time, per dialect.
const LAST_EXECUTION_COLUMNS: &[&str] = &["last_execution_time", "LAST_START_TIME"];

impl SourceConnector for JsonFileConnector {
    fn list_databases(&self, source: &SourceConfig) -> Result<Vec<RawRow>, ConnectorError> {
        self.read_rows(source, "databases.json")
    }

    fn list_query_stats(
        &self,
        source: &SourceConfig,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawRow>, ConnectorError> {
        let rows = self.read_rows(source, "query_stats.json")?;
        let Some(since) = since else {
            return Ok(rows);
        };

        // Rows whose time cannot be read are kept; the normalizer decides.
        Ok(rows
            .into_iter()
            .filter(|row| {
                LAST_EXECUTION_COLUMNS
                    .iter()
                    .find_map(|column| row.get(column).and_then(Value::as_str))
                    .and_then(|text| DateTime::parse_from_rfc3339(text.trim()).ok())
                    .map(|ts| ts.with_timezone(&Utc) >= since)
                    .unwrap_or(true)
            })
            .collect())
    }
}
