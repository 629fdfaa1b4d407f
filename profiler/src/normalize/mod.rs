//! Schema normalizer - maps connector rows into canonical records.
//!
//! Each supported source kind has its own [`Dialect`] describing which columns
//! it exposes and how values are encoded. Normalization is a pure mapping:
//! it never touches the store.
//!
//! All timestamps come out as UTC truncated to microseconds. A raw row that
//! lacks a required field or carries an unparsable value is rejected with a
//! [`Rejection`], which callers count and skip.

mod snowflake;
mod sqlserver;
mod synapse;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Offset, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::schema::{canonical_ts, CanonicalRecord, InventoryRecord, TableRows, UsageRecord};
use crate::Error;

/// Supported source dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[serde(alias = "mssql", alias = "tsql")]
    SqlServer,
    Synapse,
    Snowflake,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::SqlServer => "sqlserver",
            SourceKind::Synapse => "synapse",
            SourceKind::Snowflake => "snowflake",
        }
    }

    fn dialect(&self) -> &'static dyn Dialect {
        match self {
            SourceKind::SqlServer => &sqlserver::SqlServer,
            SourceKind::Synapse => &synapse::Synapse,
            SourceKind::Snowflake => &snowflake::Snowflake,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s.trim().to_lowercase().as_str() {
            "sqlserver" | "mssql" | "tsql" => Ok(SourceKind::SqlServer),
            "synapse" => Ok(SourceKind::Synapse),
            "snowflake" => Ok(SourceKind::Snowflake),
            other => Err(Error::Config(format!("Unsupported source kind: {}", other))),
        }
    }
}

/// A row as delivered by a connector: column name to JSON value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRow(pub Map<String, Value>);

impl RawRow {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Builder used by connectors and tests.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(column.into(), value.into());
        self
    }

    /// Case-insensitive lookup. JSON null counts as absent.
    pub fn get(&self, column: &str) -> Option<&Value> {
        let value = match self.0.get(column) {
            Some(v) => Some(v),
            None => self
                .0
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(column))
                .map(|(_, v)| v),
        };
        value.filter(|v| !v.is_null())
    }
}

impl From<Map<String, Value>> for RawRow {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// A raw record tagged with the table it feeds.
#[derive(Debug, Clone, PartialEq)]
pub enum RawRecord {
    Inventory(RawRow),
    Usage(RawRow),
}

/// Why a raw row could not be normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub field: String,
    pub reason: String,
}

impl Rejection {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }

    fn missing(field: &str) -> Self {
        Self::new(field, "required field is missing")
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "field '{}': {}", self.field, self.reason)
    }
}

impl std::error::Error for Rejection {}

/// Per-extraction values every record needs besides the raw row.
#[derive(Debug, Clone, Copy)]
pub struct NormalizeContext {
    /// Snapshot time, the owning run's execution_date.
    pub extract_ts: DateTime<Utc>,

    /// Offset used for naive source timestamps.
    pub utc_offset: FixedOffset,
}

impl NormalizeContext {
    pub fn new(extract_ts: DateTime<Utc>, utc_offset: FixedOffset) -> Self {
        Self {
            extract_ts: canonical_ts(extract_ts),
            utc_offset,
        }
    }

    pub fn utc(extract_ts: DateTime<Utc>) -> Self {
        Self::new(extract_ts, Utc.fix())
    }
}

/// Column layout and value encoding of one source kind.
trait Dialect: Sync {
    fn inventory(&self, row: &RawRow, ctx: &NormalizeContext) -> Result<InventoryRecord, Rejection>;
    fn usage(&self, row: &RawRow, ctx: &NormalizeContext) -> Result<UsageRecord, Rejection>;
}

/// Normalize one raw record for the given source kind.
pub fn normalize(
    raw: &RawRecord,
    kind: SourceKind,
    ctx: &NormalizeContext,
) -> Result<CanonicalRecord, Rejection> {
    let dialect = kind.dialect();
    match raw {
        RawRecord::Inventory(row) => dialect.inventory(row, ctx).map(CanonicalRecord::Inventory),
        RawRecord::Usage(row) => dialect.usage(row, ctx).map(CanonicalRecord::Usage),
    }
}

/// Normalized rows of one table plus the number of rows that were rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBatch {
    pub rows: TableRows,
    pub rejected: usize,
}

/// Normalize a catalog extraction. Rejected rows are logged and counted.
pub fn normalize_inventory(
    rows: &[RawRow],
    kind: SourceKind,
    ctx: &NormalizeContext,
) -> NormalizedBatch {
    let dialect = kind.dialect();
    let mut records = Vec::with_capacity(rows.len());
    let mut rejected = 0;
    for row in rows {
        match dialect.inventory(row, ctx) {
            Ok(record) => records.push(record),
            Err(rejection) => {
                warn!(source_kind = %kind, table = "inventory", "{}", Error::MalformedRecord(rejection));
                rejected += 1;
            }
        }
    }
    NormalizedBatch {
        rows: TableRows::Inventory(records),
        rejected,
    }
}

/// Normalize a query-statistics extraction. Rejected rows are logged and counted.
pub fn normalize_usage(rows: &[RawRow], kind: SourceKind, ctx: &NormalizeContext) -> NormalizedBatch {
    let dialect = kind.dialect();
    let mut records = Vec::with_capacity(rows.len());
    let mut rejected = 0;
    for row in rows {
        match dialect.usage(row, ctx) {
            Ok(record) => records.push(record),
            Err(rejection) => {
                warn!(source_kind = %kind, table = "usage", "{}", Error::MalformedRecord(rejection));
                rejected += 1;
            }
        }
    }
    NormalizedBatch {
        rows: TableRows::Usage(records),
        rejected,
    }
}

// Field helpers shared by the dialects

fn required<'a>(row: &'a RawRow, field: &str) -> Result<&'a Value, Rejection> {
    row.get(field).ok_or_else(|| Rejection::missing(field))
}

fn required_str(row: &RawRow, field: &str) -> Result<String, Rejection> {
    match required(row, field)? {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(Rejection::new(field, format!("expected text, got {}", other))),
    }
}

fn optional_str(row: &RawRow, field: &str) -> Result<Option<String>, Rejection> {
    match row.get(field) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(Rejection::new(field, format!("expected text, got {}", other))),
    }
}

/// Integers may arrive as JSON numbers or as decimal strings (ODBC exports).
fn required_i64(row: &RawRow, field: &str) -> Result<i64, Rejection> {
    let value = required(row, field)?;
    let parsed = match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().and_then(integral_f64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(integral_f64))
        }
        _ => None,
    };
    parsed.ok_or_else(|| Rejection::new(field, format!("not an integer: {}", value)))
}

fn integral_f64(f: f64) -> Option<i64> {
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

fn required_i32(row: &RawRow, field: &str) -> Result<i32, Rejection> {
    let value = required_i64(row, field)?;
    i32::try_from(value).map_err(|_| Rejection::new(field, format!("out of range: {}", value)))
}

/// Cumulative counters can never be negative at the source.
fn required_counter(row: &RawRow, field: &str) -> Result<i64, Rejection> {
    let value = required_i64(row, field)?;
    if value < 0 {
        return Err(Rejection::new(field, format!("negative counter: {}", value)));
    }
    Ok(value)
}

const OFFSET_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f %:z",
    "%Y-%m-%dT%H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f %z",
];

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Parse a timestamp. Values without an explicit offset are local to `offset`.
fn parse_timestamp(text: &str, offset: &FixedOffset) -> Option<DateTime<Utc>> {
    let text = text.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(canonical_ts(dt.with_timezone(&Utc)));
    }
    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(text, format) {
            return Some(canonical_ts(dt.with_timezone(&Utc)));
        }
    }

    let naive = NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;

    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| canonical_ts(dt.with_timezone(&Utc)))
}

fn required_timestamp(
    row: &RawRow,
    field: &str,
    offset: &FixedOffset,
) -> Result<DateTime<Utc>, Rejection> {
    match required(row, field)? {
        Value::String(s) => parse_timestamp(s, offset)
            .ok_or_else(|| Rejection::new(field, format!("unparsable timestamp: {:?}", s))),
        other => Err(Rejection::new(field, format!("expected timestamp text, got {}", other))),
    }
}

/// Render bytes the way SQL Server prints VARBINARY: `0x` + upper-case hex.
fn hex_handle(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("0x");
    for b in bytes {
        out.push_str(&format!("{:02X}", b));
    }
    out
}

/// Binary handles from JSON exports arrive either as a hex string or as an
/// array of byte values.
fn binary_handle(value: &Value, field: &str) -> Result<Option<String>, Rejection> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                return Err(Rejection::new(field, "empty statement handle"));
            }
            let digits = s
                .strip_prefix("0x")
                .or_else(|| s.strip_prefix("0X"))
                .unwrap_or(s);
            let is_hex = !digits.is_empty()
                && digits.len() % 2 == 0
                && digits.chars().all(|c| c.is_ascii_hexdigit());
            if is_hex {
                Ok(Some(format!("0x{}", digits.to_ascii_uppercase())))
            } else {
                Ok(None)
            }
        }
        Value::Array(items) => {
            let bytes: Option<Vec<u8>> = items
                .iter()
                .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
                .collect();
            match bytes {
                Some(bytes) if !bytes.is_empty() => Ok(Some(hex_handle(&bytes))),
                _ => Err(Rejection::new(field, "statement handle is not a byte array")),
            }
        }
        other => Err(Rejection::new(field, format!("unsupported statement handle: {}", other))),
    }
}
