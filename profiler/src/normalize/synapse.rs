//! Azure Synapse SQL pools.
//!
//! Same catalog views as SQL Server, but exported through the workspace
//! tooling: server clocks are always UTC, counters may be decimal strings and
//! VARBINARY handles come base64-encoded unless written as a `0x` literal.

use base64::Engine;
use chrono::{Offset, Utc};

use super::{
    binary_handle, hex_handle, optional_str, required, required_counter, required_i32,
    required_str, required_timestamp, Dialect, NormalizeContext, RawRow, Rejection,
};
use crate::schema::{Collation, InventoryRecord, UsageRecord};

pub(super) struct Synapse;

impl Synapse {
    /// The encoding follows the value's shape: a byte array is raw bytes, a
    /// `0x` string is a hex literal, and any other string is base64. Bare
    /// hex digits are valid base64 too and are read as base64.
    fn handle(row: &RawRow) -> Result<String, Rejection> {
        let value = required(row, "sql_handle")?;
        let Some(text) = value.as_str() else {
            return binary_handle(value, "sql_handle")?
                .ok_or_else(|| Rejection::new("sql_handle", "unsupported statement handle"));
        };

        let text = text.trim();
        if text.starts_with("0x") || text.starts_with("0X") {
            return binary_handle(value, "sql_handle")?.ok_or_else(|| {
                Rejection::new("sql_handle", format!("invalid hex handle: {}", text))
            });
        }

        let bytes = base64::engine::general_purpose::STANDARD
            .decode(text)
            .map_err(|e| Rejection::new("sql_handle", format!("invalid base64 handle: {}", e)))?;
        if bytes.is_empty() {
            return Err(Rejection::new("sql_handle", "empty statement handle"));
        }
        Ok(hex_handle(&bytes))
    }
}

impl Dialect for Synapse {
    fn inventory(&self, row: &RawRow, ctx: &NormalizeContext) -> Result<InventoryRecord, Rejection> {
        let utc = Utc.fix();
        Ok(InventoryRecord {
            db_id: required_i32(row, "database_id")?,
            name: required_str(row, "name")?,
            collation_name: Collation::from_option(optional_str(row, "collation_name")?),
            create_date: required_timestamp(row, "create_date", &utc)?,
            extract_ts: ctx.extract_ts,
        })
    }

    fn usage(&self, row: &RawRow, ctx: &NormalizeContext) -> Result<UsageRecord, Rejection> {
        let utc = Utc.fix();
        Ok(UsageRecord {
            sql_handle: Self::handle(row)?,
            creation_time: required_timestamp(row, "creation_time", &utc)?,
            last_execution_time: required_timestamp(row, "last_execution_time", &utc)?,
            execution_count: required_counter(row, "execution_count")?,
            total_worker_time: required_counter(row, "total_worker_time")?,
            total_elapsed_time: required_counter(row, "total_elapsed_time")?,
            total_rows: required_counter(row, "total_rows")?,
            extract_ts: ctx.extract_ts,
        })
    }
}
