//! Snowflake account usage (`DATABASES`, aggregated `QUERY_HISTORY`).
//!
//! Snowflake has no collation on databases, reports durations in
//! milliseconds and identifies statements by `QUERY_HASH`.

use super::{
    required_counter, required_i32, required_str, required_timestamp, Dialect, NormalizeContext,
    RawRow, Rejection,
};
use crate::schema::{Collation, InventoryRecord, UsageRecord};

pub(super) struct Snowflake;

const MICROS_PER_MILLI: i64 = 1_000;

fn millis_to_micros(field: &str, millis: i64) -> Result<i64, Rejection> {
    millis
        .checked_mul(MICROS_PER_MILLI)
        .ok_or_else(|| Rejection::new(field, format!("duration overflows: {}", millis)))
}

impl Dialect for Snowflake {
    fn inventory(&self, row: &RawRow, ctx: &NormalizeContext) -> Result<InventoryRecord, Rejection> {
        Ok(InventoryRecord {
            db_id: required_i32(row, "DATABASE_ID")?,
            name: required_str(row, "DATABASE_NAME")?,
            collation_name: Collation::Unknown,
            create_date: required_timestamp(row, "CREATED", &ctx.utc_offset)?,
            extract_ts: ctx.extract_ts,
        })
    }

    fn usage(&self, row: &RawRow, ctx: &NormalizeContext) -> Result<UsageRecord, Rejection> {
        let sql_handle = required_str(row, "QUERY_HASH")?.trim().to_string();
        if sql_handle.is_empty() {
            return Err(Rejection::new("QUERY_HASH", "empty statement handle"));
        }
        let execution_ms = required_counter(row, "TOTAL_EXECUTION_TIME")?;
        let elapsed_ms = required_counter(row, "TOTAL_ELAPSED_TIME")?;

        Ok(UsageRecord {
            sql_handle,
            creation_time: required_timestamp(row, "FIRST_START_TIME", &ctx.utc_offset)?,
            last_execution_time: required_timestamp(row, "LAST_START_TIME", &ctx.utc_offset)?,
            execution_count: required_counter(row, "EXECUTION_COUNT")?,
            total_worker_time: millis_to_micros("TOTAL_EXECUTION_TIME", execution_ms)?,
            total_elapsed_time: millis_to_micros("TOTAL_ELAPSED_TIME", elapsed_ms)?,
            total_rows: required_counter(row, "ROWS_PRODUCED")?,
            extract_ts: ctx.extract_ts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn ctx() -> NormalizeContext {
        NormalizeContext::utc(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap())
    }

    #[test]
    fn test_inventory_has_unknown_collation() {
        let row = RawRow::new()
            .with("DATABASE_ID", 12)
            .with("DATABASE_NAME", "ANALYTICS")
            .with("CREATED", "2021-09-14 03:22:10.512 -0700");

        let record = Snowflake.inventory(&row, &ctx()).unwrap();
        assert_eq!(record.name, "ANALYTICS");
        assert_eq!(record.collation_name, Collation::Unknown);
        assert_eq!(
            record.create_date,
            Utc.with_ymd_and_hms(2021, 9, 14, 10, 22, 10).unwrap()
                + chrono::TimeDelta::milliseconds(512)
        );
    }

    #[test]
    fn test_usage_converts_millis() {
        let row = RawRow::new()
            .with("QUERY_HASH", "a1b2c3d4e5f60718293a4b5c6d7e8f90")
            .with("FIRST_START_TIME", "2024-05-01T00:00:00Z")
            .with("LAST_START_TIME", "2024-05-31T23:00:00Z")
            .with("EXECUTION_COUNT", 40)
            .with("TOTAL_EXECUTION_TIME", 1_500)
            .with("TOTAL_ELAPSED_TIME", 2_000)
            .with("ROWS_PRODUCED", 77);

        let record = Snowflake.usage(&row, &ctx()).unwrap();
        assert_eq!(record.sql_handle, "a1b2c3d4e5f60718293a4b5c6d7e8f90");
        assert_eq!(record.total_worker_time, 1_500_000);
        assert_eq!(record.total_elapsed_time, 2_000_000);
        assert_eq!(record.total_rows, 77);
    }

    #[test]
    fn test_usage_lowercase_columns_accepted() {
        let row = RawRow::new()
            .with("query_hash", "ff")
            .with("first_start_time", "2024-05-01 00:00:00")
            .with("last_start_time", "2024-05-01 00:00:00")
            .with("execution_count", 1)
            .with("total_execution_time", 1)
            .with("total_elapsed_time", 1)
            .with("rows_produced", 0);

        assert!(Snowflake.usage(&row, &ctx()).is_ok());
    }
}
