//! SQL Server catalog (`sys.databases`) and plan-cache statistics
//! (`sys.dm_exec_query_stats`).

use super::{
    binary_handle, optional_str, required, required_counter, required_i32, required_str,
    required_timestamp, Dialect, NormalizeContext, RawRow, Rejection,
};
use crate::schema::{Collation, InventoryRecord, UsageRecord};

pub(super) struct SqlServer;

impl Dialect for SqlServer {
    fn inventory(&self, row: &RawRow, ctx: &NormalizeContext) -> Result<InventoryRecord, Rejection> {
        Ok(InventoryRecord {
            db_id: required_i32(row, "database_id")?,
            name: required_str(row, "name")?,
            collation_name: Collation::from_option(optional_str(row, "collation_name")?),
            create_date: required_timestamp(row, "create_date", &ctx.utc_offset)?,
            extract_ts: ctx.extract_ts,
        })
    }

    fn usage(&self, row: &RawRow, ctx: &NormalizeContext) -> Result<UsageRecord, Rejection> {
        let handle = required(row, "sql_handle")?;
        let sql_handle = match binary_handle(handle, "sql_handle")? {
            Some(hex) => hex,
            None => required_str(row, "sql_handle")?.trim().to_string(),
        };

        Ok(UsageRecord {
            sql_handle,
            creation_time: required_timestamp(row, "creation_time", &ctx.utc_offset)?,
            last_execution_time: required_timestamp(row, "last_execution_time", &ctx.utc_offset)?,
            execution_count: required_counter(row, "execution_count")?,
            total_worker_time: required_counter(row, "total_worker_time")?,
            total_elapsed_time: required_counter(row, "total_elapsed_time")?,
            total_rows: required_counter(row, "total_rows")?,
            extract_ts: ctx.extract_ts,
        })
    }
}
