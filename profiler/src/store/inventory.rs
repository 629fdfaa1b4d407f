//! Inventory storage operations.

use chrono::{DateTime, Utc};
use duckdb::{params, Connection};

use super::Store;
use crate::schema::{from_epoch_us, sql_timestamp, Collation, InventoryRecord};
use crate::Result;

/// Append inventory rows. Runs inside the caller's transaction.
pub(super) fn insert(conn: &Connection, rows: &[InventoryRecord]) -> Result<usize> {
    let mut stmt = conn.prepare(
        "INSERT INTO inventory (db_id, name, collation_name, create_date, extract_ts) \
         VALUES (?, ?, ?, ?, ?)",
    )?;
    for record in rows {
        stmt.execute(params![
            record.db_id,
            record.name,
            record.collation_name.as_option(),
            sql_timestamp(&record.create_date),
            sql_timestamp(&record.extract_ts),
        ])?;
    }
    Ok(rows.len())
}

fn read(conn: &Connection, sql: &str, params: &[&dyn duckdb::ToSql]) -> Result<Vec<InventoryRecord>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, |row| {
        Ok((
            row.get::<_, i32>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, i64>(4)?,
        ))
    })?;

    let mut records = Vec::new();
    for row in rows {
        let (db_id, name, collation, create_us, extract_us) = row?;
        records.push(InventoryRecord {
            db_id,
            name,
            collation_name: Collation::from_option(collation),
            create_date: from_epoch_us(create_us)?,
            extract_ts: from_epoch_us(extract_us)?,
        });
    }
    Ok(records)
}

const INVENTORY_COLUMNS: &str = "i.db_id, i.name, i.collation_name, \
     epoch_us(i.create_date), epoch_us(i.extract_ts)";

impl Store {
    /// Inventory rows of one snapshot, ordered by db_id.
    pub fn inventory_snapshot(&self, extract_ts: DateTime<Utc>) -> Result<Vec<InventoryRecord>> {
        let conn = self.connection()?;
        let sql = format!(
            "SELECT {} FROM inventory i WHERE i.extract_ts = CAST(? AS TIMESTAMP) ORDER BY i.db_id",
            INVENTORY_COLUMNS
        );
        read(&conn, &sql, &[&sql_timestamp(&extract_ts)])
    }

    /// Inventory rows written by SUCCEEDED runs of a pipeline, oldest
    /// snapshot first.
    pub fn committed_inventory(&self, pipeline_name: &str) -> Result<Vec<InventoryRecord>> {
        let conn = self.connection()?;
        let sql = format!(
            "SELECT {} FROM inventory i \
             JOIN run_ledger l ON l.execution_date = i.extract_ts \
             WHERE l.pipeline_name = ? AND l.status = 'SUCCEEDED' \
             ORDER BY i.extract_ts, i.db_id",
            INVENTORY_COLUMNS
        );
        read(&conn, &sql, &[&pipeline_name])
    }
}
