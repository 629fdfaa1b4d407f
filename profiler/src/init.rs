//! Store initialization - creates the canonical tables and the run ledger.
//!
//! # Tables
//!
//! ## Canonical (read by downstream reports)
//! - `inventory` - one row per database object per snapshot
//! - `usage` - one row per statement signature per snapshot
//! - `metadata` - one row per pipeline run
//!
//! ## Ledger (owned by the pipeline's write path)
//! - `run_ledger` - lifecycle state of each run, keyed by (pipeline_name, execution_date)
//! - `load_batches` - one row per committed write, attributing rows to a run and source
//! - `usage_sources` - which source reported each usage handle in a run
//!
//! Creation is idempotent: existing tables are left untouched, so an operator
//! may pre-create a table with stricter DDL.

use duckdb::Connection;
use tracing::debug;

use crate::Result;

/// Create all tables that do not exist yet.
pub fn initialize(conn: &Connection) -> Result<()> {
    create_canonical_tables(conn)?;
    create_ledger_tables(conn)?;
    debug!("Store schema ready");
    Ok(())
}

fn create_canonical_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS inventory (
            db_id INTEGER,
            name VARCHAR,
            collation_name VARCHAR,
            create_date TIMESTAMP,
            extract_ts TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS usage (
            sql_handle VARCHAR,
            creation_time TIMESTAMP,
            last_execution_time TIMESTAMP,
            execution_count BIGINT,
            total_worker_time BIGINT,
            total_elapsed_time BIGINT,
            total_rows BIGINT,
            extract_ts TIMESTAMP
        );

        CREATE TABLE IF NOT EXISTS metadata (
            pipeline_name VARCHAR,
            execution_date TIMESTAMP,
            version VARCHAR
        );
        "#,
    )?;
    Ok(())
}

fn create_ledger_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS run_ledger (
            pipeline_name VARCHAR NOT NULL,
            execution_date TIMESTAMP NOT NULL,
            status VARCHAR NOT NULL,
            runner VARCHAR NOT NULL,
            heartbeat_at TIMESTAMP NOT NULL,
            finished_at TIMESTAMP,
            error VARCHAR
        );

        CREATE TABLE IF NOT EXISTS load_batches (
            pipeline_name VARCHAR NOT NULL,
            execution_date TIMESTAMP NOT NULL,
            source_name VARCHAR NOT NULL,
            table_name VARCHAR NOT NULL,
            rows_written BIGINT NOT NULL,
            rows_rejected BIGINT NOT NULL,
            duplicates_skipped BIGINT NOT NULL,
            counter_regressions BIGINT NOT NULL,
            committed_at TIMESTAMP NOT NULL
        );

        CREATE TABLE IF NOT EXISTS usage_sources (
            pipeline_name VARCHAR NOT NULL,
            execution_date TIMESTAMP NOT NULL,
            source_name VARCHAR NOT NULL,
            sql_handle VARCHAR NOT NULL
        );
        "#,
    )?;
    Ok(())
}
