//! CLI command implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use profiler::config::resolve_config_path;
use profiler::{
    CancellationToken, Error, JsonFileConnector, Pipeline, PipelineConfig, QueryResult, RunEntry,
    RunLedger, SourceConfig, SourceKind, Store,
};
use serde_json::Value;
use tracing::debug;

/// Explicit `--config`, else the standard resolution order.
fn config_path(explicit: Option<&Path>) -> profiler::Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => resolve_config_path(),
    }
}

fn load_config(explicit: Option<&Path>) -> profiler::Result<PipelineConfig> {
    let path = config_path(explicit)?;
    debug!(config = %path.display(), "Loading config");
    PipelineConfig::load_from(&path)
}

/// Write a starter config and create an empty store.
pub fn init(
    explicit: Option<&Path>,
    name: &str,
    extract_folder: Option<PathBuf>,
    force: bool,
) -> profiler::Result<()> {
    let path = config_path(explicit)?;
    if path.exists() && !force {
        println!("Config already exists at {}", path.display());
        println!("Use --force to overwrite it (the store is kept)");
        return Ok(());
    }

    let mut config = PipelineConfig::new(name).with_source(
        SourceConfig::new("prod_sqlserver", SourceKind::SqlServer)
            .with_utc_offset("+00:00")
            .with_connection("server", "localhost"),
    );
    if let Some(folder) = extract_folder {
        config = config.with_extract_folder(folder);
    }
    config.validate()?;
    config.save(&path)?;

    let store = Store::open_for(&config)?;
    println!("Config written to {}", path.display());
    if let Some(db) = store.path() {
        println!("Store created at {}", db.display());
    }
    println!("Edit [[sources]] in the config, then run: dbprof run --dumps <dir>");
    Ok(())
}

/// Run the pipeline once against exported JSON results.
pub fn run(explicit: Option<&Path>, dumps: &Path, json: bool) -> profiler::Result<()> {
    let config = load_config(explicit)?;
    let store = Arc::new(Store::open_for(&config)?);
    let connector = Arc::new(JsonFileConnector::new(dumps));
    let pipeline = Pipeline::new(config, connector, store);

    let outcome = pipeline.run(&CancellationToken::new())?;

    if json {
        let summary = serde_json::json!({
            "pipeline_name": outcome.run.pipeline_name,
            "execution_date": outcome.run.execution_date,
            "version": outcome.run.version,
            "status": outcome.status,
            "report": outcome.report,
            "sources": outcome.sources,
            "recovered": outcome.recovered,
            "error": outcome.error.as_ref().map(|e| e.to_string()),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        for entry in &outcome.recovered {
            println!(
                "Recovered stale run {} ({})",
                entry.run.execution_date.to_rfc3339(),
                entry.runner
            );
        }
        for source in &outcome.sources {
            println!("{}:", source.source_name);
            println!("  inventory: {}", source.inventory);
            println!("  usage:     {}", source.usage);
        }
        println!(
            "Run {} {}: {}",
            outcome.run.execution_date.to_rfc3339(),
            outcome.status,
            outcome.report
        );
    }

    match outcome.error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// List ledger entries.
pub fn runs(explicit: Option<&Path>, format: &str, all: bool) -> profiler::Result<()> {
    let config = load_config(explicit)?;
    let store = Store::open_for(&config)?;
    let pipeline_name = if all { None } else { Some(config.pipeline_name.as_str()) };
    let entries = store.runs(pipeline_name)?;

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        "table" => {
            if entries.is_empty() {
                println!("No runs recorded.");
                return Ok(());
            }
            print_runs(&entries);
        }
        other => {
            return Err(Error::Config(format!(
                "Unknown format: {} (expected table or json)",
                other
            )));
        }
    }
    Ok(())
}

fn print_runs(entries: &[RunEntry]) {
    println!(
        "{:<24} {:<32} {:<10} {:<10} {:<24} ERROR",
        "PIPELINE", "EXECUTION_DATE", "STATUS", "VERSION", "RUNNER"
    );
    for entry in entries {
        println!(
            "{:<24} {:<32} {:<10} {:<10} {:<24} {}",
            entry.run.pipeline_name,
            entry.run.execution_date.to_rfc3339(),
            entry.status,
            entry.run.version,
            entry.runner,
            entry.error.as_deref().unwrap_or("")
        );
    }
}

/// Fail runs whose owner stopped sending heartbeats.
pub fn recover(explicit: Option<&Path>) -> profiler::Result<()> {
    let config = load_config(explicit)?;
    let store = Store::open_for(&config)?;
    let ledger = RunLedger::new(
        &store,
        config.pipeline_name.clone(),
        config.version.clone(),
        config.run_timeout(),
    );

    let swept = ledger.sweep_stale()?;
    if swept.is_empty() {
        println!("No stale runs for {}.", config.pipeline_name);
        return Ok(());
    }
    for entry in &swept {
        println!(
            "Marked run {} {} (last heartbeat {} from {})",
            entry.run.execution_date.to_rfc3339(),
            entry.status,
            entry.heartbeat_at.to_rfc3339(),
            entry.runner
        );
    }
    Ok(())
}

/// Print each plan-cache lifetime of a statement with per-snapshot deltas.
pub fn lifetimes(explicit: Option<&Path>, sql_handle: &str) -> profiler::Result<()> {
    let config = load_config(explicit)?;
    let store = Store::open_for(&config)?;
    let lifetimes = store.statement_lifetimes(sql_handle)?;

    if lifetimes.is_empty() {
        println!("No committed snapshots for {}.", sql_handle);
        return Ok(());
    }

    for (i, lifetime) in lifetimes.iter().enumerate() {
        println!(
            "Lifetime {} ({} snapshots)",
            i + 1,
            lifetime.snapshots.len()
        );
        println!(
            "  {:<32} {:>12} {:>16} {:>16} {:>12}",
            "EXTRACT_TS", "EXECUTIONS", "WORKER_TIME", "ELAPSED_TIME", "ROWS"
        );
        for delta in lifetime.deltas() {
            println!(
                "  {:<32} {:>12} {:>16} {:>16} {:>12}",
                delta.extract_ts.to_rfc3339(),
                delta.execution_count,
                delta.total_worker_time,
                delta.total_elapsed_time,
                delta.total_rows
            );
        }
    }
    Ok(())
}

/// Execute a SQL query against the store, opened read-only.
pub fn sql(explicit: Option<&Path>, query: &str, format: &str) -> profiler::Result<()> {
    let config = load_config(explicit)?;
    let store = Store::open_read_only(&config.db_path())?;
    let result = store.query(query)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&result.records())?),
        "table" => print_query(&result),
        other => {
            return Err(Error::Config(format!(
                "Unknown format: {} (expected table or json)",
                other
            )));
        }
    }
    Ok(())
}

/// Aligned text table. Columns holding only numbers are right-aligned so
/// counters line up.
fn print_query(result: &QueryResult) {
    if result.rows.is_empty() {
        println!("No results.");
        return;
    }

    let cells: Vec<Vec<String>> = (0..result.rows.len())
        .map(|r| (0..result.columns.len()).map(|c| result.text(r, c)).collect())
        .collect();
    let numeric: Vec<bool> = (0..result.columns.len())
        .map(|c| {
            result
                .rows
                .iter()
                .all(|row| matches!(row.get(c), Some(Value::Number(_)) | Some(Value::Null)))
        })
        .collect();
    let widths: Vec<usize> = result
        .columns
        .iter()
        .enumerate()
        .map(|(c, name)| {
            cells
                .iter()
                .map(|row| row[c].chars().count())
                .fold(name.chars().count(), usize::max)
        })
        .collect();

    let line = |values: &[String]| {
        let padded: Vec<String> = values
            .iter()
            .enumerate()
            .map(|(c, value)| {
                if numeric[c] {
                    format!("{:>width$}", value, width = widths[c])
                } else {
                    format!("{:<width$}", value, width = widths[c])
                }
            })
            .collect();
        padded.join("  ").trim_end().to_string()
    };

    println!("{}", line(result.columns.as_slice()));
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    println!("{}", rule.join("  "));
    for row in &cells {
        println!("{}", line(row.as_slice()));
    }
    println!("({} rows)", cells.len());
}
