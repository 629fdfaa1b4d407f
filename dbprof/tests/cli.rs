//! Integration tests for the dbprof CLI.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use tempfile::TempDir;

fn config_file(root: &Path) -> PathBuf {
    root.join("pipeline.toml")
}

fn dbprof_cmd(root: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_dbprof"));
    cmd.env("DBPROFILE_CONFIG", config_file(root));
    cmd.env("RUST_LOG", "warn");
    cmd
}

fn dbprof(root: &Path, args: &[&str]) -> Output {
    dbprof_cmd(root)
        .args(args)
        .output()
        .expect("failed to run dbprof")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

/// Config with one SQL Server source and no retries.
fn write_config(root: &Path) {
    let contents = format!(
        r#"
pipeline_name = "fleet"
extract_folder = '{}'
retry_limit = 0
connector_timeout_secs = 30

[[sources]]
name = "prod_sql"
kind = "sqlserver"
utc_offset = "+00:00"
"#,
        root.join("extract").display()
    );
    std::fs::write(config_file(root), contents).unwrap();
}

fn write_dumps(root: &Path) -> PathBuf {
    let dumps = root.join("dumps");
    let source = dumps.join("prod_sql");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(
        source.join("databases.json"),
        r#"[
  {"database_id": 1, "name": "master", "collation_name": "SQL_Latin1_General_CP1_CI_AS", "create_date": "2003-04-08 09:13:36.390"},
  {"database_id": 2, "name": "tempdb", "collation_name": "SQL_Latin1_General_CP1_CI_AS", "create_date": "2024-05-01 06:00:00.000"},
  {"database_id": 5, "name": "sales", "collation_name": null, "create_date": "2019-11-20 14:02:11.000"}
]"#,
    )
    .unwrap();
    std::fs::write(
        source.join("query_stats.json"),
        r#"[
  {"sql_handle": "0x0200000012AB", "creation_time": "2024-06-01 00:00:00", "last_execution_time": "2024-06-02 10:00:00",
   "execution_count": 500, "total_worker_time": 120000, "total_elapsed_time": 150000, "total_rows": 2000},
  {"sql_handle": "0x0200000034CD", "creation_time": "2024-06-01 00:00:00", "last_execution_time": "2024-06-02 11:00:00",
   "execution_count": 7, "total_worker_time": 900, "total_elapsed_time": 1100, "total_rows": 7}
]"#,
    )
    .unwrap();
    dumps
}

#[test]
fn test_init_writes_config_and_store() {
    let tmp = TempDir::new().unwrap();
    let extract = tmp.path().join("extract");

    let output = dbprof(
        tmp.path(),
        &["init", "--name", "fleet", "--extract-folder", extract.to_str().unwrap()],
    );
    assert!(output.status.success(), "dbprof init failed: {:?}", output);

    let config = std::fs::read_to_string(config_file(tmp.path())).unwrap();
    assert!(config.contains("pipeline_name = \"fleet\""));
    assert!(config.contains("prod_sqlserver"));
    assert!(extract.join("profiler_extract.duckdb").exists());
}

#[test]
fn test_init_keeps_existing_config() {
    let tmp = TempDir::new().unwrap();
    write_config(tmp.path());
    let before = std::fs::read_to_string(config_file(tmp.path())).unwrap();

    let output = dbprof(tmp.path(), &["init"]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("already exists"));
    assert_eq!(std::fs::read_to_string(config_file(tmp.path())).unwrap(), before);
}

#[test]
fn test_run_loads_dumps() {
    let tmp = TempDir::new().unwrap();
    write_config(tmp.path());
    let dumps = write_dumps(tmp.path());

    let output = dbprof(tmp.path(), &["run", "--dumps", dumps.to_str().unwrap()]);
    assert!(output.status.success(), "dbprof run failed: {}", stderr(&output));
    let out = stdout(&output);
    assert!(out.contains("SUCCEEDED"), "unexpected output: {}", out);
    assert!(out.contains("5 written"), "unexpected output: {}", out);

    let output = dbprof(tmp.path(), &["sql", "SELECT COUNT(*) AS n FROM inventory"]);
    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.lines().any(|line| line.trim() == "3"), "unexpected output: {}", out);
    assert!(out.contains("(1 rows)"));
}

#[test]
fn test_run_json_output() {
    let tmp = TempDir::new().unwrap();
    write_config(tmp.path());
    let dumps = write_dumps(tmp.path());

    let output = dbprof(tmp.path(), &["run", "--dumps", dumps.to_str().unwrap(), "--json"]);
    assert!(output.status.success(), "dbprof run failed: {}", stderr(&output));

    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["status"], "SUCCEEDED");
    assert_eq!(summary["pipeline_name"], "fleet");
    assert_eq!(summary["report"]["rows_written"], 5);
    assert_eq!(summary["sources"][0]["usage"]["rows_written"], 2);
    assert!(summary["error"].is_null());
}

#[test]
fn test_failed_run_exits_nonzero_and_is_recorded() {
    let tmp = TempDir::new().unwrap();
    write_config(tmp.path());

    let missing = tmp.path().join("no-dumps");
    let output = dbprof(tmp.path(), &["run", "--dumps", missing.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(stdout(&output).contains("FAILED"));
    assert!(stderr(&output).contains("Error:"));

    let output = dbprof(tmp.path(), &["runs", "--format", "json"]);
    assert!(output.status.success());
    let runs: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let runs = runs.as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["status"], "FAILED");
    assert!(runs[0]["error"].as_str().unwrap().contains("prod_sql"));
}

#[test]
fn test_sql_json_keeps_types() {
    let tmp = TempDir::new().unwrap();
    write_config(tmp.path());
    let dumps = write_dumps(tmp.path());

    let output = dbprof(tmp.path(), &["run", "--dumps", dumps.to_str().unwrap()]);
    assert!(output.status.success(), "dbprof run failed: {}", stderr(&output));

    let output = dbprof(
        tmp.path(),
        &[
            "sql",
            "SELECT sql_handle, execution_count FROM usage ORDER BY sql_handle",
            "--format",
            "json",
        ],
    );
    assert!(output.status.success(), "dbprof sql failed: {}", stderr(&output));
    let rows: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(rows[0]["sql_handle"], "0x0200000012AB");
    assert_eq!(rows[0]["execution_count"], 500);
    assert_eq!(rows[1]["execution_count"], 7);
}

#[test]
fn test_sql_cannot_modify_the_store() {
    let tmp = TempDir::new().unwrap();
    write_config(tmp.path());
    let dumps = write_dumps(tmp.path());

    let output = dbprof(tmp.path(), &["run", "--dumps", dumps.to_str().unwrap()]);
    assert!(output.status.success(), "dbprof run failed: {}", stderr(&output));

    let output = dbprof(tmp.path(), &["sql", "DELETE FROM usage"]);
    assert!(!output.status.success());

    let output = dbprof(tmp.path(), &["sql", "SELECT COUNT(*) AS n FROM usage"]);
    assert!(output.status.success(), "dbprof sql failed: {}", stderr(&output));
    assert!(stdout(&output).lines().any(|line| line.trim() == "2"));
}

#[test]
fn test_sql_without_a_store_fails() {
    let tmp = TempDir::new().unwrap();
    write_config(tmp.path());

    let output = dbprof(tmp.path(), &["sql", "SELECT 1"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Not found"));
}

#[test]
fn test_runs_table_lists_each_run() {
    let tmp = TempDir::new().unwrap();
    write_config(tmp.path());
    let dumps = write_dumps(tmp.path());

    for _ in 0..2 {
        let output = dbprof(tmp.path(), &["run", "--dumps", dumps.to_str().unwrap()]);
        assert!(output.status.success(), "dbprof run failed: {}", stderr(&output));
    }

    let output = dbprof(tmp.path(), &["runs"]);
    assert!(output.status.success());
    let out = stdout(&output);
    assert_eq!(out.matches("SUCCEEDED").count(), 2, "unexpected output: {}", out);
}

#[test]
fn test_runs_rejects_unknown_format() {
    let tmp = TempDir::new().unwrap();
    write_config(tmp.path());

    let output = dbprof(tmp.path(), &["runs", "--format", "yaml"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("Unknown format"));
}

#[test]
fn test_recover_without_stale_runs() {
    let tmp = TempDir::new().unwrap();
    write_config(tmp.path());

    let output = dbprof(tmp.path(), &["recover"]);
    assert!(output.status.success(), "dbprof recover failed: {}", stderr(&output));
    assert!(stdout(&output).contains("No stale runs"));
}

#[test]
fn test_lifetimes_after_run() {
    let tmp = TempDir::new().unwrap();
    write_config(tmp.path());
    let dumps = write_dumps(tmp.path());

    let output = dbprof(tmp.path(), &["run", "--dumps", dumps.to_str().unwrap()]);
    assert!(output.status.success(), "dbprof run failed: {}", stderr(&output));

    let output = dbprof(tmp.path(), &["lifetimes", "0x0200000012AB"]);
    assert!(output.status.success());
    let out = stdout(&output);
    assert!(out.contains("Lifetime 1 (1 snapshots)"), "unexpected output: {}", out);
    assert!(out.contains("500"));
}

#[test]
fn test_missing_config_is_an_error() {
    let tmp = TempDir::new().unwrap();

    let output = dbprof(tmp.path(), &["runs"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("config file"));
}

#[test]
fn test_explicit_config_flag_wins() {
    let tmp = TempDir::new().unwrap();
    write_config(tmp.path());
    let moved = tmp.path().join("elsewhere.toml");
    std::fs::rename(config_file(tmp.path()), &moved).unwrap();

    let output = dbprof(tmp.path(), &["--config", moved.to_str().unwrap(), "recover"]);
    assert!(output.status.success(), "dbprof recover failed: {}", stderr(&output));
}
