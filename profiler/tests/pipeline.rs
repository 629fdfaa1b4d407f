//! End-to-end runs against an on-disk store with scripted connectors.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dbprofile::{
    CancellationToken, ConnectorError, Error, PipelineConfig, RawRow, RunLedger, RunStatus, Sink,
    SourceConfig, SourceConnector, SourceKind, Store,
};
use tempfile::TempDir;

type Hook = Box<dyn Fn() + Send + Sync>;

/// Connector returning canned rows per source, with optional scripted
/// failures and delays.
#[derive(Default)]
struct ScriptedConnector {
    databases: HashMap<String, Vec<RawRow>>,
    stats: HashMap<String, Vec<RawRow>>,
    failures: Mutex<HashMap<(String, &'static str), VecDeque<ConnectorError>>>,
    stats_delay: Option<Duration>,
    before_stats: Option<Hook>,
    seen_since: Mutex<Vec<(String, Option<DateTime<Utc>>)>>,
}

impl ScriptedConnector {
    fn with_source(mut self, name: &str, databases: Vec<RawRow>, stats: Vec<RawRow>) -> Self {
        self.databases.insert(name.to_string(), databases);
        self.stats.insert(name.to_string(), stats);
        self
    }

    fn failing(self, name: &str, operation: &'static str, errors: Vec<ConnectorError>) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert((name.to_string(), operation), errors.into());
        self
    }

    fn next_failure(&self, name: &str, operation: &'static str) -> Option<ConnectorError> {
        self.failures
            .lock()
            .unwrap()
            .get_mut(&(name.to_string(), operation))
            .and_then(|queue| queue.pop_front())
    }
}

impl SourceConnector for ScriptedConnector {
    fn list_databases(&self, source: &SourceConfig) -> Result<Vec<RawRow>, ConnectorError> {
        if let Some(err) = self.next_failure(&source.name, "list_databases") {
            return Err(err);
        }
        Ok(self.databases.get(&source.name).cloned().unwrap_or_default())
    }

    fn list_query_stats(
        &self,
        source: &SourceConfig,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RawRow>, ConnectorError> {
        self.seen_since
            .lock()
            .unwrap()
            .push((source.name.clone(), since));
        if let Some(hook) = &self.before_stats {
            hook();
        }
        if let Some(delay) = self.stats_delay {
            thread::sleep(delay);
        }
        if let Some(err) = self.next_failure(&source.name, "list_query_stats") {
            return Err(err);
        }
        Ok(self.stats.get(&source.name).cloned().unwrap_or_default())
    }
}

fn database(id: i64, name: &str) -> RawRow {
    RawRow::new()
        .with("database_id", id)
        .with("name", name)
        .with("collation_name", "SQL_Latin1_General_CP1_CI_AS")
        .with("create_date", "2003-04-08 09:13:36.390")
}

fn three_databases() -> Vec<RawRow> {
    vec![database(1, "master"), database(2, "tempdb"), database(5, "sales")]
}

fn stat(handle: &str, execution_count: i64) -> RawRow {
    RawRow::new()
        .with("sql_handle", handle)
        .with("creation_time", "2024-01-01 00:00:00")
        .with("last_execution_time", "2024-06-01 08:30:00.123")
        .with("execution_count", execution_count)
        .with("total_worker_time", execution_count * 250)
        .with("total_elapsed_time", execution_count * 300)
        .with("total_rows", execution_count * 4)
}

fn two_stats() -> Vec<RawRow> {
    vec![stat("0x02000000AA", 500), stat("0x02000000BB", 12)]
}

fn config(root: &Path, sources: &[&str]) -> PipelineConfig {
    let mut config = PipelineConfig::new("fleet_assessment").with_extract_folder(root);
    config.retry_base_delay_ms = 1;
    config.connector_timeout_secs = 10;
    for name in sources {
        config = config.with_source(SourceConfig::new(*name, SourceKind::SqlServer));
    }
    config
}

fn pipeline(
    config: &PipelineConfig,
    connector: ScriptedConnector,
    store: &Arc<Store>,
) -> dbprofile::Pipeline {
    dbprofile::Pipeline::new(config.clone(), Arc::new(connector), store.clone())
}

fn count(store: &Store, sql: &str) -> i64 {
    store.query(sql).unwrap().rows[0][0].as_i64().unwrap()
}

#[test]
fn test_single_source_run_writes_every_row_under_one_run() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path(), &["prod_sql"]);
    let store = Arc::new(Store::open_for(&config).unwrap());
    let connector = ScriptedConnector::default().with_source("prod_sql", three_databases(), two_stats());

    let outcome = pipeline(&config, connector, &store)
        .run(&CancellationToken::new())
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Succeeded, "{:?}", outcome.error);
    assert_eq!(outcome.report.rows_written, 5);
    assert_eq!(outcome.sources.len(), 1);
    assert_eq!(outcome.sources[0].inventory.rows_written, 3);
    assert_eq!(outcome.sources[0].usage.rows_written, 2);

    assert_eq!(count(&store, "SELECT COUNT(*) FROM inventory"), 3);
    assert_eq!(count(&store, "SELECT COUNT(*) FROM usage"), 2);
    assert_eq!(count(&store, "SELECT COUNT(*) FROM metadata"), 1);

    let inventory = store.inventory_snapshot(outcome.run.execution_date).unwrap();
    assert_eq!(inventory.len(), 3);
    assert!(inventory.iter().all(|r| r.extract_ts == outcome.run.execution_date));

    let entry = store.run(&outcome.run).unwrap().unwrap();
    assert_eq!(entry.status, RunStatus::Succeeded);
    assert_eq!(entry.run.version, config.version);
    assert!(config.db_path().exists());
}

#[test]
fn test_usage_write_failure_rolls_back_usage_and_keeps_inventory() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path(), &["prod_sql"]);
    // The second usage row breaks the stricter table.
    create_strict_usage_table(&config);
    let store = Arc::new(Store::open_for(&config).unwrap());

    // Hold usage extraction until inventory has committed.
    let watched = store.clone();
    let mut connector = ScriptedConnector::default().with_source(
        "prod_sql",
        three_databases(),
        vec![stat("0x01", 10), stat("0x02", 5_000)],
    );
    connector.before_stats = Some(Box::new(move || {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if count(&watched, "SELECT COUNT(*) FROM inventory") == 3 {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }));

    let outcome = pipeline(&config, connector, &store)
        .run(&CancellationToken::new())
        .unwrap();

    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(matches!(
        outcome.error,
        Some(Error::SinkWrite { ref table, .. }) if table == "usage"
    ));
    assert_eq!(count(&store, "SELECT COUNT(*) FROM usage"), 0);
    assert_eq!(count(&store, "SELECT COUNT(*) FROM inventory"), 3);

    let entry = store.run(&outcome.run).unwrap().unwrap();
    assert_eq!(entry.status, RunStatus::Failed);
    assert!(entry.error.unwrap().contains("usage"));
}

/// Usage table that refuses execution counts of 1000 or more.
fn create_strict_usage_table(config: &PipelineConfig) {
    std::fs::create_dir_all(config.db_path().parent().unwrap()).unwrap();
    let conn = duckdb::Connection::open(config.db_path()).unwrap();
    conn.execute_batch(
        "CREATE TABLE usage (sql_handle VARCHAR, creation_time TIMESTAMP, \
         last_execution_time TIMESTAMP, execution_count BIGINT CHECK (execution_count < 1000), \
         total_worker_time BIGINT, total_elapsed_time BIGINT, total_rows BIGINT, \
         extract_ts TIMESTAMP);",
    )
    .unwrap();
}

#[test]
fn test_failure_in_last_chunk_persists_no_usage() {
    let tmp = TempDir::new().unwrap();
    let mut config = config(tmp.path(), &["prod_sql"]);
    config.batch_size = 1;
    create_strict_usage_table(&config);
    let store = Arc::new(Store::open_for(&config).unwrap());

    let outcome = pipeline(
        &config,
        ScriptedConnector::default().with_source(
            "prod_sql",
            three_databases(),
            vec![stat("0x01", 10), stat("0x02", 20), stat("0x03", 5_000)],
        ),
        &store,
    )
    .run(&CancellationToken::new())
    .unwrap();

    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(matches!(
        outcome.error,
        Some(Error::SinkWrite { ref table, .. }) if table == "usage"
    ));
    assert_eq!(count(&store, "SELECT COUNT(*) FROM usage"), 0);
    let audit = store.load_audit(&outcome.run).unwrap();
    assert!(audit.iter().all(|a| a.table_name != "usage"));
}

#[test]
fn test_counter_drop_is_stored_verbatim_and_splits_lifetime() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path(), &["prod_sql"]);
    let store = Arc::new(Store::open_for(&config).unwrap());

    let first = pipeline(
        &config,
        ScriptedConnector::default().with_source("prod_sql", three_databases(), vec![stat("0xABCD", 500)]),
        &store,
    )
    .run(&CancellationToken::new())
    .unwrap();
    assert!(first.succeeded());

    let second = pipeline(
        &config,
        ScriptedConnector::default().with_source("prod_sql", three_databases(), vec![stat("0xABCD", 10)]),
        &store,
    )
    .run(&CancellationToken::new())
    .unwrap();
    assert!(second.succeeded());
    assert_eq!(second.report.counter_regressions, 1);

    let history = store.usage_history("0xABCD", false).unwrap();
    let counts: Vec<i64> = history.iter().map(|r| r.execution_count).collect();
    assert_eq!(counts, vec![500, 10]);

    let lifetimes = store.statement_lifetimes("0xABCD").unwrap();
    assert_eq!(lifetimes.len(), 2);
    assert_eq!(lifetimes[1].deltas()[0].execution_count, 10);

    let audit = store.load_audit(&second.run).unwrap();
    let usage_audit: Vec<_> = audit.iter().filter(|a| a.table_name == "usage").collect();
    assert_eq!(usage_audit[0].counter_regressions, 1);
}

#[test]
fn test_repeated_runs_only_append() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path(), &["prod_sql"]);
    let store = Arc::new(Store::open_for(&config).unwrap());

    let first = pipeline(
        &config,
        ScriptedConnector::default().with_source("prod_sql", three_databases(), two_stats()),
        &store,
    )
    .run(&CancellationToken::new())
    .unwrap();
    let before = store.inventory_snapshot(first.run.execution_date).unwrap();

    let second = pipeline(
        &config,
        ScriptedConnector::default().with_source(
            "prod_sql",
            vec![database(1, "master"), database(9, "reporting")],
            two_stats(),
        ),
        &store,
    )
    .run(&CancellationToken::new())
    .unwrap();

    assert!(second.run.execution_date > first.run.execution_date);
    assert_eq!(store.inventory_snapshot(first.run.execution_date).unwrap(), before);
    assert_eq!(count(&store, "SELECT COUNT(*) FROM inventory"), 5);
    assert_eq!(count(&store, "SELECT COUNT(*) FROM usage"), 4);
}

#[test]
fn test_rerun_after_failure_leaves_failed_rows_untouched() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path(), &["prod_sql"]);
    let store = Arc::new(Store::open_for(&config).unwrap());

    let watched = store.clone();
    let mut broken = ScriptedConnector::default()
        .with_source("prod_sql", three_databases(), two_stats())
        .failing(
            "prod_sql",
            "list_query_stats",
            vec![ConnectorError::Query("permission denied on sys.dm_exec_query_stats".into())],
        );
    broken.before_stats = Some(Box::new(move || {
        let deadline = Instant::now() + Duration::from_secs(10);
        while count(&watched, "SELECT COUNT(*) FROM inventory") < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
    }));

    let failed = pipeline(&config, broken, &store)
        .run(&CancellationToken::new())
        .unwrap();
    assert_eq!(failed.status, RunStatus::Failed);
    assert!(matches!(failed.error, Some(Error::Connection { .. })));
    let failed_rows = store.inventory_snapshot(failed.run.execution_date).unwrap();
    assert_eq!(failed_rows.len(), 3);

    let retried = pipeline(
        &config,
        ScriptedConnector::default().with_source("prod_sql", three_databases(), two_stats()),
        &store,
    )
    .run(&CancellationToken::new())
    .unwrap();
    assert!(retried.succeeded());
    assert_ne!(retried.run.execution_date, failed.run.execution_date);

    assert_eq!(
        store.inventory_snapshot(failed.run.execution_date).unwrap(),
        failed_rows
    );
    assert_eq!(
        store.run(&failed.run).unwrap().unwrap().status,
        RunStatus::Failed
    );

    let committed = store.committed_counts(&config.pipeline_name).unwrap();
    assert_eq!(committed.runs, 1);
    assert_eq!(committed.inventory, 3);
    assert_eq!(committed.usage, 2);
    assert_eq!(store.committed_inventory(&config.pipeline_name).unwrap().len(), 3);
}

#[test]
fn test_stale_run_is_failed_before_new_run() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path(), &["prod_sql"]);
    let store = Arc::new(Store::open_for(&config).unwrap());

    // A run left RUNNING by a crashed process.
    let ledger = RunLedger::new(&*store, &config.pipeline_name, "0.0.1", config.run_timeout());
    let orphan = ledger.open().unwrap().entry.run;
    ledger.start(&orphan).unwrap();
    store
        .connection()
        .unwrap()
        .execute(
            "UPDATE run_ledger SET heartbeat_at = TIMESTAMP '2000-01-01 00:00:00'",
            [],
        )
        .unwrap();

    let outcome = pipeline(
        &config,
        ScriptedConnector::default().with_source("prod_sql", three_databases(), two_stats()),
        &store,
    )
    .run(&CancellationToken::new())
    .unwrap();

    assert!(outcome.succeeded());
    assert_eq!(outcome.recovered.len(), 1);
    assert_eq!(outcome.recovered[0].run, orphan);

    let orphan_entry = store.run(&orphan).unwrap().unwrap();
    assert_eq!(orphan_entry.status, RunStatus::Failed);
    assert!(orphan_entry.error.unwrap().contains("stale"));
}

#[test]
fn test_second_concurrent_run_is_refused() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path(), &["prod_sql"]);
    let store = Arc::new(Store::open_for(&config).unwrap());

    let mut slow = ScriptedConnector::default().with_source("prod_sql", three_databases(), two_stats());
    slow.stats_delay = Some(Duration::from_millis(500));
    let first = pipeline(&config, slow, &store);

    let handle = thread::spawn(move || first.run(&CancellationToken::new()).unwrap());

    // Wait until the first run is live.
    let deadline = Instant::now() + Duration::from_secs(10);
    while store.active_runs(&config.pipeline_name).unwrap().is_empty() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }

    let second = pipeline(
        &config,
        ScriptedConnector::default().with_source("prod_sql", three_databases(), two_stats()),
        &store,
    )
    .run(&CancellationToken::new());
    assert!(matches!(second, Err(Error::RunInProgress { .. })));

    let first_outcome = handle.join().unwrap();
    assert!(first_outcome.succeeded());
    assert_eq!(count(&store, "SELECT COUNT(*) FROM metadata"), 1);
    assert!(store.active_runs(&config.pipeline_name).unwrap().is_empty());
}

#[test]
fn test_transient_connector_failures_are_retried() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path(), &["prod_sql"]);
    let store = Arc::new(Store::open_for(&config).unwrap());

    let flaky = ScriptedConnector::default()
        .with_source("prod_sql", three_databases(), two_stats())
        .failing(
            "prod_sql",
            "list_databases",
            vec![
                ConnectorError::Unreachable("connection refused".into()),
                ConnectorError::Timeout(Duration::from_secs(30)),
            ],
        );

    let outcome = pipeline(&config, flaky, &store)
        .run(&CancellationToken::new())
        .unwrap();
    assert!(outcome.succeeded(), "{:?}", outcome.error);
    assert_eq!(count(&store, "SELECT COUNT(*) FROM inventory"), 3);
}

#[test]
fn test_exhausted_retries_fail_the_run() {
    let tmp = TempDir::new().unwrap();
    let mut config = config(tmp.path(), &["prod_sql"]);
    config.retry_limit = 2;
    let store = Arc::new(Store::open_for(&config).unwrap());

    let down = ScriptedConnector::default()
        .with_source("prod_sql", three_databases(), two_stats())
        .failing(
            "prod_sql",
            "list_databases",
            (0..3)
                .map(|_| ConnectorError::Unreachable("host not found".into()))
                .collect(),
        );

    let outcome = pipeline(&config, down, &store)
        .run(&CancellationToken::new())
        .unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);
    match outcome.error {
        Some(Error::Connection { source_name, message }) => {
            assert_eq!(source_name, "prod_sql");
            assert!(message.contains("after 2 retries"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn test_connector_timeout_fails_the_run() {
    let tmp = TempDir::new().unwrap();
    let mut config = config(tmp.path(), &["prod_sql"]);
    config.connector_timeout_secs = 1;
    config.retry_limit = 0;
    let store = Arc::new(Store::open_for(&config).unwrap());

    let mut hung = ScriptedConnector::default().with_source("prod_sql", three_databases(), two_stats());
    hung.stats_delay = Some(Duration::from_secs(3));

    let outcome = pipeline(&config, hung, &store)
        .run(&CancellationToken::new())
        .unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);
    match outcome.error {
        Some(Error::Connection { message, .. }) => assert!(message.contains("timed out")),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(count(&store, "SELECT COUNT(*) FROM usage"), 0);
}

#[test]
fn test_cancelled_run_is_failed_without_rows() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path(), &["prod_sql"]);
    let store = Arc::new(Store::open_for(&config).unwrap());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = pipeline(
        &config,
        ScriptedConnector::default().with_source("prod_sql", three_databases(), two_stats()),
        &store,
    )
    .run(&cancel)
    .unwrap();

    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(matches!(outcome.error, Some(Error::Cancelled)));
    assert_eq!(count(&store, "SELECT COUNT(*) FROM inventory"), 0);
    assert_eq!(store.run(&outcome.run).unwrap().unwrap().status, RunStatus::Failed);
}

#[test]
fn test_cancel_mid_run_keeps_committed_inventory() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path(), &["prod_sql"]);
    let store = Arc::new(Store::open_for(&config).unwrap());
    let cancel = CancellationToken::new();

    let watched = store.clone();
    let trigger = cancel.clone();
    let mut connector = ScriptedConnector::default().with_source("prod_sql", three_databases(), two_stats());
    connector.before_stats = Some(Box::new(move || {
        let deadline = Instant::now() + Duration::from_secs(10);
        while count(&watched, "SELECT COUNT(*) FROM inventory") < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        trigger.cancel();
    }));

    let outcome = pipeline(&config, connector, &store).run(&cancel).unwrap();

    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(matches!(outcome.error, Some(Error::Cancelled)));
    assert_eq!(count(&store, "SELECT COUNT(*) FROM inventory"), 3);
    assert_eq!(count(&store, "SELECT COUNT(*) FROM usage"), 0);
}

#[test]
fn test_multiple_sources_share_one_run() {
    let tmp = TempDir::new().unwrap();
    let mut config = config(tmp.path(), &["east", "west", "north"]);
    config.max_workers = 2;
    let store = Arc::new(Store::open_for(&config).unwrap());

    let connector = ScriptedConnector::default()
        .with_source("east", vec![database(1, "a"), database(2, "b")], vec![stat("0xE1", 1)])
        .with_source("west", vec![database(3, "c")], vec![stat("0xF1", 2), stat("0xF2", 3)])
        .with_source("north", vec![database(4, "d")], Vec::new());

    let outcome = pipeline(&config, connector, &store)
        .run(&CancellationToken::new())
        .unwrap();

    assert!(outcome.succeeded(), "{:?}", outcome.error);
    let names: Vec<&str> = outcome.sources.iter().map(|s| s.source_name.as_str()).collect();
    assert_eq!(names, vec!["east", "west", "north"]);
    assert_eq!(outcome.report.rows_written, 7);
    assert_eq!(count(&store, "SELECT COUNT(*) FROM metadata"), 1);

    let audit = store.load_audit(&outcome.run).unwrap();
    let west_usage: i64 = audit
        .iter()
        .filter(|a| a.source_name == "west" && a.table_name == "usage")
        .map(|a| a.rows_written)
        .sum();
    assert_eq!(west_usage, 2);
}

#[test]
fn test_watermark_passed_to_incremental_sources_only() {
    let tmp = TempDir::new().unwrap();
    let mut config = config(tmp.path(), &["incremental_src"]);
    let mut full = SourceConfig::new("full_src", SourceKind::SqlServer);
    full.incremental = false;
    config = config.with_source(full);
    let store = Arc::new(Store::open_for(&config).unwrap());

    let connector = || {
        ScriptedConnector::default()
            .with_source("incremental_src", three_databases(), two_stats())
            .with_source("full_src", three_databases(), two_stats())
    };

    let first_connector = Arc::new(connector());
    let first = dbprofile::Pipeline::new(config.clone(), first_connector.clone(), store.clone())
        .run(&CancellationToken::new())
        .unwrap();
    assert!(first.succeeded());
    assert!(first_connector
        .seen_since
        .lock()
        .unwrap()
        .iter()
        .all(|(_, since)| since.is_none()));

    let second_connector = Arc::new(connector());
    let second = dbprofile::Pipeline::new(config.clone(), second_connector.clone(), store.clone())
        .run(&CancellationToken::new())
        .unwrap();
    assert!(second.succeeded());

    let seen: HashMap<String, Option<DateTime<Utc>>> = second_connector
        .seen_since
        .lock()
        .unwrap()
        .iter()
        .cloned()
        .collect();
    assert_eq!(seen["incremental_src"], Some(first.run.execution_date));
    assert_eq!(seen["full_src"], None);
}

#[test]
fn test_source_added_later_gets_full_snapshot() {
    let tmp = TempDir::new().unwrap();
    let connector = || {
        Arc::new(
            ScriptedConnector::default()
                .with_source("east", three_databases(), two_stats())
                .with_source("added", three_databases(), two_stats()),
        )
    };
    let store = Arc::new(Store::open_for(&config(tmp.path(), &["east"])).unwrap());

    let first = dbprofile::Pipeline::new(config(tmp.path(), &["east"]), connector(), store.clone())
        .run(&CancellationToken::new())
        .unwrap();
    assert!(first.succeeded());

    let second_connector = connector();
    let second = dbprofile::Pipeline::new(
        config(tmp.path(), &["east", "added"]),
        second_connector.clone(),
        store.clone(),
    )
    .run(&CancellationToken::new())
    .unwrap();
    assert!(second.succeeded(), "{:?}", second.error);

    let seen: HashMap<String, Option<DateTime<Utc>>> = second_connector
        .seen_since
        .lock()
        .unwrap()
        .iter()
        .cloned()
        .collect();
    assert_eq!(seen["east"], Some(first.run.execution_date));
    assert_eq!(seen["added"], None);
}

#[test]
fn test_malformed_records_are_rejected_and_counted() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path(), &["prod_sql"]);
    let store = Arc::new(Store::open_for(&config).unwrap());

    let mut databases = three_databases();
    databases.push(
        RawRow::new()
            .with("database_id", 8)
            .with("name", "broken")
            .with("create_date", "yesterday"),
    );
    let mut stats = two_stats();
    stats.push(stat("0x02000000AA", 1));

    let outcome = pipeline(
        &config,
        ScriptedConnector::default().with_source("prod_sql", databases, stats),
        &store,
    )
    .run(&CancellationToken::new())
    .unwrap();

    assert!(outcome.succeeded());
    assert_eq!(outcome.report.rows_written, 5);
    assert_eq!(outcome.report.rows_rejected, 1);
    assert_eq!(outcome.report.duplicates_skipped, 1);
}
