//! Pipeline configuration.
//!
//! Config file resolution order:
//! 1. Explicit path passed to `PipelineConfig::load_from()`
//! 2. DBPROFILE_CONFIG environment variable
//! 3. Default: <config dir>/dbprofile/pipeline.toml

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};

use crate::normalize::SourceKind;
use crate::{Error, Result};

/// Name of the DuckDB file inside the extract folder.
pub const DB_NAME: &str = "profiler_extract.duckdb";

/// Environment variable overriding the config file location.
pub const CONFIG_ENV_VAR: &str = "DBPROFILE_CONFIG";

const MAX_NAME_LEN: usize = 255;

/// One source database instance to profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Unique name of the source within the pipeline.
    pub name: String,

    /// Dialect of the source.
    pub kind: SourceKind,

    /// Offset of naive timestamps reported by the source, e.g. "+02:00".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utc_offset: Option<String>,

    /// Whether to pass the last successful run as a watermark.
    #[serde(default = "default_incremental")]
    pub incremental: bool,

    /// Opaque connection settings handed to the connector.
    #[serde(default)]
    pub connection: BTreeMap<String, String>,
}

fn default_incremental() -> bool {
    true
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            utc_offset: None,
            incremental: default_incremental(),
            connection: BTreeMap::new(),
        }
    }

    pub fn with_utc_offset(mut self, offset: impl Into<String>) -> Self {
        self.utc_offset = Some(offset.into());
        self
    }

    pub fn with_connection(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.connection.insert(key.into(), value.into());
        self
    }

    /// Parsed offset; UTC when not configured.
    pub fn offset(&self) -> Result<FixedOffset> {
        match &self.utc_offset {
            None => Ok(Utc.fix()),
            Some(text) => text.trim().parse::<FixedOffset>().map_err(|e| {
                Error::Config(format!(
                    "Invalid utc_offset '{}' for source '{}': {}",
                    text, self.name, e
                ))
            }),
        }
    }
}

/// Pipeline configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Logical name of the extraction job.
    pub pipeline_name: String,

    /// Version of the pipeline logic, recorded on every run.
    #[serde(default = "default_version")]
    pub version: String,

    /// Directory holding the DuckDB store. A leading `~` is the home
    /// directory.
    #[serde(default = "default_extract_folder")]
    pub extract_folder: PathBuf,

    /// A RUNNING run without a heartbeat for this long is considered crashed.
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,

    /// Retries for retryable connector failures.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Base delay for exponential backoff between retries.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Time allowed for a single connector call.
    #[serde(default = "default_connector_timeout_secs")]
    pub connector_timeout_secs: u64,

    /// Rows per insert pass. A table batch commits in one transaction
    /// whatever its size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Sources extracted in parallel.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_extract_folder() -> PathBuf {
    PathBuf::from("~/.dbprofile/extract")
}

/// Replace a leading `~` component with the home directory.
fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match BaseDirs::new() {
        Some(dirs) if rest.as_os_str().is_empty() => dirs.home_dir().to_path_buf(),
        Some(dirs) => dirs.home_dir().join(rest),
        None => path.to_path_buf(),
    }
}

fn default_run_timeout_secs() -> u64 {
    3_600
}

fn default_retry_limit() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_connector_timeout_secs() -> u64 {
    300
}

fn default_batch_size() -> usize {
    10_000
}

fn default_max_workers() -> usize {
    4
}

impl PipelineConfig {
    /// Create a config with defaults and no sources.
    pub fn new(pipeline_name: impl Into<String>) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            version: default_version(),
            extract_folder: default_extract_folder(),
            run_timeout_secs: default_run_timeout_secs(),
            retry_limit: default_retry_limit(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            connector_timeout_secs: default_connector_timeout_secs(),
            batch_size: default_batch_size(),
            max_workers: default_max_workers(),
            sources: Vec::new(),
        }
    }

    pub fn with_extract_folder(mut self, folder: impl Into<PathBuf>) -> Self {
        self.extract_folder = folder.into();
        self
    }

    pub fn with_source(mut self, source: SourceConfig) -> Self {
        self.sources.push(source);
        self
    }

    /// Load config from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&resolve_config_path()?)
    }

    /// Load and validate config from a TOML file.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::NotFound(format!("config file {}", path.display())));
        }
        let contents = std::fs::read_to_string(path)?;
        let config: PipelineConfig = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config as TOML.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Check names, limits and offsets.
    pub fn validate(&self) -> Result<()> {
        validate_name("pipeline_name", &self.pipeline_name)?;

        if self.version.trim().is_empty() {
            return Err(Error::Config("version cannot be empty".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be at least 1".to_string()));
        }
        if self.max_workers == 0 {
            return Err(Error::Config("max_workers must be at least 1".to_string()));
        }
        if self.run_timeout_secs == 0 {
            return Err(Error::Config("run_timeout_secs must be at least 1".to_string()));
        }
        if self.sources.is_empty() {
            return Err(Error::Config("at least one source must be configured".to_string()));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            validate_name("source name", &source.name)?;
            if !seen.insert(source.name.as_str()) {
                return Err(Error::Config(format!("Duplicate source name: {}", source.name)));
            }
            source.offset()?;
        }
        Ok(())
    }

    // Path and duration helpers

    /// `extract_folder` with `~` expanded.
    pub fn extract_dir(&self) -> PathBuf {
        expand_home(&self.extract_folder)
    }

    /// Path to the DuckDB store.
    pub fn db_path(&self) -> PathBuf {
        self.extract_dir().join(DB_NAME)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn connector_timeout(&self) -> Duration {
        Duration::from_secs(self.connector_timeout_secs)
    }
}

/// Names become part of SQL identifiers and file paths, so they are limited to
/// a letter or underscore followed by letters, digits and underscores.
fn validate_name(what: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Config(format!("{} cannot be empty", what)));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::Config(format!(
            "{} is too long ({} > {} characters)",
            what,
            name.len(),
            MAX_NAME_LEN
        )));
    }
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::Config(format!("Invalid {}: {:?}", what, name)));
    }
    Ok(())
}

/// Resolve the config file path using the standard resolution order.
pub fn resolve_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        return Ok(PathBuf::from(path));
    }

    if let Some(proj_dirs) = ProjectDirs::from("", "", "dbprofile") {
        return Ok(proj_dirs.config_dir().join("pipeline.toml"));
    }

    let home = std::env::var("HOME")
        .map_err(|_| Error::Config("Could not determine home directory".to_string()))?;
    Ok(PathBuf::from(home).join(".config/dbprofile/pipeline.toml"))
}
