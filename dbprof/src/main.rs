//! dbprof: run and inspect source database profiling pipelines.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "dbprof")]
#[command(about = "Profile source databases into a DuckDB inventory and usage store")]
#[command(version)]
struct Cli {
    /// Pipeline config file (default: $DBPROFILE_CONFIG, then the user config dir)
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Log debug detail (RUST_LOG takes precedence)
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default pipeline config and create the store
    Init {
        /// Pipeline name for the new config
        #[arg(short = 'n', long = "name", default_value = "assessment")]
        name: String,

        /// Directory for the DuckDB store (default: ~/.dbprofile/extract)
        #[arg(short = 'd', long = "extract-folder")]
        extract_folder: Option<PathBuf>,

        /// Overwrite an existing config
        #[arg(long = "force")]
        force: bool,
    },

    /// Run the pipeline once over every configured source
    #[command(visible_alias = "r")]
    Run {
        /// Directory of exported source results (<dir>/<source>/databases.json, query_stats.json)
        #[arg(short = 'D', long = "dumps", default_value = "dumps")]
        dumps: PathBuf,

        /// Print the run outcome as JSON
        #[arg(long = "json")]
        json: bool,
    },

    /// List recorded runs
    Runs {
        /// Output format: table, json
        #[arg(short = 'f', long = "format", default_value = "table")]
        format: String,

        /// Show runs of every pipeline in the store
        #[arg(short = 'a', long = "all")]
        all: bool,
    },

    /// Mark runs without a recent heartbeat as FAILED
    Recover,

    /// Show the plan-cache lifetimes of one statement
    Lifetimes {
        /// Statement handle (e.g. 0x0200000012AB...)
        sql_handle: String,
    },

    /// Execute a SQL query against the store
    #[command(visible_alias = "q")]
    Sql {
        /// SQL query to execute
        query: String,

        /// Output format: table, json
        #[arg(short = 'f', long = "format", default_value = "table")]
        format: String,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = cli.config.as_deref();
    let result = match cli.command {
        Commands::Init { name, extract_folder, force } => {
            commands::init(config, &name, extract_folder, force)
        }
        Commands::Run { dumps, json } => commands::run(config, &dumps, json),
        Commands::Runs { format, all } => commands::runs(config, &format, all),
        Commands::Recover => commands::recover(config),
        Commands::Lifetimes { sql_handle } => commands::lifetimes(config, &sql_handle),
        Commands::Sql { query, format } => commands::sql(config, &query, &format),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
