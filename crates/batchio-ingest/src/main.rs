//! batchio Ingest - bulk file loader

use anyhow::{Context, Result};
use batchio_common::logging::{init_logging, LogConfig, LogLevel};
use batchio_ingest::config::{
    ArityPolicy, SinkConfig, DEFAULT_HEALTH_CHECK_INTERVAL, DEFAULT_SINK_DELIMITER, DEFAULT_SINK_PORT,
    JSON_ONE_RECORD_PER_LINE_KEY, JSON_RECORD_IDENTIFIER_KEY, WHOLE_FILE_MAX_LEN_KEY,
};
use batchio_ingest::pipeline::{self, IngestJob, DEFAULT_CONCURRENCY};
use batchio_ingest::reader::FramingMode;
use batchio_ingest::resolver::{ColumnTypeResolver, PgColumnTypeResolver};
use batchio_ingest::sink::{PgConnector, SqlType};
use batchio_ingest::census;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "batchio-ingest")]
#[command(author, version, about = "Load many small files into a relational table in bulk")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Total input bytes and the per-unit target size
    Census {
        /// Input files or directories
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Number of logical units to aim for
        #[arg(short = 'n', long, default_value_t = 1)]
        units: i64,
    },

    /// Print the logical units as JSON
    Plan(InputArgs),

    /// Read every unit and count records without writing
    Scan(InputArgs),

    /// Read every unit and insert the records into a table
    Ingest {
        #[command(flatten)]
        input: InputArgs,

        #[command(flatten)]
        sink: SinkArgs,
    },
}

#[derive(Args, Debug)]
struct InputArgs {
    /// Input files or directories
    #[arg(required = true)]
    paths: Vec<PathBuf>,

    /// Number of logical units to aim for
    #[arg(short = 'n', long, default_value_t = 4)]
    units: i64,

    /// Record framing: lines, whole-file or json
    #[arg(short, long, default_value = "lines")]
    mode: FramingMode,

    /// JSON key that marks a record object
    #[arg(long)]
    record_identifier: Option<String>,

    /// JSON input holds one document per line
    #[arg(long)]
    one_record_per_line: bool,

    /// Largest file accepted in whole-file mode, in bytes
    #[arg(long)]
    max_file_len: Option<u64>,

    /// Units processed at once
    #[arg(short = 'j', long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,
}

impl InputArgs {
    fn job(&self) -> IngestJob {
        let mut job = IngestJob::new(self.paths.clone(), self.units, self.mode);
        job.concurrency = self.concurrency;
        if let Some(ref id) = self.record_identifier {
            job.properties.set(JSON_RECORD_IDENTIFIER_KEY, id);
        }
        if self.one_record_per_line {
            job.properties.set(JSON_ONE_RECORD_PER_LINE_KEY, "true");
        }
        if let Some(max) = self.max_file_len {
            job.properties.set(WHOLE_FILE_MAX_LEN_KEY, max.to_string());
        }
        job
    }
}

#[derive(Args, Debug)]
struct SinkArgs {
    /// Database host
    #[arg(long, env = "BATCHIO_SINK_HOST")]
    host: String,

    /// Database port
    #[arg(long, env = "BATCHIO_SINK_PORT", default_value_t = DEFAULT_SINK_PORT)]
    port: u16,

    /// Database name
    #[arg(long, env = "BATCHIO_SINK_DATABASE")]
    database: String,

    /// Destination table, optionally schema-qualified
    #[arg(long, env = "BATCHIO_SINK_TABLE")]
    table: String,

    /// Database user; the driver default applies when omitted
    #[arg(long, env = "BATCHIO_SINK_USER")]
    user: Option<String>,

    /// Database password
    #[arg(long, env = "BATCHIO_SINK_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Field delimiter inside each record
    #[arg(long, env = "BATCHIO_SINK_DELIMITER", default_value = DEFAULT_SINK_DELIMITER)]
    delimiter: String,

    /// Comma-separated column types (codes or names); looked up from the table when omitted
    #[arg(long, env = "BATCHIO_SINK_TYPES")]
    column_types: Option<String>,

    /// What to do with rows that have the wrong number of fields: skip or fail
    #[arg(long, env = "BATCHIO_SINK_ON_ARITY_MISMATCH", default_value = "skip")]
    on_arity_mismatch: ArityPolicy,

    /// Writes between connection liveness checks, 0 to disable
    #[arg(long, env = "BATCHIO_SINK_HEALTH_CHECK_INTERVAL", default_value_t = DEFAULT_HEALTH_CHECK_INTERVAL)]
    health_check_interval: u64,
}

impl SinkArgs {
    async fn sink_config(&self) -> Result<SinkConfig> {
        let mut config = SinkConfig::new(&self.host, &self.database, &self.table, Vec::new());
        config.user = self.user.clone();
        config.password = self.password.clone();
        config.port = self.port;
        config.delimiter = self.delimiter.clone();
        config.on_arity_mismatch = self.on_arity_mismatch;
        config.health_check_interval = self.health_check_interval;

        config.column_types = match self.column_types.as_deref() {
            Some(raw) => SqlType::parse_list(raw).context("Invalid --column-types")?,
            None => {
                info!(table = %config.table, "Looking up column types");
                PgColumnTypeResolver::new(config.connect_options())
                    .resolve(&config.table)
                    .await
                    .context("Failed to resolve column types")?
            },
        };

        config.validate().context("Invalid sink configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let base = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("batchio-ingest")
        .build();
    let log_config = LogConfig::from_env_with(base.clone()).unwrap_or(base);

    // holds the file writer open until exit
    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Warning: logging disabled: {:#}", e);
            None
        },
    };

    if let Err(e) = execute_command(cli.command).await {
        error!(error = %format!("{:#}", e), "Command failed");
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn execute_command(command: Command) -> Result<()> {
    match command {
        Command::Census { paths, units } => {
            let total = census::total_bytes(&paths).context("Failed to walk input paths")?;
            let target = census::ideal_fragment_size(&paths, units)?;
            println!("total_bytes: {}", total);
            println!("target_unit_bytes: {}", target);
        },

        Command::Plan(input) => {
            let units = pipeline::plan(&input.job())?;
            println!("{}", serde_json::to_string_pretty(&units)?);
        },

        Command::Scan(input) => {
            let report = pipeline::run_scan(&input.job()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        },

        Command::Ingest { input, sink } => {
            let sink_config = sink.sink_config().await?;
            let report = pipeline::run_ingest(&input.job(), PgConnector, sink_config).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        },
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_scan_arguments_become_job_properties() {
        let cli = Cli::try_parse_from([
            "batchio-ingest",
            "scan",
            "./data",
            "-n",
            "3",
            "--mode",
            "json",
            "--record-identifier",
            "id",
        ])
        .unwrap();

        let Command::Scan(input) = cli.command else {
            panic!("expected scan");
        };
        let job = input.job();
        assert_eq!(job.unit_count, 3);
        assert_eq!(job.mode, FramingMode::Json);
        assert_eq!(job.properties.get(JSON_RECORD_IDENTIFIER_KEY), Some("id"));
    }

    #[tokio::test]
    async fn test_explicit_column_types_skip_the_lookup() {
        let cli = Cli::try_parse_from([
            "batchio-ingest",
            "ingest",
            "./data",
            "--host",
            "localhost",
            "--database",
            "warehouse",
            "--table",
            "events",
            "--user",
            "loader",
            "--password",
            "secret",
            "--column-types",
            "4,VARCHAR",
            "--on-arity-mismatch",
            "fail",
        ])
        .unwrap();

        let Command::Ingest { sink, .. } = cli.command else {
            panic!("expected ingest");
        };
        let config = sink.sink_config().await.unwrap();
        assert_eq!(config.column_types, vec![SqlType::Integer, SqlType::Varchar]);
        assert_eq!(config.on_arity_mismatch, ArityPolicy::Fail);
        assert_eq!(config.port, DEFAULT_SINK_PORT);
        assert_eq!(config.user.as_deref(), Some("loader"));
    }

    #[tokio::test]
    async fn test_ingest_without_credentials() {
        let cli = Cli::try_parse_from([
            "batchio-ingest",
            "ingest",
            "./data",
            "--host",
            "localhost",
            "--database",
            "warehouse",
            "--table",
            "events",
            "--column-types",
            "4",
        ])
        .unwrap();

        let Command::Ingest { sink, .. } = cli.command else {
            panic!("expected ingest");
        };
        let config = sink.sink_config().await.unwrap();
        assert_eq!(config.user, None);
        assert_eq!(config.password, None);
    }
}
