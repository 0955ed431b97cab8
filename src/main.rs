//! # Main — CLI Entry Point
//!
//! Routes subcommands to the runners in [`cli`]. Handles shared concerns:
//! `.env` loading, logging setup, config loading and service selection.
//!
//! ## Global Options
//!
//! - `--config` / `LOGWATCH_CONFIG`: TOML config file (default `logwatch.toml`).
//! - `--service` / `LOGWATCH_SERVICE`: service id (default: `active_service`).
//! - `--state-dir` / `LOGWATCH_STATE_DIR`: where mute and watch state persist.
//! - `--api-base` / `LOGWATCH_API_BASE`: overrides `vmlog.api_base_path`.

mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "logwatch", about = "Tail service logs and raise threshold alerts")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, env = "LOGWATCH_CONFIG", default_value = "logwatch.toml")]
    config: PathBuf,

    /// Service id to operate on (defaults to active_service, then the first service)
    #[arg(long, env = "LOGWATCH_SERVICE")]
    service: Option<String>,

    /// Directory for persisted mute and watched-task state
    #[arg(long, env = "LOGWATCH_STATE_DIR", default_value = ".logwatch")]
    state_dir: PathBuf,

    /// Log store API base URL, overriding the config file
    #[arg(long, env = "LOGWATCH_API_BASE")]
    api_base: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream live records, raising alerts for watched tasks
    Tail {
        /// Only print records for this task
        #[arg(long)]
        task: Option<String>,
        /// Display threshold (e.g. WARN shows ERROR and WARN)
        #[arg(long)]
        level: Option<String>,
        /// Stop after this many seconds (runs until Ctrl-C otherwise)
        #[arg(long)]
        duration: Option<u64>,
        /// Print Prometheus metrics on exit
        #[arg(long)]
        metrics: bool,
    },
    /// Fetch one page of history
    Query {
        /// Restrict to one task
        #[arg(long)]
        task: Option<String>,
        /// Page size (defaults to logs_per_page)
        #[arg(long)]
        limit: Option<usize>,
        /// Cursor printed by a previous query
        #[arg(long)]
        cursor: Option<String>,
        /// Display threshold
        #[arg(long)]
        level: Option<String>,
        /// Print the page as JSON
        #[arg(long)]
        json: bool,
    },
    /// List task names seen in the query window
    Tasks,
    /// Mute alerts: minutes > 0, 0 to unmute, -1 for permanent
    Mute {
        #[arg(allow_negative_numbers = true)]
        minutes: i64,
    },
    /// Show the current mute state
    MuteStatus,
    /// Toggle alert escalation for a task
    Watch { task: String },
    /// Validate the config file
    CheckConfig,
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    // LOG_FORMAT=json for log shippers, human-readable otherwise
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    }

    let cli = Cli::parse();

    if let Commands::CheckConfig = cli.command {
        return cli::run_check_config(&cli);
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(async {
        match &cli.command {
            Commands::Tail {
                task,
                level,
                duration,
                metrics,
            } => cli::run_tail(&cli, task.as_deref(), level.as_deref(), *duration, *metrics).await,
            Commands::Query {
                task,
                limit,
                cursor,
                level,
                json,
            } => {
                cli::run_query(
                    &cli,
                    task.as_deref(),
                    *limit,
                    cursor.clone(),
                    level.as_deref(),
                    *json,
                )
                .await
            }
            Commands::Tasks => cli::run_tasks(&cli).await,
            Commands::Mute { minutes } => cli::run_mute(&cli, *minutes),
            Commands::MuteStatus => cli::run_mute_status(&cli),
            Commands::Watch { task } => cli::run_watch(&cli, task),
            Commands::CheckConfig => cli::run_check_config(&cli),
        }
    })
}
