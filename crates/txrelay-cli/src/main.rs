//! txrelay CLI - exactly-once transactional relay between Kafka topics.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use txrelay_core::config::LogFormat;
use txrelay_core::{Config, Error, TransactionError};

/// Exit codes for CLI operations.
///
/// Following Unix conventions:
/// - 0: Success
/// - 1-127: Application errors
/// - 128+N: Signal N received (e.g., 130 = SIGINT)
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (invalid config file, missing required fields)
    ConfigError = 1,
    /// Broker error (connection, consumer, producer, retries exhausted)
    BrokerError = 2,
    /// Another instance took over the transactional identity
    Fenced = 3,
    /// Transaction protocol misuse
    TransactionStateError = 4,
    /// General runtime error
    RuntimeError = 10,
    /// Signal interrupt (SIGINT = 2, so 128 + 2 = 130)
    SignalInterrupt = 130,
}

impl ExitCode {
    /// Map an error to an exit code by its position in the core taxonomy.
    fn from_error(error: &anyhow::Error) -> Self {
        if let Some(err) = error.downcast_ref::<Error>() {
            return match err {
                Error::Config(_) => ExitCode::ConfigError,
                Error::Kafka(_) => ExitCode::BrokerError,
                Error::Shutdown => ExitCode::SignalInterrupt,
                Error::Transaction(e) => match e {
                    TransactionError::FencingLost { .. } => ExitCode::Fenced,
                    TransactionError::TransactionState(_) => ExitCode::TransactionStateError,
                    TransactionError::TransientBroker(_)
                    | TransactionError::RetriesExhausted { .. } => ExitCode::BrokerError,
                    _ => ExitCode::RuntimeError,
                },
                Error::Io(_) | Error::Serialization(_) | Error::Metrics(_) => {
                    ExitCode::RuntimeError
                }
            };
        }

        if error.downcast_ref::<toml::de::Error>().is_some() {
            ExitCode::ConfigError
        } else {
            ExitCode::RuntimeError
        }
    }
}

mod commands;
mod server;
mod telemetry;

#[derive(Parser)]
#[command(name = "txrelay")]
#[command(about = "Exactly-once transactional relay between Kafka topics", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay until interrupted
    Run {
        #[command(flatten)]
        overrides: commands::run::Overrides,
    },

    /// Show status and health
    Status {
        /// Health endpoint URL
        #[arg(long, default_value = "http://localhost:8080")]
        url: String,

        /// Metrics endpoint URL (defaults to the health URL on port 9090)
        #[arg(long)]
        metrics_url: Option<String>,
    },

    /// Validate configuration file
    Validate,

    /// Send test records carrying trace context
    Produce {
        #[command(flatten)]
        args: commands::produce::ProduceArgs,
    },

    /// Print records and their headers, linking each to its producer
    Consume {
        #[command(flatten)]
        args: commands::consume::ConsumeArgs,
    },
}

#[tokio::main]
async fn main() {
    let exit_code = run_cli().await;
    std::process::exit(exit_code as i32);
}

/// Main CLI execution logic with proper error handling.
async fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    // Log format comes from the config file when it parses; JSON otherwise
    let monitoring = cli
        .config
        .as_deref()
        .and_then(|path| Config::from_file_unvalidated(path).ok())
        .map(|config| config.monitoring);

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match cli.verbose {
            0 => EnvFilter::new(
                monitoring
                    .as_ref()
                    .map(|m| m.log_level.as_str())
                    .unwrap_or("info"),
            ),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    match monitoring.map(|m| m.log_format).unwrap_or(LogFormat::Json) {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .init();
        }
    }

    match execute_command(cli).await {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

/// Execute the CLI command.
async fn execute_command(cli: Cli) -> Result<()> {
    let verbose = cli.verbose > 0;
    match cli.command {
        Commands::Run { overrides } => {
            let config = load_config(cli.config.as_deref())?;
            commands::run::run(config, overrides).await?;
        }

        Commands::Status { url, metrics_url } => {
            commands::status::run(&url, metrics_url.as_deref()).await?;
        }

        Commands::Validate => {
            let config = load_config(cli.config.as_deref())?;
            config.validate()?;
            println!("Configuration is valid");
            println!(
                "  {} -> {} (group {}, transactional id {})",
                config.kafka.source_topic,
                config.kafka.destination_topic,
                config.kafka.consumer_group,
                config.kafka.transactional_id
            );
        }

        Commands::Produce { args } => {
            let exporter = telemetry::setup_telemetry("txrelay-produce");
            commands::produce::run(args, verbose, exporter.as_ref()).await?;
        }

        Commands::Consume { args } => {
            let exporter = telemetry::setup_telemetry("txrelay-consume");
            commands::consume::run(args, verbose, exporter.as_ref()).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    let path = path.unwrap_or_else(|| Path::new("config.toml"));
    Ok(Config::from_file_unvalidated(path)?)
}
