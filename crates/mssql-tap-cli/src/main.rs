//! mssql-tap CLI - resumable MSSQL replication to a line-delimited record stream.

use clap::{Parser, Subcommand};
use mssql_tap::{
    Catalog, Config, FileStateStore, JsonLinesSink, Orchestrator, RecordEmitter, State,
    StateStore, TapError,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};

#[derive(Parser)]
#[command(name = "mssql-tap")]
#[command(about = "Resumable MSSQL replication to a line-delimited record stream")]
#[command(version)]
struct Cli {
    /// Path to YAML configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log format: text or json
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Log verbosity: debug, info, warn, error
    #[arg(long, default_value = "info")]
    verbosity: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover databases, tables and views and print the catalog
    Discover {
        /// Write the catalog to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Sync the selected streams of a catalog
    Sync {
        /// Catalog with stream selections
        #[arg(long)]
        catalog: PathBuf,

        /// State to resume from
        #[arg(long)]
        state: Option<PathBuf>,

        /// File that receives a copy of the state at every checkpoint
        #[arg(long)]
        state_output: Option<PathBuf>,
    },

    /// Test the database connection
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("tap_error_message: {}", e.one_line());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> Result<(), TapError> {
    let cli = Cli::parse();

    setup_logging(&cli.verbosity, &cli.log_format);

    let config = Config::load(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    match cli.command {
        Commands::Discover { output } => {
            let orchestrator = Orchestrator::new(config).await?;
            let catalog = orchestrator.discover().await?;
            let json = serde_json::to_string_pretty(&catalog)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)?;
                    info!("Wrote catalog to {:?}", path);
                }
                None => println!("{}", json),
            }
        }

        Commands::Sync {
            catalog,
            state,
            state_output,
        } => {
            let catalog = Catalog::load(&catalog)?;
            let cancel_token = setup_signal_handler();

            let mut orchestrator = Orchestrator::new(config).await?;
            let mut initial = match state {
                Some(ref path) => Some(State::load(path)?),
                None => None,
            };
            if let Some(path) = state_output {
                let store = FileStateStore::new(path);
                // Without --state, pick up where the last run left the file
                if initial.is_none() {
                    initial = store.load().await?;
                }
                orchestrator = orchestrator.with_state_store(Arc::new(store));
            }

            let mut emitter = RecordEmitter::new(Box::new(JsonLinesSink::stdout()));
            let result = orchestrator
                .sync(
                    &catalog,
                    initial.unwrap_or_default(),
                    &mut emitter,
                    cancel_token,
                )
                .await?;
            info!(
                "Run {} finished: {} records from {} streams",
                result.run_id, result.records_emitted, result.streams_succeeded
            );
        }

        Commands::Check => {
            let orchestrator = Orchestrator::new(config).await?;
            orchestrator.check().await?;
            println!("Connection OK");
        }
    }

    Ok(())
}

/// Logs go to stderr; stdout carries the record stream.
/// `RUST_LOG`, when set, takes precedence over `--verbosity`.
fn setup_logging(verbosity: &str, format: &str) {
    let level = match verbosity.to_lowercase().as_str() {
        "debug" => "debug",
        "warn" => "warn",
        "error" => "error",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Setup signal handlers for graceful shutdown.
/// Handles both SIGINT (Ctrl-C) and SIGTERM (orchestrator shutdown).
/// The sync stops at the next batch checkpoint once the token is cancelled.
#[cfg(unix)]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();

    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
    ] {
        let token = cancel_token.clone();
        match signal(kind) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    stream.recv().await;
                    eprintln!("Received {}. Stopping at the next checkpoint...", name);
                    token.cancel();
                });
            }
            Err(e) => tracing::warn!("Failed to install {} handler: {}", name, e),
        }
    }

    cancel_token
}

/// Setup signal handler for Windows (only Ctrl-C)
#[cfg(not(unix))]
fn setup_signal_handler() -> CancellationToken {
    let cancel_token = CancellationToken::new();
    let token = cancel_token.clone();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Received Ctrl-C. Stopping at the next checkpoint...");
            token.cancel();
        }
    });

    cancel_token
}
