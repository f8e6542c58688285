use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use ws_gateway::cli::{execute_command, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let guard = init_logging(cli.verbose, cli.log_file().as_deref())?;

    // Display version information
    info!("ws-gateway v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = execute_command(cli).await {
        error!("{:#}", e);
        // flush buffered log lines before exiting
        drop(guard);
        std::process::exit(1);
    }

    Ok(())
}

/// Initialize logging based on verbosity level; `RUST_LOG` takes precedence
fn init_logging(verbose: u8, log_file: Option<&Path>) -> Result<WorkerGuard> {
    let log_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let (writer, guard) = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stdout()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(log_file.is_none())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(guard)
}
