//! `hdb-compact`: combine HistoryDB bucket fragments under a new key.

use std::io::IsTerminal;

use clap::Parser;
use hdb_compact::config::{Cli, Command};

#[tokio::main]
/// Parse CLI args, initialize logging, and run the requested subcommand.
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    match cli.cmd {
        Command::Combine(args) => run_combine(args).await,
    }
}

/// Configuration problems fail the process; per-record failures only show up in the summary.
async fn run_combine(args: hdb_compact::CombineArgs) -> anyhow::Result<()> {
    let config = args.validate()?;
    let result = hdb_compact::combine(&config).await?;
    tracing::info!("{}", result.summary_line());
    if let Some(path) = &config.summary_json {
        if let Err(err) = hdb_compact::write_summary(path, &result) {
            tracing::error!(error = ?err, "couldn't write summary");
        }
    }
    Ok(())
}
