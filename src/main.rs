//! moat: agent-execution sandbox.
//!
//! Supervises containerized agent runs with brokered access to credentials,
//! networks, and auxiliary services.

use anyhow::Result;
use clap::Parser;

mod cmd;

#[derive(Parser)]
#[command(name = "moat")]
#[command(about = "Sandboxed agent runs with brokered credentials and services")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: cmd::Commands,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = moat::Config::load_or_default(&config_path)?;

    let log_level = if cli.debug || config.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("moat={}", log_level).into()),
        )
        .init();

    if let Err(e) = cmd::execute(cli.command, config).await {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

fn default_config_path() -> String {
    std::env::var("MOAT_HOME")
        .map(|home| format!("{}/config.toml", home))
        .or_else(|_| std::env::var("HOME").map(|home| format!("{}/.moat/config.toml", home)))
        .unwrap_or_else(|_| "moat.toml".to_string())
}
