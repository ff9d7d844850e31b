// src/main.rs
// Sandbox tool-execution service.

mod cli;

use anyhow::Result;
use clap::Parser;

use cli::{check_config, run_serve, warmup_status, Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env from ~/.toolhost/.env only — never from CWD, so a malicious
    // working directory can't override API keys.
    if let Some(home) = dirs::home_dir() {
        if let Err(e) = dotenvy::from_path(home.join(".toolhost/.env")) {
            tracing::debug!("no global .env file loaded: {}", e);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        None => run_serve(None, None).await,
        Some(Commands::Serve { config, bind_addr }) => run_serve(config, bind_addr).await,
        Some(Commands::WarmupStatus { config }) => warmup_status(config).await,
        Some(Commands::CheckConfig { config }) => check_config(config).await,
    }
}
