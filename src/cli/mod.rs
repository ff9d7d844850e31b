// CLI entry points.
//
// `Option<Commands>` so a bare invocation falls through to the default
// `serve` subcommand.

pub mod serve;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use serve::{check_config, run_serve, warmup_status};

#[derive(Parser)]
#[command(name = "toolhost")]
#[command(about = "Sandbox tool-execution service")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP server (default)
    Serve {
        /// Config file path (default: ./toolhost.toml)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Bind address, overrides the config file's `server.bind_addr`
        #[arg(long)]
        bind_addr: Option<String>,
    },

    /// Print each configured backend's warmup status without starting the server
    WarmupStatus {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Parse and validate a config file, printing the resolved document
    CheckConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}
