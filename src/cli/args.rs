//! CLI argument definitions using clap
//!
//! Commands:
//! - livesync serve [--config <path>] [--port <port>]
//! - livesync check-config --config <path>

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// livesync - change-data-capture streaming server
#[derive(Parser, Debug)]
#[command(name = "livesync")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the streaming server
    Serve {
        /// Path to configuration file; defaults apply when omitted
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the configured HTTP port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Validate a configuration file and its fixture, then exit
    CheckConfig {
        /// Path to configuration file
        #[arg(long, default_value = "./livesync.json")]
        config: PathBuf,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
