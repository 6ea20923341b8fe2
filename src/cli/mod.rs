//! CLI module
//!
//! - serve: run the streaming server
//! - check-config: validate configuration and fixture

mod args;
mod commands;

pub use args::{Cli, Command};
pub use commands::{check_config, run, run_command, serve};
