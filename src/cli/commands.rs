//! CLI command implementations

use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::LivesyncConfig;
use crate::http_server::{AppState, HttpServer};
use crate::memory::{Fixture, MemoryDatabase};
use crate::observability::init_logging;
use crate::stream::{StreamError, StreamResult};

use super::args::Command;

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub fn run() -> StreamResult<()> {
    let cli = super::args::Cli::parse_args();
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> StreamResult<()> {
    match cmd {
        Command::Serve { config, port } => serve(config.as_deref(), port),
        Command::CheckConfig { config } => check_config(&config),
    }
}

fn load_config(path: Option<&Path>) -> StreamResult<LivesyncConfig> {
    match path {
        Some(path) => LivesyncConfig::load(path),
        None => {
            let config = LivesyncConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

fn open_database(config: &LivesyncConfig) -> StreamResult<MemoryDatabase> {
    match &config.fixture {
        Some(path) => Ok(MemoryDatabase::with_fixture(Fixture::load(path)?)),
        None => Ok(MemoryDatabase::new()),
    }
}

/// Validate a configuration file and load its fixture
pub fn check_config(path: &Path) -> StreamResult<()> {
    let config = LivesyncConfig::load(path)?;
    let db = open_database(&config)?;

    let rows: usize = db.counts().values().sum();
    println!(
        "{}: ok (authz {:?}, {} users, {} fixture rows)",
        path.display(),
        config.authz.mode,
        config.users.len(),
        rows
    );
    Ok(())
}

/// Run the streaming server until Ctrl-C
pub fn serve(config_path: Option<&Path>, port: Option<u16>) -> StreamResult<()> {
    let mut config = load_config(config_path)?;
    if let Some(port) = port {
        config.http.port = port;
    }
    init_logging(&config.log);

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| StreamError::Internal(format!("Failed to create tokio runtime: {}", e)))?;
    rt.block_on(serve_async(config))
}

async fn serve_async(config: LivesyncConfig) -> StreamResult<()> {
    let db = Arc::new(open_database(&config)?);
    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState::from_config(&config, db, shutdown.clone()));
    info!(
        authz = ?config.authz.mode,
        users = config.users.len(),
        keepalive_secs = config.keepalive_secs,
        "starting livesync"
    );

    let supervisor = {
        let supervisor = state.supervisor.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { supervisor.run(token).await })
    };

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested");
            }
            shutdown.cancel();
        });
    }

    let server = HttpServer::new(config.http.clone(), state);
    let result = server.start().await;
    shutdown.cancel();

    match supervisor.await {
        Ok(Err(e)) => error!(error = %e, "supervisor stopped with error"),
        Err(e) => error!(error = %e, "supervisor task failed"),
        Ok(Ok(())) => {}
    }
    result
}
