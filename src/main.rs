mod broker;
mod cli;
mod cmd;
mod config;
mod db;
mod errors;
mod logger;
mod matcher;
mod model;
mod paths;
mod proxy;
mod registry;
mod status;
mod time;
mod tmux;
mod validators;
mod workers;

use std::net::TcpListener;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use broker::AppState;
use config::Config;
use db::SessionDatabase;
use errors::AgentboardError;
use registry::SessionRegistry;
use workers::poll::LogPollWorker;
use workers::refresh::RefreshWorker;

#[tokio::main]
async fn main() -> Result<()> {
    logger::init()?;
    let args = cli::Args::parse();
    args.apply_as_env_overrides();

    match run().await {
        Ok(()) => Ok(()),
        Err(err) => {
            error!(error = ?err, "agentboard exited with an error");
            Err(err)
        }
    }
}

async fn run() -> Result<()> {
    let config = Config::from_env()?;
    info!(port = config.port, tmux_session = %config.tmux_session, "agentboard starting");

    tmux::check_prerequisite()?;
    check_port_free(config.port)?;
    tmux::ensure_session(&config.tmux_session)?;

    let db = Arc::new(SessionDatabase::open(&config.db_path)?);
    let registry = Arc::new(SessionRegistry::new());

    {
        let config = config.clone();
        let db = db.clone();
        tokio::task::spawn_blocking(move || workers::resurrect::run(&config, &db)).await?;
    }

    let refresh = RefreshWorker::new(config.clone(), registry.clone());
    refresh.clone().spawn();

    let poll = LogPollWorker::new(config.clone(), registry.clone(), db.clone());
    poll.spawn();

    let state = AppState {
        config: Arc::new(config.clone()),
        registry,
        db,
        refresh,
    };
    let router = broker::build_router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "agentboard listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("agentboard shut down cleanly");
    Ok(())
}

/// Probed synchronously before any async resources are set up, so a held
/// port fails fast with `AgentboardError::PortInUse` rather than surfacing as
/// an opaque bind error later.
fn check_port_free(port: u16) -> Result<(), AgentboardError> {
    match TcpListener::bind(("0.0.0.0", port)) {
        Ok(listener) => {
            drop(listener);
            Ok(())
        }
        Err(_) => Err(AgentboardError::PortInUse(port)),
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal"),
        Err(e) => error!(error = %e, "failed to install ctrl-c handler"),
    }
}
