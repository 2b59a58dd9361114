//! netstring-worker: a request worker supervised by a parent process.
//!
//! The worker listens on a Unix socket, serves one netstring-framed request
//! per connection, and lives exactly as long as its parent wants it to:
//! - the first connection is the parent's heartbeat channel
//! - requests are dispatched to applications mounted by path prefix
//! - the worker exits when the heartbeat closes, the parent dies, or on a
//!   termination signal
//!
//! Configuration comes from CLI arguments and a TOML application file.

mod app;
mod config;
mod error;
mod netstring;
mod runtime;
mod server;

use config::Config;
use runtime::SignalFlags;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let config = Config::load();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        socket = %config.socket_path.display(),
        app_config = %config.app_config.display(),
        heartbeat_timeout = ?config.heartbeat_timeout,
        poll_timeout = ?config.poll_timeout,
        "Starting netstring-worker"
    );

    let signals = match SignalFlags::register() {
        Ok(signals) => signals,
        Err(e) => {
            error!(error = %e, "Failed to install signal handlers");
            return ExitCode::FAILURE;
        }
    };

    match server::run(&config, &signals) {
        Ok(exit) => ExitCode::from(exit.code()),
        Err(e) => {
            error!(error = %e, name = e.name(), "Worker failed");
            ExitCode::FAILURE
        }
    }
}
