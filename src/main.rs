use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use helm::cli::{Cli, Command};
use helm::config::DaemonConfig;
use helm::daemon::Daemon;
use helm::logging;
use helm::pidfile::PidFile;
use helm::server::startup::{run_server_with_config, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        // No subcommand or explicit `start` both launch the daemon.
        None | Some(Command::Start) => run_daemon().await,

        Some(Command::Status { port, host }) => helm::cli::handle_status(&host, port).await,

        Some(Command::Version) => {
            helm::cli::handle_version();
            Ok(())
        }
    }
}

async fn run_daemon() -> Result<(), Box<dyn std::error::Error>> {
    init_logging_from_env()?;
    let config = DaemonConfig::load()?;

    // Refuses to start when a live daemon already holds the pid file;
    // removed again on drop at the end of this function.
    let pidfile = PidFile::acquire(config.port)?;

    let daemon = Arc::new(Daemon::new(config.clone()));
    log_startup_banner(&daemon, &pidfile);

    let server_config = ServerConfig {
        daemon: Arc::clone(&daemon),
        bind_address: SocketAddr::from(([127, 0, 0, 1], config.port)),
        spawn_background_tasks: true,
    };
    let handle = run_server_with_config(server_config).await?;

    let reason = await_shutdown_trigger().await;
    info!("shutdown signal received ({})", reason);
    handle.shutdown().await;

    drop(pidfile);
    info!("daemon shut down");
    Ok(())
}

/// Initialize logging based on the HELM_DEV environment variable.
fn init_logging_from_env() -> Result<(), Box<dyn std::error::Error>> {
    let log_config = if std::env::var("HELM_DEV")
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
    {
        logging::LogConfig::development()
    } else {
        logging::LogConfig::production()
    };
    logging::init_logging(log_config)?;
    Ok(())
}

fn log_startup_banner(daemon: &Arc<Daemon>, pidfile: &PidFile) {
    info!("Helm daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("Listening on 127.0.0.1:{}", daemon.config().port);
    info!("Pid file: {}", pidfile.path().display());
    info!("Server id: {}", daemon.server_id());
}

/// Wait for either Ctrl+C or SIGTERM (Unix only) and return a label for logging.
#[cfg(unix)]
async fn await_shutdown_trigger() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => "ctrl-c",
                _ = sigterm.recv() => "SIGTERM",
            }
        }
        Err(e) => {
            warn!(
                "failed to install SIGTERM handler: {}; falling back to Ctrl+C only",
                e
            );
            match tokio::signal::ctrl_c().await {
                Ok(()) => "ctrl-c",
                Err(e) => {
                    panic!("failed to install Ctrl+C handler: {}", e);
                }
            }
        }
    }
}

/// On non-Unix platforms, only Ctrl+C is available.
#[cfg(not(unix))]
async fn await_shutdown_trigger() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "ctrl-c",
        Err(e) => {
            panic!("failed to install Ctrl+C handler: {}", e);
        }
    }
}
