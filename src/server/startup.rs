//! Testable server startup logic.
//!
//! Provides [`ServerConfig`] and [`ServerHandle`] so integration tests can
//! spin up a real daemon on an ephemeral port, exercise its HTTP and
//! WebSocket endpoints, and shut it down cleanly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::daemon::Daemon;

/// Everything needed to start a daemon listener.
pub struct ServerConfig {
    pub daemon: Arc<Daemon>,
    pub bind_address: SocketAddr,
    /// When `false` (e.g. in unit-style tests) the stale-session sweeper is
    /// **not** spawned.
    pub spawn_background_tasks: bool,
}

impl ServerConfig {
    /// Minimal config suitable for integration tests: binds to
    /// `127.0.0.1:0` (OS-assigned port) with the sweeper disabled.
    pub fn for_testing(daemon: Arc<Daemon>) -> Self {
        ServerConfig {
            daemon,
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            spawn_background_tasks: false,
        }
    }
}

/// Handle to a running server. Returned by [`run_server_with_config`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    daemon: Arc<Daemon>,
    server_task: JoinHandle<Result<(), std::io::Error>>,
}

impl ServerHandle {
    /// The port the server actually bound to (useful when binding to port 0).
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `http://ip:port` base URL for the running server.
    pub fn base_url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// `ws://ip:port/ws` URL for the multiplex channel.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }

    pub fn daemon(&self) -> &Arc<Daemon> {
        &self.daemon
    }

    /// Trigger graceful shutdown: stop background tasks, reject in-flight
    /// requests, close connections, then await the server task.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.daemon.shutdown();

        // Brief grace period for close frames to flush
        tokio::time::sleep(Duration::from_millis(100)).await;

        match tokio::time::timeout(Duration::from_secs(5), self.server_task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => error!("server task returned error: {}", e),
            Ok(Err(e)) => error!("server task panicked: {}", e),
            Err(_) => warn!("server task did not finish within 5s timeout"),
        }
    }
}

/// Spawn the stale-session sweeper. Runs at half the keepalive timeout and
/// stops when the shutdown channel flips.
pub fn spawn_background_tasks(daemon: &Arc<Daemon>, shutdown_rx: &watch::Receiver<bool>) {
    let daemon = Arc::clone(daemon);
    let mut shutdown_rx = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(daemon.config().sweep_interval());
        ticker.tick().await; // immediate first tick
        loop {
            tokio::select! {
                _ = ticker.tick() => daemon.sweep_stale(),
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

/// Start a daemon listener from a fully-assembled [`ServerConfig`].
pub async fn run_server_with_config(
    config: ServerConfig,
) -> Result<ServerHandle, Box<dyn std::error::Error>> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_router = crate::server::http::create_router(config.daemon.clone());
    let ws_router = Router::new()
        .route("/ws", get(crate::server::ws::ws_handler))
        .with_state(config.daemon.clone());
    let app = http_router.merge(ws_router);

    if config.spawn_background_tasks {
        spawn_background_tasks(&config.daemon, &shutdown_rx);
    }

    // Bind TCP listener (supports port 0 for ephemeral port assignment)
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;
    let local_addr = listener.local_addr()?;

    let mut shutdown_watch = shutdown_rx.clone();
    let server_task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                loop {
                    if *shutdown_watch.borrow() {
                        break;
                    }
                    if shutdown_watch.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
    });

    Ok(ServerHandle {
        local_addr,
        shutdown_tx,
        daemon: config.daemon,
        server_task,
    })
}
