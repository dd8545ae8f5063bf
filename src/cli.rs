//! CLI subcommand definitions and handlers.
//!
//! Uses clap derive to define the subcommand hierarchy:
//! - `start` (default) -- start the multiplex daemon
//! - `status` -- query a running instance for health info
//! - `version` -- print build/version info

use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::protocol::DEFAULT_PORT;

/// Helm multiplex daemon for browser-driving AI assistants.
#[derive(Parser, Debug)]
#[command(
    name = "helm",
    version = env!("CARGO_PKG_VERSION"),
    about = "Helm — one real browser, shared by many AI assistants"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the daemon (default when no subcommand is given).
    Start,

    /// Query a running instance for health/status information.
    Status {
        /// Port of the running instance (default: from BROWSER_MCP_PORT or 9876).
        #[arg(short, long)]
        port: Option<u16>,

        /// Host of the running instance.
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Print version information.
    Version,
}

fn resolve_port(port: Option<u16>) -> u16 {
    port.or_else(|| {
        std::env::var(crate::config::PORT_ENV_VAR)
            .ok()
            .and_then(|v| v.trim().parse().ok())
    })
    .unwrap_or(DEFAULT_PORT)
}

/// Run the `status` subcommand -- connect to a running daemon's health
/// endpoint and pretty-print the snapshot.
pub async fn handle_status(host: &str, port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let port = resolve_port(port);
    let url = format!("http://{}:{}/health", host, port);

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()?;

    let response = match client.get(&url).send().await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Could not connect to helm at {}:{}", host, port);
            eprintln!("  Error: {}", e);
            eprintln!();
            eprintln!("Is the daemon running? Start it with: helm start");
            std::process::exit(1);
        }
    };

    if !response.status().is_success() {
        eprintln!(
            "Health endpoint returned HTTP {}: {}",
            response.status(),
            response.text().await.unwrap_or_default()
        );
        std::process::exit(1);
    }

    let body: Value = response.json().await?;

    println!("Helm daemon status");
    println!("==================");
    if let Some(version) = body.get("version").and_then(|v| v.as_str()) {
        println!("  Version:   {}", version);
    }
    println!("  Address:   {}:{}", host, port);
    if let Some(status) = body.get("status").and_then(|v| v.as_str()) {
        println!("  Status:    {}", status);
    }
    if let Some(agent) = body.get("agentConnected").and_then(|v| v.as_bool()) {
        println!("  Browser:   {}", if agent { "connected" } else { "not connected" });
    }
    if let Some(uptime) = body.get("uptimeMs").and_then(|v| v.as_u64()) {
        println!("  Uptime:    {}", format_duration_ms(uptime));
    }
    if let Some(sessions) = body.get("sessions").and_then(|v| v.as_array()) {
        println!("  Sessions:  {}", sessions.len());
        for session in sessions {
            let id = session.get("sessionId").and_then(|v| v.as_str()).unwrap_or("?");
            let label = session.get("label").and_then(|v| v.as_str()).unwrap_or("");
            let status = session.get("status").and_then(|v| v.as_str()).unwrap_or("?");
            println!("    {id} [{status}] {label}");
        }
    }

    Ok(())
}

/// Run the `version` subcommand.
pub fn handle_version() {
    println!("helm {}", env!("CARGO_PKG_VERSION"));
    println!("protocol version {}", crate::protocol::PROTOCOL_VERSION);
}

fn format_duration_ms(ms: u64) -> String {
    let total_seconds = ms / 1000;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}
