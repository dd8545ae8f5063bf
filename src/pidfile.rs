//! PID/lock file handling.
//!
//! On startup the daemon records `{pid, port, protocolVersion, startedAt}`
//! at a well-known path. A live pid recorded at the same protocol version
//! refuses startup; a stale file (dead pid, unreadable contents) is removed
//! and replaced. A live pid recorded at a *different* protocol version is
//! not recognised as a running peer — the file is replaced with a warning.
//! The file is removed when the [`PidFile`] is dropped.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::config::state_dir;
use crate::protocol::{now_ms, PROTOCOL_VERSION};

#[derive(Error, Debug)]
pub enum PidFileError {
    #[error("helm daemon already running (pid {pid}, port {port})")]
    AlreadyRunning { pid: u32, port: u16 },

    #[error("failed to write pid file {path}: {source}")]
    WriteError { path: String, source: io::Error },

    #[error("failed to create state directory {path}: {source}")]
    StateDirError { path: String, source: io::Error },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PidFileContents {
    pid: u32,
    port: u16,
    protocol_version: u32,
    started_at: u64,
}

/// RAII handle to the daemon's pid file. Dropping it removes the file.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

/// Default pid file path: `<state_dir>/helm.pid`.
pub fn default_path() -> PathBuf {
    state_dir().join("helm.pid")
}

impl PidFile {
    /// Acquire the pid file at the default path.
    pub fn acquire(port: u16) -> Result<Self, PidFileError> {
        Self::acquire_at(default_path(), port)
    }

    /// Acquire the pid file at an explicit path.
    pub fn acquire_at(path: PathBuf, port: u16) -> Result<Self, PidFileError> {
        if let Some(existing) = read_contents(&path) {
            if pid_alive(existing.pid) {
                if existing.protocol_version == PROTOCOL_VERSION {
                    return Err(PidFileError::AlreadyRunning {
                        pid: existing.pid,
                        port: existing.port,
                    });
                }
                warn!(
                    pid = existing.pid,
                    recorded_version = existing.protocol_version,
                    our_version = PROTOCOL_VERSION,
                    "pid file names a live process at a different protocol version; replacing"
                );
            }
            let _ = fs::remove_file(&path);
        } else if path.exists() {
            // Unreadable or garbage contents: stale by definition.
            let _ = fs::remove_file(&path);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| PidFileError::StateDirError {
                path: parent.display().to_string(),
                source: e,
            })?;
        }

        let contents = PidFileContents {
            pid: std::process::id(),
            port,
            protocol_version: PROTOCOL_VERSION,
            started_at: now_ms(),
        };
        let serialized =
            serde_json::to_string_pretty(&contents).map_err(|e| PidFileError::WriteError {
                path: path.display().to_string(),
                source: io::Error::other(e),
            })?;
        fs::write(&path, serialized).map_err(|e| PidFileError::WriteError {
            path: path.display().to_string(),
            source: e,
        })?;

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn read_contents(path: &Path) -> Option<PidFileContents> {
    let raw = fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Check whether a pid names a live process.
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // kill(pid, 0): 0 means deliverable; EPERM means alive but not ours.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    // No cheap liveness probe; treat recorded pids as stale so a crashed
    // daemon never wedges startup.
    false
}
