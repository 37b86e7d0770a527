// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Launcher trait definitions.
//!
//! Defines the abstract interface for starting worker processes.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncWrite};
use tokio::sync::oneshot;

/// Errors from launcher operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LauncherError {
    /// Worker executable was not found.
    #[error("Worker binary not found: {0}")]
    BinaryNotFound(String),

    /// Process failed to start.
    #[error("Worker start failed: {0}")]
    StartFailed(String),

    /// Delivering a signal failed.
    #[error("Failed to send {signal} to worker {pid}: {reason}")]
    Signal {
        /// Signal that was sent.
        signal: WorkerSignal,
        /// Target process id.
        pid: u32,
        /// OS error.
        reason: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for launcher operations.
pub type Result<T> = std::result::Result<T, LauncherError>;

/// Options for launching a worker.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Environment served by the worker (exported as `RAVEL_ENV_ID`)
    pub env_id: String,
    /// Worker executable
    pub binary: PathBuf,
    /// Extra arguments
    pub args: Vec<String>,
    /// Extra environment variables (applied after the inherited ones)
    pub env: HashMap<String, String>,
}

impl LaunchOptions {
    /// Options for `binary` serving `env_id`.
    pub fn new(env_id: impl Into<String>, binary: impl Into<PathBuf>) -> Self {
        Self {
            env_id: env_id.into(),
            binary: binary.into(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

/// Signals the supervisor sends to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerSignal {
    /// Graceful shutdown
    Interrupt,
    /// Unresponsive worker
    Terminate,
    /// Worker ignored the grace period
    Kill,
}

impl fmt::Display for WorkerSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkerSignal::Interrupt => "SIGINT",
            WorkerSignal::Terminate => "SIGTERM",
            WorkerSignal::Kill => "SIGKILL",
        })
    }
}

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerExit {
    /// Exit code, when the process exited normally
    pub code: Option<i32>,
    /// Terminating signal number, when a signal ended the process
    pub signal: Option<i32>,
}

impl WorkerExit {
    /// Normal exit with `code`.
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    /// Ended by signal number `signal`.
    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    /// Exited on its own with code 0.
    pub fn is_clean(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(signal)) => write!(f, "signal {}", signal),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Identifies one launched worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    /// Unique identifier for this launch
    pub handle_id: String,
    /// OS process id, when there is one
    pub pid: Option<u32>,
    /// When the worker was started
    pub started_at: DateTime<Utc>,
}

/// Delivers signals to one worker.
pub trait WorkerSignals: Send + Sync {
    /// Send `signal`. A worker that already exited is not an error.
    fn send(&self, signal: WorkerSignal) -> Result<()>;
}

/// A running worker: its control streams, its exit status and its signal line.
pub struct WorkerProcess {
    /// Launch identity
    pub handle: WorkerHandle,
    /// Control messages to the worker
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    /// Control replies from the worker
    pub stdout: Box<dyn AsyncBufRead + Send + Unpin>,
    /// Resolves once the process has exited
    pub exit: oneshot::Receiver<WorkerExit>,
    /// Signal delivery
    pub signals: Arc<dyn WorkerSignals>,
}

impl fmt::Debug for WorkerProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerProcess")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Trait for worker launchers.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Launcher type identifier for logs.
    fn launcher_type(&self) -> &'static str;

    /// Start a worker. Returns once the process exists; readiness is reported over
    /// its control stream.
    async fn launch(&self, options: &LaunchOptions) -> Result<WorkerProcess>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_exit() {
        assert!(WorkerExit::code(0).is_clean());
        assert!(!WorkerExit::code(1).is_clean());
        assert!(!WorkerExit::signaled(15).is_clean());
        assert_eq!(WorkerExit::code(1).to_string(), "exit code 1");
        assert_eq!(WorkerExit::signaled(9).to_string(), "signal 9");
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(WorkerSignal::Interrupt.to_string(), "SIGINT");
        assert_eq!(WorkerSignal::Terminate.to_string(), "SIGTERM");
        assert_eq!(WorkerSignal::Kill.to_string(), "SIGKILL");
    }

    #[test]
    fn test_launcher_error_display() {
        let err = LauncherError::Signal {
            signal: WorkerSignal::Terminate,
            pid: 42,
            reason: "EPERM".to_string(),
        };
        assert_eq!(err.to_string(), "Failed to send SIGTERM to worker 42: EPERM");
    }
}
