// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Native process launcher.
//!
//! Runs the worker binary as a child process with piped stdin/stdout for the control
//! channel. Worker logs go to the inherited stderr.

use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::BufReader;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::traits::*;

/// Launches workers as native child processes.
#[derive(Debug, Default, Clone)]
pub struct ProcessLauncher;

impl ProcessLauncher {
    /// Create a new process launcher.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    fn launcher_type(&self) -> &'static str {
        "process"
    }

    async fn launch(&self, options: &LaunchOptions) -> Result<WorkerProcess> {
        let mut command = Command::new(&options.binary);
        command
            .args(&options.args)
            .env("RAVEL_ENV_ID", &options.env_id)
            .envs(&options.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                LauncherError::BinaryNotFound(options.binary.display().to_string())
            }
            _ => LauncherError::StartFailed(e.to_string()),
        })?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LauncherError::StartFailed("stdin was not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LauncherError::StartFailed("stdout was not captured".to_string()))?;

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => exit_from_status(status),
                Err(e) => {
                    warn!(pid = ?pid, error = %e, "Failed to wait for worker");
                    WorkerExit::default()
                }
            };
            debug!(pid = ?pid, exit = %exit, "Worker process exited");
            let _ = exit_tx.send(exit);
        });

        info!(
            binary = %options.binary.display(),
            env_id = %options.env_id,
            pid = ?pid,
            "Worker process started"
        );

        Ok(WorkerProcess {
            handle: WorkerHandle {
                handle_id: pid.map(|p| p.to_string()).unwrap_or_default(),
                pid,
                started_at: Utc::now(),
            },
            stdin: Box::new(stdin),
            stdout: Box::new(BufReader::new(stdout)),
            exit: exit_rx,
            signals: Arc::new(PidSignals { pid }),
        })
    }
}

fn exit_from_status(status: ExitStatus) -> WorkerExit {
    WorkerExit {
        code: status.code(),
        signal: status.signal(),
    }
}

/// Signals a process by pid.
#[derive(Debug)]
struct PidSignals {
    pid: Option<u32>,
}

impl WorkerSignals for PidSignals {
    fn send(&self, worker_signal: WorkerSignal) -> Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        let sig = match worker_signal {
            WorkerSignal::Interrupt => Signal::SIGINT,
            WorkerSignal::Terminate => Signal::SIGTERM,
            WorkerSignal::Kill => Signal::SIGKILL,
        };
        match signal::kill(Pid::from_raw(pid as i32), sig) {
            Ok(()) => Ok(()),
            // Already gone
            Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(LauncherError::Signal {
                signal: worker_signal,
                pid,
                reason: e.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use ravel_core::control::{self, ControlMessage};
    use tokio::io::AsyncBufReadExt;

    use super::*;

    #[tokio::test]
    async fn test_missing_binary() {
        let options = LaunchOptions::new("env-1", "/nonexistent/ravel-worker");
        let err = ProcessLauncher::new().launch(&options).await.unwrap_err();
        assert!(matches!(err, LauncherError::BinaryNotFound(_)));
    }

    /// `cat` echoes control lines, which is enough to exercise the pipes.
    #[tokio::test]
    async fn test_control_pipes_and_signals() {
        let options = LaunchOptions::new("env-1", "cat");
        let mut worker = ProcessLauncher::new().launch(&options).await.unwrap();
        assert!(worker.handle.pid.is_some());

        control::send(&mut worker.stdin, ControlMessage::Heartbeat).await.unwrap();
        let mut lines = worker.stdout.lines();
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(ControlMessage::parse(&line).unwrap(), ControlMessage::Heartbeat);

        worker.signals.send(WorkerSignal::Terminate).unwrap();
        let exit = tokio::time::timeout(Duration::from_secs(5), worker.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, WorkerExit::signaled(15));

        // Signalling a reaped process is not an error
        worker.signals.send(WorkerSignal::Kill).unwrap();
    }

    #[tokio::test]
    async fn test_closed_stdin_exits_cleanly() {
        let options = LaunchOptions::new("env-1", "cat");
        let worker = ProcessLauncher::new().launch(&options).await.unwrap();
        drop(worker.stdin);
        let exit = tokio::time::timeout(Duration::from_secs(5), worker.exit)
            .await
            .unwrap()
            .unwrap();
        assert!(exit.is_clean());
    }
}
