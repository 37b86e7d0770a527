// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock launcher for testing.
//!
//! Simulates a worker in-process over in-memory pipes: it reports ready, echoes
//! heartbeats, bumps its generation on reload and exits on shutdown or signals.
//! Each launch follows the next scripted [`MockBehavior`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use ravel_core::control::{self, ControlMessage};
use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};
use tokio::sync::{mpsc, oneshot};

use super::traits::*;

/// What one simulated worker does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    /// Reports ready and answers every control message.
    Healthy,
    /// Reports ready, then exits with code 1.
    Crash,
    /// Reports ready, then stops answering heartbeats.
    Hang,
    /// Never reports ready.
    NeverReady,
    /// Launch itself fails.
    FailToStart,
    /// Reports ready, then exits with code 0 as if told to stop out of band.
    Exit,
}

#[derive(Default)]
struct MockState {
    launches: AtomicUsize,
    reloads: AtomicUsize,
    next_pid: AtomicU32,
    signals: Mutex<Vec<WorkerSignal>>,
}

/// Mock launcher for testing.
#[derive(Clone)]
pub struct MockLauncher {
    script: Arc<Mutex<VecDeque<MockBehavior>>>,
    /// Behavior once the script is exhausted
    pub default_behavior: MockBehavior,
    state: Arc<MockState>,
}

impl Default for MockLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockLauncher {
    /// Create a mock launcher whose workers are healthy.
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(VecDeque::new())),
            default_behavior: MockBehavior::Healthy,
            state: Arc::new(MockState::default()),
        }
    }

    /// Create a mock launcher whose first launches follow `script`, then healthy.
    pub fn scripted(script: impl IntoIterator<Item = MockBehavior>) -> Self {
        let launcher = Self::new();
        if let Ok(mut queue) = launcher.script.lock() {
            queue.extend(script);
        }
        launcher
    }

    /// Number of launch attempts so far.
    pub fn launches(&self) -> usize {
        self.state.launches.load(Ordering::SeqCst)
    }

    /// Number of reloads handled across all workers.
    pub fn reloads(&self) -> usize {
        self.state.reloads.load(Ordering::SeqCst)
    }

    /// Signals delivered so far, in order.
    pub fn signals(&self) -> Vec<WorkerSignal> {
        self.state.signals.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn next_behavior(&self) -> MockBehavior {
        self.script
            .lock()
            .ok()
            .and_then(|mut queue| queue.pop_front())
            .unwrap_or(self.default_behavior)
    }
}

#[async_trait]
impl Launcher for MockLauncher {
    fn launcher_type(&self) -> &'static str {
        "mock"
    }

    async fn launch(&self, options: &LaunchOptions) -> Result<WorkerProcess> {
        self.state.launches.fetch_add(1, Ordering::SeqCst);
        let behavior = self.next_behavior();
        if behavior == MockBehavior::FailToStart {
            return Err(LauncherError::StartFailed(format!(
                "mock launch of {} refused",
                options.env_id
            )));
        }

        let (stdin, worker_in) = tokio::io::duplex(4096);
        let (worker_out, stdout) = tokio::io::duplex(4096);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(simulate(
            behavior,
            self.state.clone(),
            worker_in,
            worker_out,
            signal_rx,
            exit_tx,
        ));

        let pid = 10_000 + self.state.next_pid.fetch_add(1, Ordering::SeqCst);
        Ok(WorkerProcess {
            handle: WorkerHandle {
                handle_id: format!("mock-{}", pid),
                pid: Some(pid),
                started_at: Utc::now(),
            },
            stdin: Box::new(stdin),
            stdout: Box::new(BufReader::new(stdout)),
            exit: exit_rx,
            signals: Arc::new(MockSignals {
                tx: signal_tx,
                state: self.state.clone(),
            }),
        })
    }
}

struct MockSignals {
    tx: mpsc::UnboundedSender<WorkerSignal>,
    state: Arc<MockState>,
}

impl WorkerSignals for MockSignals {
    fn send(&self, signal: WorkerSignal) -> Result<()> {
        if let Ok(mut signals) = self.state.signals.lock() {
            signals.push(signal);
        }
        // A finished worker has dropped its receiver
        let _ = self.tx.send(signal);
        Ok(())
    }
}

async fn simulate(
    behavior: MockBehavior,
    state: Arc<MockState>,
    stdin: DuplexStream,
    mut stdout: DuplexStream,
    mut signals: mpsc::UnboundedReceiver<WorkerSignal>,
    exit: oneshot::Sender<WorkerExit>,
) {
    let mut generation = 1;
    if behavior != MockBehavior::NeverReady {
        let _ =
            control::send(&mut stdout, ControlMessage::Ready { generation }).await;
    }
    match behavior {
        MockBehavior::Crash => {
            let _ = exit.send(WorkerExit::code(1));
            return;
        }
        MockBehavior::Exit => {
            let _ = exit.send(WorkerExit::code(0));
            return;
        }
        _ => {}
    }

    let mut lines = BufReader::new(stdin).lines();
    let status = loop {
        tokio::select! {
            signal = signals.recv() => match signal {
                Some(WorkerSignal::Interrupt) => break WorkerExit::code(0),
                Some(WorkerSignal::Terminate) => break WorkerExit::signaled(15),
                Some(WorkerSignal::Kill) => break WorkerExit::signaled(9),
                None => break WorkerExit::signaled(9),
            },
            line = lines.next_line() => {
                let Ok(Some(line)) = line else {
                    break WorkerExit::code(0);
                };
                let Ok(message) = ControlMessage::parse(&line) else {
                    continue;
                };
                let responsive = behavior == MockBehavior::Healthy;
                match message {
                    ControlMessage::Heartbeat if responsive => {
                        let _ = control::send(&mut stdout, ControlMessage::Heartbeat).await;
                    }
                    ControlMessage::Reload if responsive => {
                        state.reloads.fetch_add(1, Ordering::SeqCst);
                        generation += 1;
                        let ready = ControlMessage::Ready { generation };
                        let _ = control::send(&mut stdout, ready).await;
                    }
                    ControlMessage::Shutdown => break WorkerExit::code(0),
                    _ => {}
                }
            }
        }
    };
    let _ = exit.send(status);
}
