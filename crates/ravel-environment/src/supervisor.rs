// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker supervision.
//!
//! The supervisor keeps exactly one worker alive for an environment:
//!
//! - launches the worker and waits for its `ready` message
//! - pings it with `heartbeat` every interval; a ping unanswered within the timeout
//!   gets the worker SIGTERM and a replacement
//! - forwards reload triggers as `reload`
//! - respawns after a crash with exponential backoff, reset once a worker got ready
//! - on shutdown sends SIGINT, waits out the grace period and does not respawn
//!
//! A worker that exits with code 0 on its own was stopped deliberately (control
//! `shutdown`, SIGHUP) and is not respawned either.

use std::sync::Arc;
use std::time::Duration;

use ravel_core::control::{self, ControlMessage};
use tokio::io::AsyncBufReadExt;
use tokio::sync::{Notify, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::launcher::{
    LaunchOptions, Launcher, WorkerExit, WorkerProcess, WorkerSignal, WorkerSignals,
};

/// Timing for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Interval between heartbeat pings.
    pub heartbeat_interval: Duration,
    /// How long a heartbeat may go unanswered.
    pub heartbeat_timeout: Duration,
    /// Delay before the first respawn; doubles per consecutive failure.
    pub respawn_backoff: Duration,
    /// Upper bound for the respawn delay.
    pub max_backoff: Duration,
    /// How long a signalled worker gets before SIGKILL.
    pub shutdown_grace: Duration,
    /// How long a new worker may take to report ready.
    pub ready_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(10),
            respawn_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(10),
            ready_timeout: Duration::from_secs(120),
        }
    }
}

impl From<&Config> for SupervisorConfig {
    fn from(config: &Config) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_timeout: config.heartbeat_timeout,
            respawn_backoff: config.respawn_backoff,
            shutdown_grace: config.shutdown_grace,
            ..Self::default()
        }
    }
}

/// Observable worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// A worker is being launched or has not reported ready yet.
    Starting,
    /// The worker serves `generation`.
    Running {
        /// Generation reported by the worker.
        generation: u64,
    },
    /// Waiting before launch attempt `attempt`.
    Respawning {
        /// Consecutive failures so far.
        attempt: u32,
    },
    /// Supervision has ended.
    Stopped,
}

/// Asks the supervised worker to reload.
///
/// Triggers that arrive while no worker is ready are coalesced and delivered once one
/// is.
#[derive(Debug, Clone)]
pub struct ReloadTrigger(Arc<Notify>);

impl ReloadTrigger {
    /// Request a reload.
    pub fn trigger(&self) {
        self.0.notify_one();
    }
}

enum Outcome {
    /// Supervisor shutdown stopped the worker.
    Shutdown,
    /// The worker exited cleanly by itself.
    Finished,
    /// The worker crashed, hung or never became ready.
    Failed { ready: bool },
}

/// Keeps one worker process alive.
pub struct Supervisor {
    launcher: Arc<dyn Launcher>,
    options: LaunchOptions,
    config: SupervisorConfig,
    shutdown: Arc<Notify>,
    reload: Arc<Notify>,
    state: watch::Sender<WorkerState>,
}

impl Supervisor {
    /// Create a supervisor for workers started by `launcher` with `options`.
    pub fn new(
        launcher: Arc<dyn Launcher>,
        options: LaunchOptions,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            launcher,
            options,
            config,
            shutdown: Arc::new(Notify::new()),
            reload: Arc::new(Notify::new()),
            state: watch::Sender::new(WorkerState::Starting),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Get a handle that forwards reloads to the worker.
    pub fn reload_trigger(&self) -> ReloadTrigger {
        ReloadTrigger(self.reload.clone())
    }

    /// Watch the worker state.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    /// Run the supervision loop until shutdown or a clean worker exit.
    pub async fn run(&self) {
        info!(
            env_id = %self.options.env_id,
            launcher = self.launcher.launcher_type(),
            binary = %self.options.binary.display(),
            heartbeat_interval_secs = self.config.heartbeat_interval.as_secs(),
            "Supervisor started"
        );

        let mut failures: u32 = 0;
        loop {
            self.state.send_replace(WorkerState::Starting);
            let outcome = match self.launcher.launch(&self.options).await {
                Ok(worker) => self.supervise(worker).await,
                Err(e) => {
                    error!(error = %e, "Failed to launch worker");
                    Outcome::Failed { ready: false }
                }
            };

            match outcome {
                Outcome::Shutdown => break,
                Outcome::Finished => {
                    info!("Worker finished on its own, not respawning");
                    break;
                }
                Outcome::Failed { ready } => {
                    failures = if ready { 1 } else { failures.saturating_add(1) };
                }
            }

            let delay = self.backoff(failures);
            self.state
                .send_replace(WorkerState::Respawning { attempt: failures });
            warn!(
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "Respawning worker"
            );

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state.send_replace(WorkerState::Stopped);
        info!("Supervisor stopped");
    }

    fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.saturating_sub(1).min(16);
        self.config
            .respawn_backoff
            .saturating_mul(factor)
            .min(self.config.max_backoff)
    }

    async fn supervise(&self, worker: WorkerProcess) -> Outcome {
        let WorkerProcess {
            handle,
            mut stdin,
            stdout,
            mut exit,
            signals,
        } = worker;
        let pid = handle.pid;
        let mut lines = stdout.lines();

        let mut ready = false;
        let mut heartbeat_deadline: Option<Instant> = None;
        let ready_deadline = Instant::now() + self.config.ready_timeout;
        let mut ticker = tokio::time::interval_at(
            Instant::now() + self.config.heartbeat_interval,
            self.config.heartbeat_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = if ready {
                heartbeat_deadline
            } else {
                Some(ready_deadline)
            };
            let wake = deadline.unwrap_or(ready_deadline);

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!(pid = ?pid, "Stopping worker");
                    let interrupt = Some(WorkerSignal::Interrupt);
                    let status = self.reap(&mut exit, signals.as_ref(), interrupt).await;
                    info!(pid = ?pid, exit = %status, "Worker stopped");
                    return Outcome::Shutdown;
                }

                status = &mut exit => {
                    return self.exited(pid, status.unwrap_or_default(), ready);
                }

                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        self.on_reply(pid, &line, &mut ready, &mut heartbeat_deadline)
                    }
                    Ok(None) | Err(_) => {
                        debug!(pid = ?pid, "Worker closed its control stream");
                        let status = self.reap(&mut exit, signals.as_ref(), None).await;
                        return self.exited(pid, status, ready);
                    }
                },

                _ = tokio::time::sleep_until(wake), if deadline.is_some() => {
                    if ready {
                        error!(
                            pid = ?pid,
                            timeout_secs = self.config.heartbeat_timeout.as_secs(),
                            "Worker missed a heartbeat, terminating"
                        );
                    } else {
                        error!(
                            pid = ?pid,
                            timeout_secs = self.config.ready_timeout.as_secs(),
                            "Worker did not become ready, terminating"
                        );
                    }
                    let terminate = Some(WorkerSignal::Terminate);
                    let status = self.reap(&mut exit, signals.as_ref(), terminate).await;
                    debug!(pid = ?pid, exit = %status, "Unresponsive worker reaped");
                    return Outcome::Failed { ready };
                }

                _ = ticker.tick(), if ready && heartbeat_deadline.is_none() => {
                    if let Err(e) = control::send(&mut stdin, ControlMessage::Heartbeat).await {
                        debug!(pid = ?pid, error = %e, "Failed to send heartbeat");
                    }
                    heartbeat_deadline = Some(Instant::now() + self.config.heartbeat_timeout);
                }

                _ = self.reload.notified(), if ready => {
                    info!(pid = ?pid, "Forwarding reload to worker");
                    if let Err(e) = control::send(&mut stdin, ControlMessage::Reload).await {
                        warn!(pid = ?pid, error = %e, "Failed to forward reload");
                    }
                }
            }
        }
    }

    fn on_reply(
        &self,
        pid: Option<u32>,
        line: &str,
        ready: &mut bool,
        heartbeat_deadline: &mut Option<Instant>,
    ) {
        match ControlMessage::parse(line) {
            Ok(ControlMessage::Heartbeat) => {
                *heartbeat_deadline = None;
            }
            Ok(ControlMessage::Ready { generation }) => {
                if *ready {
                    info!(pid = ?pid, generation, "Worker reloaded");
                } else {
                    info!(pid = ?pid, generation, "Worker ready");
                }
                *ready = true;
                *heartbeat_deadline = None;
                self.state.send_replace(WorkerState::Running { generation });
            }
            Ok(other) => {
                warn!(pid = ?pid, control = ?other, "Unexpected control message from worker")
            }
            Err(_) => warn!(pid = ?pid, line = %line, "Ignoring malformed worker output"),
        }
    }

    fn exited(&self, pid: Option<u32>, status: WorkerExit, ready: bool) -> Outcome {
        if status.is_clean() {
            info!(pid = ?pid, "Worker exited cleanly");
            Outcome::Finished
        } else {
            warn!(pid = ?pid, exit = %status, "Worker exited unexpectedly");
            Outcome::Failed { ready }
        }
    }

    /// Optionally signal the worker, then wait for it to exit. A worker still alive
    /// after the grace period is killed.
    async fn reap(
        &self,
        exit: &mut oneshot::Receiver<WorkerExit>,
        signals: &dyn WorkerSignals,
        signal: Option<WorkerSignal>,
    ) -> WorkerExit {
        if let Some(signal) = signal
            && let Err(e) = signals.send(signal)
        {
            warn!(error = %e, "Failed to signal worker");
        }

        match tokio::time::timeout(self.config.shutdown_grace, &mut *exit).await {
            Ok(status) => status.unwrap_or_default(),
            Err(_) => {
                warn!(
                    grace_secs = self.config.shutdown_grace.as_secs(),
                    "Worker outlived the grace period, killing"
                );
                if let Err(e) = signals.send(WorkerSignal::Kill) {
                    error!(error = %e, "Failed to kill worker");
                }
                tokio::time::timeout(self.config.shutdown_grace, exit)
                    .await
                    .ok()
                    .and_then(|status| status.ok())
                    .unwrap_or_default()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::{MockBehavior, MockLauncher};

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            heartbeat_interval: Duration::from_millis(20),
            heartbeat_timeout: Duration::from_millis(60),
            respawn_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            shutdown_grace: Duration::from_millis(200),
            ready_timeout: Duration::from_millis(200),
        }
    }

    fn start(launcher: &MockLauncher) -> (Arc<Supervisor>, tokio::task::JoinHandle<()>) {
        let supervisor = Arc::new(Supervisor::new(
            Arc::new(launcher.clone()),
            LaunchOptions::new("env-1", "mock"),
            fast_config(),
        ));
        let task = tokio::spawn({
            let supervisor = supervisor.clone();
            async move { supervisor.run().await }
        });
        (supervisor, task)
    }

    async fn wait_state(
        supervisor: &Supervisor,
        predicate: impl FnMut(&WorkerState) -> bool,
    ) -> WorkerState {
        let mut rx = supervisor.subscribe();
        let state = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(predicate))
            .await
            .expect("state not reached")
            .unwrap();
        *state
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_ready_reload_and_shutdown() {
        let launcher = MockLauncher::new();
        let (supervisor, task) = start(&launcher);

        wait_state(&supervisor, |s| *s == WorkerState::Running { generation: 1 }).await;

        supervisor.reload_trigger().trigger();
        wait_state(&supervisor, |s| *s == WorkerState::Running { generation: 2 }).await;
        assert_eq!(launcher.reloads(), 1);

        // Heartbeats are answered, so the worker survives several intervals
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(launcher.launches(), 1);

        supervisor.shutdown_handle().notify_one();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

        assert_eq!(*supervisor.subscribe().borrow(), WorkerState::Stopped);
        assert_eq!(launcher.signals(), vec![WorkerSignal::Interrupt]);
        assert_eq!(launcher.launches(), 1);
    }

    #[tokio::test]
    async fn test_crash_respawns() {
        let launcher = MockLauncher::scripted([MockBehavior::Crash]);
        let (supervisor, task) = start(&launcher);

        eventually(|| launcher.launches() == 2).await;
        wait_state(&supervisor, |s| matches!(s, WorkerState::Running { .. })).await;
        assert!(launcher.signals().is_empty());

        supervisor.shutdown_handle().notify_one();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_missed_heartbeat_terminates_and_respawns() {
        let launcher = MockLauncher::scripted([MockBehavior::Hang]);
        let (supervisor, task) = start(&launcher);

        eventually(|| launcher.launches() == 2).await;
        assert_eq!(launcher.signals(), vec![WorkerSignal::Terminate]);
        wait_state(&supervisor, |s| matches!(s, WorkerState::Running { .. })).await;

        supervisor.shutdown_handle().notify_one();
        task.await.unwrap();
        assert_eq!(
            launcher.signals(),
            vec![WorkerSignal::Terminate, WorkerSignal::Interrupt]
        );
    }

    #[tokio::test]
    async fn test_launch_failure_and_ready_timeout() {
        let launcher =
            MockLauncher::scripted([MockBehavior::FailToStart, MockBehavior::NeverReady]);
        let (supervisor, task) = start(&launcher);

        wait_state(&supervisor, |s| *s == WorkerState::Running { generation: 1 }).await;
        assert_eq!(launcher.launches(), 3);
        assert_eq!(launcher.signals(), vec![WorkerSignal::Terminate]);

        supervisor.shutdown_handle().notify_one();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_exit_is_not_respawned() {
        let launcher = MockLauncher::scripted([MockBehavior::Exit]);
        let (supervisor, task) = start(&launcher);

        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(launcher.launches(), 1);
        assert_eq!(*supervisor.subscribe().borrow(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_reload_before_ready_is_delivered() {
        let launcher = MockLauncher::new();
        let supervisor = Supervisor::new(
            Arc::new(launcher.clone()),
            LaunchOptions::new("env-1", "mock"),
            fast_config(),
        );
        supervisor.reload_trigger().trigger();
        supervisor.reload_trigger().trigger();
        let supervisor = Arc::new(supervisor);
        let task = tokio::spawn({
            let supervisor = supervisor.clone();
            async move { supervisor.run().await }
        });

        wait_state(&supervisor, |s| *s == WorkerState::Running { generation: 2 }).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Coalesced into one
        assert_eq!(launcher.reloads(), 1);

        supervisor.shutdown_handle().notify_one();
        task.await.unwrap();
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let supervisor = Supervisor::new(
            Arc::new(MockLauncher::new()),
            LaunchOptions::new("env-1", "mock"),
            fast_config(),
        );
        assert_eq!(supervisor.backoff(1), Duration::from_millis(10));
        assert_eq!(supervisor.backoff(2), Duration::from_millis(20));
        assert_eq!(supervisor.backoff(3), Duration::from_millis(40));
        assert_eq!(supervisor.backoff(4), Duration::from_millis(50));
        assert_eq!(supervisor.backoff(u32::MAX), Duration::from_millis(50));
    }

    #[test]
    fn test_config_from_env_config() {
        let config = Config {
            env_id: "env-1".to_string(),
            worker_binary: "ravel-worker".into(),
            redis_url: None,
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(2),
            respawn_backoff: Duration::from_millis(300),
            shutdown_grace: Duration::from_secs(4),
        };
        let supervisor_config = SupervisorConfig::from(&config);
        assert_eq!(supervisor_config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(supervisor_config.respawn_backoff, Duration::from_millis(300));
        assert_eq!(supervisor_config.max_backoff, Duration::from_secs(60));
    }
}
