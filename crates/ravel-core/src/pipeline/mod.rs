// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message processing pipeline.
//!
//! Queue messages and scheduled task runs share one path:
//!
//! 1. The submitter persists a `pending` tracking record, then hands the envelope to a
//!    physical queue picked at random.
//! 2. A listener receives the envelope (delivery is acknowledged at receipt), marks the
//!    record `processing`, resolves and invokes the bound handler, and records the
//!    terminal status.
//!
//! Handler failures are terminal and never retried.

pub mod debug;
mod queue;
mod task;

pub use debug::{DebugEvent, DebugRelayLayer, debug_relay, debug_span, forward_events};
pub use queue::SendOptions;
pub use task::CronTicker;

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

use crate::config::Config;
use crate::descriptor::EnvironmentConfig;
use crate::error::{EngineError, Result};
use crate::handlers::{HandlerContext, HandlerKind, HandlerRegistry};
use crate::registry::AdapterRegistry;
use crate::tracking::{ExecutionLog, TrackingKind, TrackingStatus, TrackingStore};

/// Stored in place of execution log payloads over the size limit.
pub const MESSAGE_TOO_LARGE: &str = "Message too large to store";

/// What travels through the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Submission time in milliseconds since the epoch.
    pub timestamp: i64,
    /// Tracking record id.
    pub tracking_id: String,
    /// Handler input; `null` for task runs.
    #[serde(default)]
    pub payload: Value,
    /// Realtime channel receiving the diagnostics of this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_channel: Option<String>,
}

impl Envelope {
    /// A new envelope stamped with the current time.
    pub fn new(
        tracking_id: impl Into<String>,
        payload: Value,
        debug_channel: Option<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now().timestamp_millis(),
            tracking_id: tracking_id.into(),
            payload,
            debug_channel,
        }
    }

    /// Wire encoding.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a message body.
    pub fn from_bytes(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Physical queues of a logical queue: `process-message-{env}-{queue}-{i}`.
pub fn queue_names(env_id: &str, queue: &str, fanout: usize) -> Vec<String> {
    (1..=fanout)
        .map(|i| format!("process-message-{}-{}-{}", env_id, queue, i))
        .collect()
}

/// Delayed exchanges of a logical queue: `process-delayed-message-exchange-{env}-{queue}-{i}`.
pub fn delayed_exchange_names(env_id: &str, queue: &str, count: usize) -> Vec<String> {
    (1..=count)
        .map(|i| format!("process-delayed-message-exchange-{}-{}-{}", env_id, queue, i))
        .collect()
}

/// Physical queues of a task: `process-task-{env}-{taskId}-{i}`.
pub fn task_queue_names(env_id: &str, task_id: &str, fanout: usize) -> Vec<String> {
    (1..=fanout)
        .map(|i| format!("process-task-{}-{}-{}", env_id, task_id, i))
        .collect()
}

/// Uniform random pick.
fn pick(names: &[String]) -> Result<&str> {
    names
        .choose(&mut rand::thread_rng())
        .map(String::as_str)
        .ok_or_else(|| {
            EngineError::InvalidConfiguration("no physical queue to publish to".to_string())
        })
}

/// Text stored as the execution log message.
pub fn payload_for_log(payload: &Value, max_kb: usize) -> String {
    let text = match payload {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.len() > max_kb * 1024 {
        MESSAGE_TOO_LARGE.to_string()
    } else {
        text
    }
}

/// Tunables of the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Environment id used in physical names.
    pub env_id: String,
    /// Physical queues per logical queue.
    pub queue_fanout: usize,
    /// Delayed exchanges per logical queue.
    pub delayed_exchange_count: usize,
    /// Physical queues per task.
    pub task_fanout: usize,
    /// Execution log payload cap in KiB.
    pub max_log_payload_kb: usize,
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            env_id: config.env_id.clone(),
            queue_fanout: config.queue_fanout,
            delayed_exchange_count: config.delayed_exchange_count,
            task_fanout: config.task_fanout,
            max_log_payload_kb: config.max_log_payload_kb,
        }
    }
}

/// Running listeners and tickers of one generation.
pub struct Listeners {
    shutdown: watch::Sender<bool>,
    notifiers: Vec<Arc<Notify>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Default for Listeners {
    fn default() -> Self {
        Self::new()
    }
}

impl Listeners {
    /// An empty set.
    pub fn new() -> Self {
        Self {
            shutdown: watch::Sender::new(false),
            notifiers: Vec::new(),
            tasks: Vec::new(),
        }
    }

    fn signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn notify_on_stop(&mut self, handle: Arc<Notify>) {
        self.notifiers.push(handle);
    }

    fn push(&mut self, task: JoinHandle<()>) {
        self.tasks.push(task);
    }

    /// Number of running listeners and tickers.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether nothing is running.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Stop receiving and wait for the message being processed, if any, to finish.
    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        for notifier in &self.notifiers {
            notifier.notify_one();
        }
        for result in futures::future::join_all(self.tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Listener task ended abnormally");
            }
        }
    }
}

/// One unit of work taken off a physical queue.
struct Job<'a> {
    kind: HandlerKind,
    tracking: TrackingKind,
    name: &'a str,
    iid: &'a str,
    module_id: &'a str,
    log_execution: bool,
    envelope: Envelope,
}

impl Job<'_> {
    fn label(&self) -> &'static str {
        match self.tracking {
            TrackingKind::Message => "QUEUE",
            TrackingKind::CronJob => "TASK",
        }
    }
}

/// Submits and processes messages and task runs for one generation.
#[derive(Clone)]
pub struct Pipeline {
    settings: Arc<PipelineSettings>,
    env: Arc<EnvironmentConfig>,
    resources: Arc<AdapterRegistry>,
    handlers: Arc<HandlerRegistry>,
    tracking: Arc<dyn TrackingStore>,
}

impl Pipeline {
    /// A pipeline over one generation's resources and handlers.
    pub fn new(
        settings: PipelineSettings,
        resources: Arc<AdapterRegistry>,
        handlers: Arc<HandlerRegistry>,
        tracking: Arc<dyn TrackingStore>,
    ) -> Self {
        Self {
            settings: Arc::new(settings),
            env: resources.environment().clone(),
            resources,
            handlers,
            tracking,
        }
    }

    /// Pipeline settings.
    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Tracking store.
    pub fn tracking(&self) -> &Arc<dyn TrackingStore> {
        &self.tracking
    }

    /// Start listeners on every physical queue and tickers for every enabled task.
    ///
    /// Queues or tasks whose resources are unavailable are logged and skipped.
    pub async fn start(&self) -> Listeners {
        let mut listeners = Listeners::new();
        for queue in &self.env.queues {
            if let Err(e) = self.listen_queue(queue, &mut listeners).await {
                error!(queue = %queue.name, error = %e, "Queue listeners not started");
            }
        }
        for task in self.env.tasks.iter().filter(|t| t.enabled) {
            if let Err(e) = self.listen_task(task, &mut listeners).await {
                error!(task = %task.name, error = %e, "Task listeners not started");
            }
        }
        info!(
            env_id = %self.settings.env_id,
            listeners = listeners.len(),
            "Pipeline listeners started"
        );
        listeners
    }

    fn context(&self, tracking_id: &str) -> HandlerContext {
        HandlerContext {
            env_id: self.settings.env_id.clone(),
            params: Arc::new(self.env.params.clone()),
            resources: self.resources.clone(),
            tracking_id: Some(tracking_id.to_string()),
            cache_token: self.handlers.cache_token().to_string(),
        }
    }

    async fn invoke(&self, job: &Job<'_>, input: Value) -> Result<Value> {
        if self.env.suspended {
            return Err(EngineError::Suspended);
        }
        let handler = self
            .handlers
            .resolve(job.module_id)
            .await
            .map_err(|e| e.into_engine_error(job.kind))?;
        let ctx = self.context(&job.envelope.tracking_id);
        handler.call(&ctx, input).await.map_err(|e| EngineError::Handler {
            code: job.kind.execution_error_code().to_string(),
            message: e.to_string(),
            details: serde_json::to_value(e.to_error_message()).ok(),
        })
    }

    /// Process one job end to end. Returns the terminal status, or `None` when the
    /// record was unknown or already finished.
    async fn run_job(&self, job: Job<'_>) -> Option<TrackingStatus> {
        let span = match &job.envelope.debug_channel {
            Some(channel) => debug_span(channel),
            None => tracing::Span::none(),
        };
        self.run_job_inner(job).instrument(span).await
    }

    async fn run_job_inner(&self, job: Job<'_>) -> Option<TrackingStatus> {
        let tracking_id = job.envelope.tracking_id.clone();
        match self.tracking.mark_processing(job.tracking, &tracking_id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(tracking_id = %tracking_id, "Tracking record unknown or finished, skipping");
                return None;
            }
            Err(e) => {
                error!(tracking_id = %tracking_id, error = %e, "Failed to mark record processing");
            }
        }

        let started = Instant::now();
        let input = match job.kind {
            HandlerKind::TaskHandler => Value::Null,
            _ => job.envelope.payload.clone(),
        };
        let outcome = self.invoke(&job, input).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        let (status, errors) = match &outcome {
            Ok(_) => (TrackingStatus::Completed, None),
            Err(e) => (TrackingStatus::Errors, Some(serde_json::json!([e.to_error_message()]))),
        };
        if let Err(e) = self
            .tracking
            .finish(job.tracking, &tracking_id, status, errors.as_ref())
            .await
        {
            error!(tracking_id = %tracking_id, error = %e, "Failed to record terminal status");
        }

        match &outcome {
            Ok(_) => info!(
                tracking_id = %tracking_id,
                iid = %job.iid,
                duration_ms,
                "{}: {} ({}) {}ms",
                job.label(),
                job.name,
                status,
                duration_ms
            ),
            Err(e) => warn!(
                tracking_id = %tracking_id,
                iid = %job.iid,
                duration_ms,
                code = %e.error_code(),
                error = %e,
                "{}: {} ({}) {}ms",
                job.label(),
                job.name,
                status,
                duration_ms
            ),
        }

        if job.log_execution {
            let message = match (&outcome, job.tracking) {
                (_, TrackingKind::Message) => Some(&job.envelope.payload),
                (Ok(result), TrackingKind::CronJob) => Some(result),
                (Err(_), TrackingKind::CronJob) => None,
            };
            let log = ExecutionLog {
                iid: job.iid.to_string(),
                tracking_id: tracking_id.clone(),
                duration_ms,
                status: status.to_string(),
                message: message.map(|m| payload_for_log(m, self.settings.max_log_payload_kb)),
                errors: errors.as_ref().map(Value::to_string),
            };
            if let Err(e) = self.tracking.write_log(job.tracking, &log).await {
                error!(tracking_id = %tracking_id, error = %e, "Failed to write execution log");
            }
        }

        Some(status)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("env_id", &self.settings.env_id)
            .field("queues", &self.env.queues.len())
            .field("tasks", &self.env.tasks.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::adapters::FactoryTable;
    use crate::handlers::{StaticCatalog, handler_fn};
    use crate::registry::RegistryOptions;
    use crate::tracking::SqliteTracking;

    pub fn settings(fanout: usize) -> PipelineSettings {
        PipelineSettings {
            env_id: "env-1".to_string(),
            queue_fanout: fanout,
            delayed_exchange_count: 2,
            task_fanout: 1,
            max_log_payload_kb: 1,
        }
    }

    /// Environment with a Memory queue `emails` (logged, delayed), a Memory-backed Cron
    /// scheduler and a task `cleanup`.
    pub fn environment(suspended: bool) -> EnvironmentConfig {
        serde_json::from_value(json!({
            "iid": "env-1",
            "suspended": suspended,
            "resources": [
                {"iid": "res-q", "name": "q", "type": "queue", "instance": "Memory", "access": {}},
                {"iid": "res-s", "name": "s", "type": "scheduler", "instance": "Cron", "access": {}}
            ],
            "mappings": [
                {
                    "design": {"iid": "q-1", "type": "queue", "name": "emails"},
                    "resource": {"iid": "res-q"}
                },
                {
                    "design": {"iid": "q-2", "type": "queue", "name": "broken"},
                    "resource": {"iid": "res-q"}
                },
                {
                    "design": {"iid": "s-1", "type": "scheduler", "name": "scheduler"},
                    "resource": {"iid": "res-s"}
                }
            ],
            "queues": [
                {
                    "iid": "q-1",
                    "name": "emails",
                    "logExecution": true,
                    "delayedMessages": true,
                    "module": "send-email"
                },
                {"iid": "q-2", "name": "broken", "module": "absent"}
            ],
            "tasks": [
                {
                    "iid": "t-1",
                    "name": "cleanup",
                    "cronExpression": "0 0 1 1 *",
                    "logExecution": true,
                    "module": "cleanup"
                }
            ]
        }))
        .unwrap()
    }

    pub struct Fixture {
        pub pipeline: Pipeline,
        pub calls: Arc<AtomicUsize>,
        pub tracking: Arc<dyn TrackingStore>,
    }

    impl Fixture {
        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    pub async fn fixture(env: EnvironmentConfig, fanout: usize) -> Fixture {
        let registry = Arc::new(AdapterRegistry::new(
            Arc::new(env),
            RegistryOptions {
                env_id: "env-1".to_string(),
                default_pool_size: 1,
                disconnect_timeout: std::time::Duration::from_secs(1),
            },
            Arc::new(FactoryTable::with_defaults()),
            None,
        ));
        registry.setup_all().await;

        let calls = Arc::new(AtomicUsize::new(0));
        let send_calls = calls.clone();
        let task_calls = calls.clone();
        let catalog = StaticCatalog::new()
            .with_handler(
                "send-email",
                handler_fn(move |_ctx, input: Value| {
                    let calls = send_calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        if input.get("fail").is_some() {
                            return Err(EngineError::handler("smtpDown", "smtp unreachable"));
                        }
                        Ok(json!({"sent": true}))
                    }
                }),
            )
            .with_handler(
                "cleanup",
                handler_fn(move |_ctx, input: Value| {
                    let calls = task_calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        assert!(input.is_null());
                        Ok(json!("cleaned"))
                    }
                }),
            );
        let handlers = Arc::new(HandlerRegistry::new(vec![Arc::new(catalog)]));

        let tracking: Arc<dyn TrackingStore> =
            Arc::new(SqliteTracking::connect("sqlite::memory:").await.unwrap());
        Fixture {
            pipeline: Pipeline::new(settings(fanout), registry, handlers, tracking.clone()),
            calls,
            tracking,
        }
    }

    /// Poll until the record reaches a terminal status.
    pub async fn wait_terminal(
        tracking: &Arc<dyn TrackingStore>,
        kind: TrackingKind,
        id: &str,
    ) -> TrackingStatus {
        for _ in 0..200 {
            if let Some(record) = tracking.get(kind, id).await.unwrap() {
                let status = record.status().unwrap();
                if status.is_terminal() {
                    return status;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("record {} never finished", id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_physical_names() {
        assert_eq!(
            queue_names("env-1", "emails", 2),
            vec!["process-message-env-1-emails-1", "process-message-env-1-emails-2"]
        );
        assert_eq!(
            delayed_exchange_names("env-1", "emails", 1),
            vec!["process-delayed-message-exchange-env-1-emails-1"]
        );
        assert_eq!(task_queue_names("env-1", "t-9", 1), vec!["process-task-env-1-t-9-1"]);
        assert!(pick(&[]).is_err());
    }

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = Envelope::new("t-1", json!({"to": "a@b.c"}), None);
        let wire: Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(wire["trackingId"], "t-1");
        assert_eq!(wire["payload"]["to"], "a@b.c");
        assert!(wire.get("debugChannel").is_none());
        assert!(wire["timestamp"].as_i64().unwrap() > 0);

        let raw = br#"{"timestamp":1,"trackingId":"x","debugChannel":"dbg"}"#;
        let decoded = Envelope::from_bytes(raw).unwrap();
        assert_eq!(decoded.payload, Value::Null);
        assert_eq!(decoded.debug_channel.as_deref(), Some("dbg"));
    }

    #[test]
    fn test_payload_for_log_limit() {
        assert_eq!(payload_for_log(&json!("short"), 1), "short");
        assert_eq!(payload_for_log(&json!({"a": 1}), 1), r#"{"a":1}"#);
        let big = json!("x".repeat(2048));
        assert_eq!(payload_for_log(&big, 1), MESSAGE_TOO_LARGE);
        assert_eq!(payload_for_log(&big, 4), "x".repeat(2048));
    }

    #[tokio::test]
    async fn test_listeners_stop_cleanly() {
        let fixture = testing::fixture(testing::environment(false), 2).await;
        let listeners = fixture.pipeline.start().await;
        // 2 for emails, 2 for broken, 1 task queue and 1 ticker.
        assert_eq!(listeners.len(), 6);
        tokio::time::timeout(std::time::Duration::from_secs(5), listeners.stop())
            .await
            .unwrap();
    }
}
