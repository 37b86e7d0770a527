// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue submission and queue listeners.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Envelope, Job, Listeners, Pipeline, delayed_exchange_names, pick, queue_names};
use crate::descriptor::{QueueConfig, ResourceType};
use crate::error::{EngineError, Result};
use crate::handlers::HandlerKind;
use crate::tracking::{NewTracking, TrackingKind, TrackingStatus};

/// Per-message submission options.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Delivery delay; zero means immediate.
    pub delay: Option<Duration>,
    /// Realtime channel receiving the diagnostics of this message.
    pub debug_channel: Option<String>,
}

impl Pipeline {
    fn queue_config(&self, queue: &str) -> Result<&QueueConfig> {
        self.env.queue(queue).ok_or_else(|| EngineError::ResourceNotFound {
            name: queue.to_string(),
            category: ResourceType::Queue.to_string(),
        })
    }

    /// Submit a message to a logical queue. Returns the tracking id.
    ///
    /// The `pending` tracking record is written before the broker sees the envelope.
    /// A delay requires a queue with delayed messages enabled on a broker that supports
    /// delay.
    pub async fn send_message(
        &self,
        queue: &str,
        payload: Value,
        options: SendOptions,
    ) -> Result<String> {
        let config = self.queue_config(queue)?;
        let broker = self.resources.queue_broker(&config.name)?;
        let delay = options.delay.filter(|d| !d.is_zero());

        if delay.is_some() && !(config.delayed_messages && broker.supports_delay()) {
            return Err(EngineError::InvalidConfiguration(format!(
                "queue '{}' does not accept delayed messages",
                config.name
            )));
        }

        let tracking_id = uuid::Uuid::new_v4().to_string();
        self.tracking
            .create(
                TrackingKind::Message,
                &NewTracking {
                    tracking_id: tracking_id.clone(),
                    resource_name: config.name.clone(),
                    resource_iid: config.iid.clone(),
                    delay_ms: delay.map(|d| d.as_millis() as i64),
                },
            )
            .await?;

        let body = Envelope::new(&tracking_id, payload, options.debug_channel).to_bytes()?;
        let env_id = &self.settings.env_id;
        match delay {
            Some(delay) => {
                let count = self.settings.delayed_exchange_count;
                let exchanges = delayed_exchange_names(env_id, &config.name, count);
                broker.publish_delayed(pick(&exchanges)?, body, delay).await?;
            }
            None => {
                let queues = queue_names(env_id, &config.name, self.settings.queue_fanout);
                broker.publish(pick(&queues)?, body).await?;
            }
        }

        debug!(
            queue = %config.name,
            tracking_id = %tracking_id,
            delayed = delay.is_some(),
            "Message submitted"
        );
        Ok(tracking_id)
    }

    /// Declare a queue's physical queues and exchanges and listen on every physical queue.
    pub(super) async fn listen_queue(
        &self,
        queue: &QueueConfig,
        listeners: &mut Listeners,
    ) -> Result<()> {
        let broker = self.resources.queue_broker(&queue.name)?;
        let env_id = &self.settings.env_id;
        let names = queue_names(env_id, &queue.name, self.settings.queue_fanout);
        for name in &names {
            broker.declare_queue(name).await?;
        }

        if queue.delayed_messages && broker.supports_delay() {
            let exchanges =
                delayed_exchange_names(env_id, &queue.name, self.settings.delayed_exchange_count);
            for (i, exchange) in exchanges.iter().enumerate() {
                broker.declare_delayed_exchange(exchange, &names[i % names.len()]).await?;
            }
        }

        for name in names {
            let receiver = broker.consume(&name).await?;
            let pipeline = self.clone();
            let queue = queue.clone();
            let shutdown = listeners.signal();
            listeners.push(tokio::spawn(async move {
                pipeline.queue_listener(queue, name, receiver, shutdown).await;
            }));
        }
        info!(
            queue = %queue.name,
            physical = self.settings.queue_fanout,
            "Queue listeners registered"
        );
        Ok(())
    }

    async fn queue_listener(
        self,
        queue: QueueConfig,
        physical: String,
        mut receiver: mpsc::Receiver<Vec<u8>>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = crate::adapters::until_set(&mut shutdown) => break,
                body = receiver.recv() => {
                    let Some(body) = body else {
                        debug!(queue = %physical, "Broker closed the consumer");
                        break;
                    };
                    self.process_message(&queue, &body).await;
                }
            }
        }
        debug!(queue = %physical, "Queue listener stopped");
    }

    /// Process one message body received from a physical queue of `queue`.
    pub async fn process_message(
        &self,
        queue: &QueueConfig,
        body: &[u8],
    ) -> Option<TrackingStatus> {
        let envelope = match Envelope::from_bytes(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(queue = %queue.name, error = %e, "Dropping malformed message");
                return None;
            }
        };
        self.run_job(Job {
            kind: HandlerKind::QueueHandler,
            tracking: TrackingKind::Message,
            name: &queue.name,
            iid: &queue.iid,
            module_id: queue.module_id(),
            log_execution: queue.log_execution,
            envelope,
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use serde_json::json;

    use super::super::testing::{environment, fixture, wait_terminal};
    use super::*;

    #[tokio::test]
    async fn test_message_round_trip() {
        let f = fixture(environment(false), 3).await;
        let listeners = f.pipeline.start().await;

        let id = f
            .pipeline
            .send_message("emails", json!({"to": "a@b.c"}), SendOptions::default())
            .await
            .unwrap();
        assert_eq!(
            wait_terminal(&f.tracking, TrackingKind::Message, &id).await,
            TrackingStatus::Completed
        );
        assert_eq!(f.calls(), 1);

        let record = f.tracking.get(TrackingKind::Message, &id).await.unwrap().unwrap();
        assert_eq!(record.resource_name, "emails");
        assert_eq!(record.resource_iid, "q-1");
        assert!(record.started_at.is_some());
        assert!(record.errors.is_none());

        // The execution log is written after the terminal status.
        listeners.stop().await;
        let logs = f.tracking.list_logs(TrackingKind::Message, "q-1", 10).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message.as_deref(), Some(r#"{"to":"a@b.c"}"#));
    }

    #[tokio::test]
    async fn test_handler_failure_is_terminal() {
        let f = fixture(environment(false), 1).await;
        let listeners = f.pipeline.start().await;

        let id = f
            .pipeline
            .send_message("emails", json!({"fail": true}), SendOptions::default())
            .await
            .unwrap();
        assert_eq!(
            wait_terminal(&f.tracking, TrackingKind::Message, &id).await,
            TrackingStatus::Errors
        );

        let record = f.tracking.get(TrackingKind::Message, &id).await.unwrap().unwrap();
        let errors = record.errors_json().unwrap();
        assert_eq!(errors[0]["code"], "queueExecutionError");
        assert_eq!(errors[0]["message"], "smtp unreachable");
        assert_eq!(errors[0]["details"]["code"], "smtpDown");
        assert_eq!(f.calls(), 1);

        let missing = f
            .pipeline
            .send_message("broken", json!({}), SendOptions::default())
            .await
            .unwrap();
        assert_eq!(
            wait_terminal(&f.tracking, TrackingKind::Message, &missing).await,
            TrackingStatus::Errors
        );
        let record = f.tracking.get(TrackingKind::Message, &missing).await.unwrap().unwrap();
        assert_eq!(record.errors_json().unwrap()[0]["code"], "queueImportError");

        listeners.stop().await;
    }

    #[tokio::test]
    async fn test_suspended_environment_skips_handler() {
        let f = fixture(environment(true), 2).await;
        let listeners = f.pipeline.start().await;

        let mut ids = Vec::new();
        for n in 0..5 {
            ids.push(
                f.pipeline
                    .send_message("emails", json!({"n": n}), SendOptions::default())
                    .await
                    .unwrap(),
            );
        }
        for id in &ids {
            assert_eq!(
                wait_terminal(&f.tracking, TrackingKind::Message, id).await,
                TrackingStatus::Errors
            );
            let record = f.tracking.get(TrackingKind::Message, id).await.unwrap().unwrap();
            assert_eq!(record.errors_json().unwrap()[0]["code"], "suspendedEnvironment");
        }
        assert_eq!(f.calls(), 0);

        listeners.stop().await;
    }

    #[tokio::test]
    async fn test_fanout_reaches_every_physical_queue() {
        let fanout = 4;
        let f = fixture(environment(false), fanout).await;
        for n in 0..(20 * fanout) {
            f.pipeline
                .send_message("emails", json!({"n": n}), SendOptions::default())
                .await
                .unwrap();
        }

        let broker = f.pipeline.resources.queue_broker("emails").unwrap();
        let mut hit = HashSet::new();
        for name in queue_names("env-1", "emails", fanout) {
            let mut receiver = broker.consume(&name).await.unwrap();
            if tokio::time::timeout(Duration::from_millis(200), receiver.recv())
                .await
                .ok()
                .flatten()
                .is_some()
            {
                hit.insert(name);
            }
        }
        assert_eq!(hit.len(), fanout);
        assert_eq!(f.calls(), 0);
    }

    #[tokio::test]
    async fn test_delayed_message() {
        let f = fixture(environment(false), 2).await;
        let listeners = f.pipeline.start().await;

        let id = f
            .pipeline
            .send_message(
                "emails",
                json!({"to": "later"}),
                SendOptions {
                    delay: Some(Duration::from_millis(50)),
                    debug_channel: None,
                },
            )
            .await
            .unwrap();
        let record = f.tracking.get(TrackingKind::Message, &id).await.unwrap().unwrap();
        assert_eq!(record.delay, Some(50));
        assert_eq!(
            wait_terminal(&f.tracking, TrackingKind::Message, &id).await,
            TrackingStatus::Completed
        );

        // `broken` does not enable delayed messages.
        let err = f
            .pipeline
            .send_message(
                "broken",
                json!({}),
                SendOptions {
                    delay: Some(Duration::from_secs(1)),
                    debug_channel: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "invalidConfiguration");

        listeners.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_queue_and_stale_messages() {
        let f = fixture(environment(false), 1).await;
        let err = f
            .pipeline
            .send_message("nope", json!({}), SendOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "resourceNotFound");

        let queue = f.pipeline.env.queue("emails").unwrap().clone();
        assert_eq!(f.pipeline.process_message(&queue, b"not json").await, None);

        // No tracking record: skipped without invoking the handler.
        let orphan = Envelope::new("orphan", json!({}), None).to_bytes().unwrap();
        assert_eq!(f.pipeline.process_message(&queue, &orphan).await, None);
        assert_eq!(f.calls(), 0);
    }

    #[tokio::test]
    async fn test_large_payload_log_is_replaced() {
        let f = fixture(environment(false), 1).await;
        let listeners = f.pipeline.start().await;

        let id = f
            .pipeline
            .send_message("emails", json!({"body": "x".repeat(4096)}), SendOptions::default())
            .await
            .unwrap();
        wait_terminal(&f.tracking, TrackingKind::Message, &id).await;
        listeners.stop().await;

        let logs = f.tracking.list_logs(TrackingKind::Message, "q-1", 1).await.unwrap();
        assert_eq!(logs[0].message.as_deref(), Some(super::super::MESSAGE_TOO_LARGE));
    }
}
