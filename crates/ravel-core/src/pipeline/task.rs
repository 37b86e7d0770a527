// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduled tasks: cron tickers, on-demand triggers and task listeners.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Notify, mpsc, watch};
use tracing::{debug, error, info};

use super::{Envelope, Job, Listeners, Pipeline, pick, task_queue_names};
use crate::adapters::SchedulerAdapter;
use crate::descriptor::{ResourceType, TaskConfig};
use crate::error::{EngineError, Result};
use crate::handlers::HandlerKind;
use crate::tracking::{NewTracking, TrackingKind, TrackingStatus};

/// Fires one task on its cron schedule until shut down.
pub struct CronTicker {
    pipeline: Pipeline,
    task: TaskConfig,
    scheduler: Arc<dyn SchedulerAdapter>,
    shutdown: Arc<Notify>,
}

impl CronTicker {
    /// A ticker for `task`.
    pub fn new(pipeline: Pipeline, task: TaskConfig, scheduler: Arc<dyn SchedulerAdapter>) -> Self {
        Self {
            pipeline,
            task,
            scheduler,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to trigger shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the ticker loop.
    pub async fn run(&self) {
        info!(task = %self.task.name, cron = %self.task.cron_expression, "Cron ticker started");

        loop {
            let now = Utc::now();
            let next = match self.scheduler.next_fire(&self.task.cron_expression, now) {
                Ok(Some(next)) => next,
                Ok(None) => {
                    info!(task = %self.task.name, "Schedule has no further occurrences");
                    break;
                }
                Err(e) => {
                    error!(task = %self.task.name, error = %e, "Cannot compute next fire time");
                    break;
                }
            };
            let wait = (next - now).to_std().unwrap_or_default();

            tokio::select! {
                biased;
                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(wait) => {
                    if let Err(e) = self.pipeline.trigger_task(&self.task.iid, None).await {
                        error!(task = %self.task.name, error = %e, "Scheduled trigger failed");
                    }
                }
            }
        }

        info!(task = %self.task.name, "Cron ticker stopped");
    }
}

impl Pipeline {
    fn scheduler(&self) -> Result<Arc<dyn SchedulerAdapter>> {
        self.resources.scheduler().ok_or_else(|| EngineError::ResourceNotFound {
            name: "scheduler".to_string(),
            category: ResourceType::Scheduler.to_string(),
        })
    }

    /// Run a task now, outside its schedule. Returns the tracking id.
    pub async fn trigger_task(&self, task: &str, debug_channel: Option<String>) -> Result<String> {
        let config = self.env.task(task).ok_or_else(|| EngineError::ResourceNotFound {
            name: task.to_string(),
            category: "task".to_string(),
        })?;
        if !config.enabled {
            return Err(EngineError::InvalidConfiguration(format!(
                "task '{}' is disabled",
                config.name
            )));
        }
        let broker = self.scheduler()?.broker();

        let tracking_id = uuid::Uuid::new_v4().to_string();
        self.tracking
            .create(
                TrackingKind::CronJob,
                &NewTracking {
                    tracking_id: tracking_id.clone(),
                    resource_name: config.name.clone(),
                    resource_iid: config.iid.clone(),
                    delay_ms: None,
                },
            )
            .await?;

        let body = Envelope::new(&tracking_id, serde_json::Value::Null, debug_channel).to_bytes()?;
        let queues =
            task_queue_names(&self.settings.env_id, &config.iid, self.settings.task_fanout);
        broker.publish(pick(&queues)?, body).await?;

        debug!(task = %config.name, tracking_id = %tracking_id, "Task triggered");
        Ok(tracking_id)
    }

    /// Listen on a task's physical queues and start its cron ticker.
    pub(super) async fn listen_task(
        &self,
        task: &TaskConfig,
        listeners: &mut Listeners,
    ) -> Result<()> {
        let scheduler = self.scheduler()?;
        // Reject a bad expression before anything is registered.
        scheduler.next_fire(&task.cron_expression, Utc::now())?;

        let broker = scheduler.broker();
        let names = task_queue_names(&self.settings.env_id, &task.iid, self.settings.task_fanout);
        for name in names {
            broker.declare_queue(&name).await?;
            let receiver = broker.consume(&name).await?;
            let pipeline = self.clone();
            let task = task.clone();
            let shutdown = listeners.signal();
            listeners.push(tokio::spawn(async move {
                pipeline.task_listener(task, name, receiver, shutdown).await;
            }));
        }

        let ticker = CronTicker::new(self.clone(), task.clone(), scheduler);
        listeners.notify_on_stop(ticker.shutdown_handle());
        listeners.push(tokio::spawn(async move { ticker.run().await }));
        Ok(())
    }

    async fn task_listener(
        self,
        task: TaskConfig,
        physical: String,
        mut receiver: mpsc::Receiver<Vec<u8>>,
        mut shutdown: watch::Receiver<bool>,
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
                    self.process_task(&task, &body).await;
                }
            }
        }
        debug!(queue = %physical, "Task listener stopped");
    }

    /// Process one task envelope received from a physical queue of `task`.
    pub async fn process_task(&self, task: &TaskConfig, body: &[u8]) -> Option<TrackingStatus> {
        let envelope = match Envelope::from_bytes(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(task = %task.name, error = %e, "Dropping malformed task envelope");
                return None;
            }
        };
        self.run_job(Job {
            kind: HandlerKind::TaskHandler,
            tracking: TrackingKind::CronJob,
            name: &task.name,
            iid: &task.iid,
            module_id: task.module_id(),
            log_execution: task.log_execution,
            envelope,
        })
        .await
    }
}
