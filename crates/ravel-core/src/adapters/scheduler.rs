// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cron scheduler adapter.
//!
//! The scheduler computes fire times and owns the broker that carries task envelopes
//! to the task queues. Which broker it uses is part of its access settings.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use croner::Cron;

use super::queue::{MemoryBroker, QueueBroker, RedisBroker};
use super::{Adapter, AdapterFactory, ConnectRequest, access_str, redis_url};
use crate::descriptor::{ResourceType, backend};
use crate::error::{EngineError, Result};

/// Schedules tasks.
#[async_trait]
pub trait SchedulerAdapter: Send + Sync {
    /// Backend kind for logs.
    fn backend(&self) -> &'static str;

    /// First fire time of `expression` strictly after `after`.
    fn next_fire(&self, expression: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>>;

    /// Broker carrying task envelopes.
    fn broker(&self) -> Arc<dyn QueueBroker>;

    /// Release the broker.
    async fn disconnect(&self) -> Result<()>;
}

/// Parse a five- or six-field cron expression.
pub fn parse_cron(expression: &str) -> Result<Cron> {
    Cron::new(expression)
        .with_seconds_optional()
        .parse()
        .map_err(|e| {
            let message = format!("invalid cron expression '{}': {}", expression, e);
            EngineError::InvalidConfiguration(message)
        })
}

/// Cron scheduler on top of a queue broker.
pub struct CronScheduler {
    broker: Arc<dyn QueueBroker>,
}

impl CronScheduler {
    /// Scheduler publishing through `broker`.
    pub fn new(broker: Arc<dyn QueueBroker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl SchedulerAdapter for CronScheduler {
    fn backend(&self) -> &'static str {
        backend::CRON
    }

    fn next_fire(&self, expression: &str, after: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let cron = parse_cron(expression)?;
        Ok(cron.find_next_occurrence(&after, false).ok())
    }

    fn broker(&self) -> Arc<dyn QueueBroker> {
        self.broker.clone()
    }

    async fn disconnect(&self) -> Result<()> {
        self.broker.close().await
    }
}

/// Factory for `Cron` schedulers.
///
/// Access: `{broker: "Memory" | "Redis", url | host, ...}`; the broker defaults to
/// `Memory`.
pub struct CronFactory;

#[async_trait]
impl AdapterFactory for CronFactory {
    fn category(&self) -> ResourceType {
        ResourceType::Scheduler
    }

    fn backend(&self) -> &'static str {
        backend::CRON
    }

    async fn connect(&self, request: &ConnectRequest<'_>) -> Result<Adapter> {
        let broker_backend = access_str(request.access, &["broker"]).unwrap_or(backend::MEMORY);
        let broker: Arc<dyn QueueBroker> = match broker_backend {
            backend::MEMORY => Arc::new(MemoryBroker::new()),
            backend::REDIS => {
                let url = redis_url(request.access)
                    .ok_or_else(|| {
                        request.setup_error(
                            "access.url or access.host is required for a Redis broker",
                        )
                    })?;
                Arc::new(RedisBroker::connect(&url).await?)
            }
            other => {
                return Err(EngineError::UnsupportedBackend {
                    kind: other.to_string(),
                    category: ResourceType::Queue.to_string(),
                });
            }
        };
        Ok(Adapter::Scheduler(Arc::new(CronScheduler::new(broker))))
    }
}
