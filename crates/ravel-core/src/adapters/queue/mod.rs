// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message broker adapters.
//!
//! Brokers move opaque message bodies between named queues. A message is removed from
//! the broker when a consumer receives it, so delivery is acknowledged at receipt.
//! Delayed delivery goes through a delayed exchange bound to one queue.

mod memory;
mod redis;

pub use self::memory::{MemoryBroker, MemoryQueueFactory};
pub use self::redis::{RedisBroker, RedisQueueFactory};

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Capacity of the channel between a broker consumer and its listener.
pub const CONSUMER_BUFFER: usize = 64;

/// A message broker.
#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Backend kind for logs.
    fn backend(&self) -> &'static str;

    /// Whether [`QueueBroker::publish_delayed`] is available.
    fn supports_delay(&self) -> bool;

    /// Make sure a queue exists.
    async fn declare_queue(&self, queue: &str) -> Result<()>;

    /// Declare a delayed exchange that delivers into `queue`.
    async fn declare_delayed_exchange(&self, exchange: &str, queue: &str) -> Result<()>;

    /// Append a message to a queue.
    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<()>;

    /// Deliver a message through a delayed exchange after `delay`.
    async fn publish_delayed(&self, exchange: &str, body: Vec<u8>, delay: Duration) -> Result<()>;

    /// Start consuming a queue. The channel closes when the broker is closed.
    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Vec<u8>>>;

    /// Stop consumers and delayed deliveries and release connections.
    async fn close(&self) -> Result<()>;
}
