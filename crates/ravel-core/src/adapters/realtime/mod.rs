// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Realtime pub/sub bus.
//!
//! Delivery is fire-and-forget: a message broadcast while nobody listens on the channel
//! is lost.

mod memory;
mod redis;

pub use self::memory::{MemoryRealtime, MemoryRealtimeFactory};
pub use self::redis::{RedisRealtime, RedisRealtimeFactory};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;

/// Buffer between a subscription and its reader.
pub(crate) const SUBSCRIBER_BUFFER: usize = 256;

/// Channel-addressed broadcast.
#[async_trait]
pub trait RealtimeAdapter: Send + Sync {
    /// Backend kind for logs.
    fn backend(&self) -> &'static str;

    /// Send `message` to every current subscriber of `channel`.
    async fn broadcast(&self, channel: &str, message: &Value) -> Result<()>;

    /// Receive messages sent to `channel` from now on. Dropping the receiver unsubscribes.
    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Value>>;

    /// End every subscription and release connections.
    async fn disconnect(&self) -> Result<()>;
}
