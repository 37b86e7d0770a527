// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process realtime bus.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};

use super::{RealtimeAdapter, SUBSCRIBER_BUFFER};
use crate::adapters::{Adapter, AdapterFactory, ConnectRequest};
use crate::descriptor::{ResourceType, backend};
use crate::error::Result;

/// Messages retained per channel for slow subscribers before they start lagging.
const CHANNEL_CAPACITY: usize = 1024;

/// Realtime bus backed by one tokio broadcast channel per name.
pub struct MemoryRealtime {
    channels: DashMap<String, broadcast::Sender<Value>>,
    closed: watch::Sender<bool>,
}

impl Default for MemoryRealtime {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRealtime {
    /// An empty bus.
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            closed: watch::Sender::new(false),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Value> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl RealtimeAdapter for MemoryRealtime {
    fn backend(&self) -> &'static str {
        backend::MEMORY
    }

    async fn broadcast(&self, channel: &str, message: &Value) -> Result<()> {
        let Some(sender) = self.channels.get(channel).map(|s| s.value().clone()) else {
            return Ok(());
        };
        // No receivers is not an error.
        let _ = sender.send(message.clone());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Value>> {
        let mut source = self.sender(channel).subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut closed = self.closed.subscribe();
        let channel = channel.to_string();

        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    biased;
                    _ = crate::adapters::until_set(&mut closed) => break,
                    received = source.recv() => received,
                };
                match received {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(channel = %channel, skipped, "Realtime subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }

    async fn disconnect(&self) -> Result<()> {
        self.closed.send_replace(true);
        self.channels.clear();
        Ok(())
    }
}

/// Factory for `Memory` realtime buses.
pub struct MemoryRealtimeFactory;

#[async_trait]
impl AdapterFactory for MemoryRealtimeFactory {
    fn category(&self) -> ResourceType {
        ResourceType::Realtime
    }

    fn backend(&self) -> &'static str {
        backend::MEMORY
    }

    async fn connect(&self, _request: &ConnectRequest<'_>) -> Result<Adapter> {
        Ok(Adapter::Realtime(Arc::new(MemoryRealtime::new())))
    }
}
