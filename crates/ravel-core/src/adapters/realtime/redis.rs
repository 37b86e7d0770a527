// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis pub/sub realtime bus. Messages travel as JSON text.

use std::sync::Arc;

use ::redis::aio::ConnectionManager;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use super::{RealtimeAdapter, SUBSCRIBER_BUFFER};
use crate::adapters::{Adapter, AdapterFactory, ConnectRequest, redis_url};
use crate::descriptor::{ResourceType, backend};
use crate::error::Result;

fn channel_key(channel: &str) -> String {
    format!("ravel:realtime:{}", channel)
}

/// Realtime bus on Redis `PUBLISH`/`SUBSCRIBE`.
pub struct RedisRealtime {
    client: ::redis::Client,
    conn: ConnectionManager,
    closed: watch::Sender<bool>,
}

impl RedisRealtime {
    /// Connect to `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = ::redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            closed: watch::Sender::new(false),
        })
    }
}

#[async_trait]
impl RealtimeAdapter for RedisRealtime {
    fn backend(&self) -> &'static str {
        backend::REDIS
    }

    async fn broadcast(&self, channel: &str, message: &Value) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self.conn.clone();
        let _: i64 = ::redis::cmd("PUBLISH")
            .arg(channel_key(channel))
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<Value>> {
        // A subscribed connection cannot run other commands.
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel_key(channel)).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut closed = self.closed.subscribe();
        let channel = channel.to_string();

        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            loop {
                let message = tokio::select! {
                    biased;
                    _ = crate::adapters::until_set(&mut closed) => break,
                    message = messages.next() => message,
                };
                let Some(message) = message else { break };
                let value = match message.get_payload::<String>() {
                    Ok(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
                    Err(e) => {
                        tracing::warn!(
                            channel = %channel,
                            error = %e,
                            "Discarding undecodable realtime message"
                        );
                        continue;
                    }
                };
                if tx.send(value).await.is_err() {
                    break;
                }
            }
            tracing::debug!(channel = %channel, "Realtime subscription ended");
        });
        Ok(rx)
    }

    async fn disconnect(&self) -> Result<()> {
        self.closed.send_replace(true);
        Ok(())
    }
}

/// Factory for `Redis` realtime buses. Access: `{url}` or `{host, port, password, db}`.
pub struct RedisRealtimeFactory;

#[async_trait]
impl AdapterFactory for RedisRealtimeFactory {
    fn category(&self) -> ResourceType {
        ResourceType::Realtime
    }

    fn backend(&self) -> &'static str {
        backend::REDIS
    }

    async fn connect(&self, request: &ConnectRequest<'_>) -> Result<Adapter> {
        let url = redis_url(request.access)
            .ok_or_else(|| request.setup_error("access.url or access.host is required"))?;
        Ok(Adapter::Realtime(Arc::new(RedisRealtime::connect(&url).await?)))
    }
}
