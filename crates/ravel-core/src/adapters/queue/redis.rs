// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis broker.
//!
//! Queues are lists (`LPUSH` to publish, `BRPOP` to consume). A delayed exchange is a
//! sorted set scored by due time; a mover task per exchange claims due members with
//! `ZREM` (so exactly one worker moves each message) and pushes them onto the bound
//! queue.

use std::sync::Arc;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};

use super::{CONSUMER_BUFFER, QueueBroker};
use crate::adapters::{Adapter, AdapterFactory, ConnectRequest, redis_url};
use crate::descriptor::{ResourceType, backend};
use crate::error::{EngineError, Result};

/// BRPOP timeout; bounds how long a consumer takes to notice shutdown.
const POP_TIMEOUT_SECS: f64 = 1.0;
/// How often delayed exchanges are checked for due messages.
const MOVER_INTERVAL: Duration = Duration::from_millis(250);
/// Due messages moved per round.
const MOVER_BATCH: usize = 100;
/// Back-off after a failed Redis command in a background task.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

type Popped = std::result::Result<Option<(String, Vec<u8>)>, ::redis::RedisError>;

fn queue_key(queue: &str) -> String {
    format!("ravel:queue:{}", queue)
}

fn exchange_key(exchange: &str) -> String {
    format!("ravel:delayed:{}", exchange)
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Redis list-based broker.
pub struct RedisBroker {
    client: ::redis::Client,
    conn: ConnectionManager,
    exchanges: DashMap<String, String>,
    closed: watch::Sender<bool>,
}

impl RedisBroker {
    /// Connect to `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = ::redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self {
            client,
            conn,
            exchanges: DashMap::new(),
            closed: watch::Sender::new(false),
        })
    }

    fn spawn_mover(&self, exchange: String, queue: String) {
        let mut conn = self.conn.clone();
        let mut closed = self.closed.subscribe();
        tokio::spawn(async move {
            let key = exchange_key(&exchange);
            let target = queue_key(&queue);
            loop {
                tokio::select! {
                    biased;
                    _ = crate::adapters::until_set(&mut closed) => break,
                    _ = tokio::time::sleep(MOVER_INTERVAL) => {}
                }
                if let Err(e) = move_due(&mut conn, &key, &target).await {
                    tracing::warn!(
                        exchange = %exchange,
                        error = %e,
                        "Moving delayed messages failed"
                    );
                    tokio::time::sleep(ERROR_BACKOFF).await;
                }
            }
            tracing::debug!(exchange = %exchange, "Delayed exchange mover stopped");
        });
    }
}

async fn move_due(conn: &mut ConnectionManager, key: &str, target: &str) -> Result<()> {
    let due: Vec<String> = ::redis::cmd("ZRANGEBYSCORE")
        .arg(key)
        .arg("-inf")
        .arg(now_millis())
        .arg("LIMIT")
        .arg(0)
        .arg(MOVER_BATCH)
        .query_async(conn)
        .await?;

    for member in due {
        let claimed: i64 = ::redis::cmd("ZREM").arg(key).arg(&member).query_async(conn).await?;
        if claimed != 1 {
            continue;
        }
        let Some(body) = member
            .split_once(':')
            .and_then(|(_, encoded)| BASE64.decode(encoded).ok())
        else {
            tracing::warn!(exchange_key = %key, "Discarding malformed delayed message");
            continue;
        };
        let _: i64 = ::redis::cmd("LPUSH").arg(target).arg(body).query_async(conn).await?;
    }
    Ok(())
}

#[async_trait]
impl QueueBroker for RedisBroker {
    fn backend(&self) -> &'static str {
        backend::REDIS
    }

    fn supports_delay(&self) -> bool {
        true
    }

    async fn declare_queue(&self, _queue: &str) -> Result<()> {
        // Lists come into existence on first push.
        Ok(())
    }

    async fn declare_delayed_exchange(&self, exchange: &str, queue: &str) -> Result<()> {
        let previous = self.exchanges.insert(exchange.to_string(), queue.to_string());
        if previous.is_none() {
            self.spawn_mover(exchange.to_string(), queue.to_string());
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = ::redis::cmd("LPUSH")
            .arg(queue_key(queue))
            .arg(body)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn publish_delayed(&self, exchange: &str, body: Vec<u8>, delay: Duration) -> Result<()> {
        if !self.exchanges.contains_key(exchange) {
            return Err(EngineError::backend(
                "redis",
                "publish_delayed",
                format!("exchange '{}' is not declared", exchange),
            ));
        }
        let due = now_millis() + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2);
        // Unique prefix so identical bodies are distinct set members.
        let member = format!("{}:{}", uuid::Uuid::new_v4(), BASE64.encode(&body));
        let mut conn = self.conn.clone();
        let _: i64 = ::redis::cmd("ZADD")
            .arg(exchange_key(exchange))
            .arg(due)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
        // BRPOP blocks its connection, so every consumer gets its own.
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let (tx, rx) = mpsc::channel(CONSUMER_BUFFER);
        let mut closed = self.closed.subscribe();
        let queue = queue.to_string();
        let key = queue_key(&queue);

        tokio::spawn(async move {
            let mut brpop = ::redis::cmd("BRPOP");
            brpop.arg(&key).arg(POP_TIMEOUT_SECS);
            loop {
                let popped: Popped = tokio::select! {
                    biased;
                    _ = crate::adapters::until_set(&mut closed) => break,
                    popped = brpop.query_async(&mut conn) => popped,
                };
                match popped {
                    Ok(Some((_, body))) => {
                        if let Err(returned) = tx.send(body).await {
                            // Consumer went away: put the message back where BRPOP takes from.
                            let _: std::result::Result<i64, _> = ::redis::cmd("RPUSH")
                                .arg(&key)
                                .arg(returned.0)
                                .query_async(&mut conn)
                                .await;
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(queue = %queue, error = %e, "BRPOP failed");
                        tokio::time::sleep(ERROR_BACKOFF).await;
                    }
                }
            }
            tracing::debug!(queue = %queue, "Redis consumer stopped");
        });
        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        self.exchanges.clear();
        Ok(())
    }
}

/// Factory for `Redis` brokers. Access: `{url}` or `{host, port, password, db}`.
pub struct RedisQueueFactory;

#[async_trait]
impl AdapterFactory for RedisQueueFactory {
    fn category(&self) -> ResourceType {
        ResourceType::Queue
    }

    fn backend(&self) -> &'static str {
        backend::REDIS
    }

    async fn connect(&self, request: &ConnectRequest<'_>) -> Result<Adapter> {
        let url = redis_url(request.access)
            .ok_or_else(|| request.setup_error("access.url or access.host is required"))?;
        let broker = RedisBroker::connect(&url).await?;
        Ok(Adapter::Queue(Arc::new(broker)))
    }
}
