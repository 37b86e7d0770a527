// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process broker for single-worker deployments and tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch};

use super::{CONSUMER_BUFFER, QueueBroker};
use crate::adapters::{Adapter, AdapterFactory, ConnectRequest};
use crate::descriptor::{ResourceType, backend};
use crate::error::{EngineError, Result};

/// Messages a queue holds before publishers wait.
const QUEUE_CAPACITY: usize = 10_000;

struct MemoryQueue {
    sender: mpsc::Sender<Vec<u8>>,
    receiver: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

impl MemoryQueue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }
}

/// In-process broker. Each queue is a bounded channel with a single consumer.
pub struct MemoryBroker {
    queues: DashMap<String, Arc<MemoryQueue>>,
    exchanges: DashMap<String, String>,
    closed: watch::Sender<bool>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// An empty broker.
    pub fn new() -> Self {
        Self {
            queues: DashMap::new(),
            exchanges: DashMap::new(),
            closed: watch::Sender::new(false),
        }
    }

    fn queue(&self, name: &str) -> Arc<MemoryQueue> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::new()))
            .clone()
    }

    fn ensure_open(&self, operation: &str) -> Result<()> {
        if *self.closed.borrow() {
            return Err(EngineError::backend("memory broker", operation, "broker is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueBroker for MemoryBroker {
    fn backend(&self) -> &'static str {
        backend::MEMORY
    }

    fn supports_delay(&self) -> bool {
        true
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open("declare_queue")?;
        self.queue(queue);
        Ok(())
    }

    async fn declare_delayed_exchange(&self, exchange: &str, queue: &str) -> Result<()> {
        self.ensure_open("declare_exchange")?;
        self.queue(queue);
        self.exchanges.insert(exchange.to_string(), queue.to_string());
        Ok(())
    }

    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<()> {
        self.ensure_open("publish")?;
        let sender = self.queue(queue).sender.clone();
        sender
            .send(body)
            .await
            .map_err(|_| {
                let message = format!("queue '{}' is closed", queue);
                EngineError::backend("memory broker", "publish", message)
            })
    }

    async fn publish_delayed(&self, exchange: &str, body: Vec<u8>, delay: Duration) -> Result<()> {
        self.ensure_open("publish_delayed")?;
        let queue = self
            .exchanges
            .get(exchange)
            .map(|q| q.value().clone())
            .ok_or_else(|| {
                let message = format!("exchange '{}' is not declared", exchange);
                EngineError::backend("memory broker", "publish_delayed", message)
            })?;
        let sender = self.queue(&queue).sender.clone();
        let mut closed = self.closed.subscribe();

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = crate::adapters::until_set(&mut closed) => {
                    tracing::debug!(queue = %queue, "Dropping delayed message on broker close");
                }
                _ = tokio::time::sleep(delay) => {
                    if sender.send(body).await.is_err() {
                        tracing::warn!(queue = %queue, "Delayed message target queue is gone");
                    }
                }
            }
        });
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
        self.ensure_open("consume")?;
        let mut source = self
            .queue(queue)
            .receiver
            .lock()
            .map_err(|_| EngineError::backend("memory broker", "consume", "queue lock poisoned"))?
            .take()
            .ok_or_else(|| {
                let message = format!("queue '{}' already has a consumer", queue);
                EngineError::backend("memory broker", "consume", message)
            })?;

        let (tx, rx) = mpsc::channel(CONSUMER_BUFFER);
        let mut closed = self.closed.subscribe();
        let queue = queue.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = crate::adapters::until_set(&mut closed) => break,
                    message = source.recv() => {
                        let Some(message) = message else { break };
                        if tx.send(message).await.is_err() {
                            tracing::debug!(queue = %queue, "Consumer dropped, stopping delivery");
                            break;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        self.closed.send_replace(true);
        self.queues.clear();
        self.exchanges.clear();
        Ok(())
    }
}

/// Factory for `Memory` brokers.
pub struct MemoryQueueFactory;

#[async_trait]
impl AdapterFactory for MemoryQueueFactory {
    fn category(&self) -> ResourceType {
        ResourceType::Queue
    }

    fn backend(&self) -> &'static str {
        backend::MEMORY
    }

    async fn connect(&self, _request: &ConnectRequest<'_>) -> Result<Adapter> {
        Ok(Adapter::Queue(Arc::new(MemoryBroker::new())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_then_consume_in_order() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q").await.unwrap();
        broker.publish("q", b"one".to_vec()).await.unwrap();
        broker.publish("q", b"two".to_vec()).await.unwrap();

        let mut rx = broker.consume("q").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"one");
        assert_eq!(rx.recv().await.unwrap(), b"two");

        let err = broker.consume("q").await.unwrap_err();
        assert!(err.to_string().contains("already has a consumer"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_delivery() {
        let broker = MemoryBroker::new();
        broker.declare_delayed_exchange("ex", "q").await.unwrap();
        let mut rx = broker.consume("q").await.unwrap();

        broker
            .publish_delayed("ex", b"later".to_vec(), Duration::from_secs(5))
            .await
            .unwrap();
        broker.publish("q", b"now".to_vec()).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), b"now");
        let started = tokio::time::Instant::now();
        assert_eq!(rx.recv().await.unwrap(), b"later");
        assert!(started.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_undeclared_exchange() {
        let broker = MemoryBroker::new();
        assert!(broker.publish_delayed("nope", vec![], Duration::ZERO).await.is_err());
    }

    #[tokio::test]
    async fn test_close_ends_consumers() {
        let broker = MemoryBroker::new();
        let mut rx = broker.consume("q").await.unwrap();
        broker.close().await.unwrap();
        assert!(rx.recv().await.is_none());
        assert!(broker.publish("q", vec![1]).await.is_err());
    }
}
