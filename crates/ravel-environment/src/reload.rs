// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reload triggers over Redis pub/sub.
//!
//! Deployments publish on `ravel:reload:{envId}`; every message on the channel asks
//! the worker to reload. The payload is ignored.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::supervisor::ReloadTrigger;

/// Delay before resubscribing after the connection drops.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Pub/sub channel carrying reload triggers for `env_id`.
pub fn reload_channel(env_id: &str) -> String {
    format!("ravel:reload:{}", env_id)
}

/// Background worker that forwards pub/sub reload triggers to the supervisor.
pub struct ReloadListener {
    client: redis::Client,
    channel: String,
    trigger: ReloadTrigger,
    reconnect_delay: Duration,
    shutdown: Arc<Notify>,
}

impl ReloadListener {
    /// Create a listener for `env_id` on the Redis server at `url`.
    pub fn new(url: &str, env_id: &str, trigger: ReloadTrigger) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
            channel: reload_channel(env_id),
            trigger,
            reconnect_delay: RECONNECT_DELAY,
            shutdown: Arc::new(Notify::new()),
        })
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the listener loop, resubscribing after connection loss.
    pub async fn run(&self) {
        info!(channel = %self.channel, "Reload listener started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => break,

                result = self.listen() => {
                    match result {
                        Ok(()) => warn!(channel = %self.channel, "Reload subscription ended"),
                        Err(e) => {
                            warn!(channel = %self.channel, error = %e, "Reload subscription failed")
                        }
                    }
                }
            }

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => break,
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }

        info!("Reload listener stopped");
    }

    async fn listen(&self) -> redis::RedisResult<()> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;
        debug!(channel = %self.channel, "Subscribed to reload triggers");

        let mut messages = pubsub.on_message();
        while messages.next().await.is_some() {
            info!(channel = %self.channel, "Reload triggered");
            self.trigger.trigger();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::{LaunchOptions, MockLauncher};
    use crate::supervisor::{Supervisor, SupervisorConfig, WorkerState};

    #[test]
    fn test_reload_channel() {
        assert_eq!(reload_channel("env-42"), "ravel:reload:env-42");
    }

    #[tokio::test]
    async fn test_shutdown_while_unreachable() {
        let supervisor = Supervisor::new(
            Arc::new(MockLauncher::new()),
            LaunchOptions::new("env-1", "mock"),
            SupervisorConfig::default(),
        );
        let unreachable = "redis://127.0.0.1:1";
        let trigger = supervisor.reload_trigger();
        let listener = Arc::new(ReloadListener::new(unreachable, "env-1", trigger).unwrap());
        let task = tokio::spawn({
            let listener = listener.clone();
            async move { listener.run().await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        listener.shutdown_handle().notify_one();
        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }

    /// Runs against a live server when TEST_REDIS_URL is set.
    #[tokio::test]
    async fn test_publish_triggers_reload() {
        let Ok(url) = std::env::var("TEST_REDIS_URL") else {
            eprintln!("Skipping test: TEST_REDIS_URL not set");
            return;
        };
        let stamp = chrono::Utc::now().timestamp_micros();
        let env_id = format!("test-{}-{}", std::process::id(), stamp);

        let launcher = MockLauncher::new();
        let supervisor = Arc::new(Supervisor::new(
            Arc::new(launcher.clone()),
            LaunchOptions::new(&env_id, "mock"),
            SupervisorConfig::default(),
        ));
        let supervising = tokio::spawn({
            let supervisor = supervisor.clone();
            async move { supervisor.run().await }
        });
        let listener =
            Arc::new(ReloadListener::new(&url, &env_id, supervisor.reload_trigger()).unwrap());
        let listening = tokio::spawn({
            let listener = listener.clone();
            async move { listener.run().await }
        });

        let mut state = supervisor.subscribe();
        state
            .wait_for(|s| *s == WorkerState::Running { generation: 1 })
            .await
            .unwrap();
        // Give the subscription time to register
        tokio::time::sleep(Duration::from_millis(200)).await;

        let client = redis::Client::open(url.as_str()).unwrap();
        let mut conn = client.get_multiplexed_async_connection().await.unwrap();
        let _: i64 = redis::cmd("PUBLISH")
            .arg(reload_channel(&env_id))
            .arg("deploy")
            .query_async(&mut conn)
            .await
            .unwrap();

        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == WorkerState::Running { generation: 2 }),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(launcher.reloads(), 1);

        listener.shutdown_handle().notify_one();
        supervisor.shutdown_handle().notify_one();
        listening.await.unwrap();
        supervising.await.unwrap();
    }
}
