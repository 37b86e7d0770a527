// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Supervisor control channel.
//!
//! Newline-delimited JSON between the supervisor and a worker: the supervisor writes
//! to the worker's stdin, the worker answers on stdout.
//!
//! | Message | Direction | Meaning |
//! |---------|-----------|---------|
//! | `{"type":"heartbeat"}` | both | liveness ping and its echo |
//! | `{"type":"reload"}` | to worker | reload the environment |
//! | `{"type":"ready","generation":n}` | to supervisor | generation `n` is serving |
//! | `{"type":"shutdown"}` | to worker | shut down gracefully |

use futures::FutureExt;
use futures::future::{BoxFuture, Fuse, FusedFuture};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, warn};

use crate::engine::{Engine, ReloadOutcome};
use crate::error::Result;

/// One control line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ControlMessage {
    /// Liveness ping (supervisor) or its echo (worker).
    Heartbeat,
    /// Reload the environment document.
    Reload,
    /// A generation is active and serving.
    Ready {
        /// Active generation number.
        generation: u64,
    },
    /// Shut down gracefully.
    Shutdown,
}

impl ControlMessage {
    /// Encode as one line, including the trailing newline.
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Decode one line.
    pub fn parse(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

/// Write one message and flush.
pub async fn send<W>(writer: &mut W, message: ControlMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(message.to_line()?.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Why the control loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlExit {
    /// The supervisor asked for shutdown.
    Shutdown,
    /// The control stream closed.
    Closed,
}

/// Serve supervisor commands for `engine` until shutdown or end of stream.
///
/// Unparseable lines and messages meant for the supervisor are logged and ignored.
/// A reload runs alongside the command reader, so heartbeats are echoed while it
/// drains; a reload requested during another one runs once that one finishes. A failed
/// reload is logged; the worker keeps serving the previous generation and reports it as
/// ready. Shutdown and end of stream let a running reload finish first.
pub async fn serve<R, W>(engine: &Engine, reader: R, mut writer: W) -> Result<ControlExit>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    let mut reload: Fuse<BoxFuture<'_, Result<ReloadOutcome>>> = Fuse::terminated();
    let mut queued = false;

    let exit = loop {
        tokio::select! {
            outcome = &mut reload, if !reload.is_terminated() => {
                let generation = active_generation(engine, outcome);
                send(&mut writer, ControlMessage::Ready { generation }).await?;
                if std::mem::take(&mut queued) {
                    reload = engine.reload().boxed().fuse();
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break ControlExit::Closed };
                let Some(message) = parse_line(&line) else { continue };
                debug!(control = ?message, "Control message received");

                match message {
                    ControlMessage::Heartbeat => {
                        send(&mut writer, ControlMessage::Heartbeat).await?
                    }
                    ControlMessage::Reload if reload.is_terminated() => {
                        reload = engine.reload().boxed().fuse();
                    }
                    ControlMessage::Reload => {
                        debug!("Reload already running, queued");
                        queued = true;
                    }
                    ControlMessage::Shutdown => break ControlExit::Shutdown,
                    ControlMessage::Ready { .. } => {
                        warn!("Ignoring ready message sent to the worker");
                    }
                }
            }
        }
    };

    if !reload.is_terminated() {
        debug!("Waiting for the running reload before leaving the control loop");
        let generation = active_generation(engine, (&mut reload).await);
        if exit == ControlExit::Shutdown {
            send(&mut writer, ControlMessage::Ready { generation }).await?;
        }
    }
    Ok(exit)
}

fn parse_line(line: &str) -> Option<ControlMessage> {
    if line.trim().is_empty() {
        return None;
    }
    match ControlMessage::parse(line) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(line = %line, error = %e, "Ignoring malformed control line");
            None
        }
    }
}

/// Generation to report after a reload attempt.
fn active_generation(engine: &Engine, outcome: Result<ReloadOutcome>) -> u64 {
    match outcome {
        Ok(outcome) => outcome.generation(),
        Err(e) => {
            error!(error = %e, "Reload failed, keeping the active generation");
            engine.generation().map(|g| g.number()).unwrap_or_default()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{Value, json};
    use tokio::io::{AsyncWriteExt, BufReader};
    use tokio::sync::Notify;

    use super::*;
    use crate::descriptor::StaticConfigSource;
    use crate::engine::EngineStatus;
    use crate::engine::testing::{self, document, engine};
    use crate::handlers::{StaticCatalog, handler_fn};

    #[test]
    fn test_wire_format() {
        assert_eq!(ControlMessage::Heartbeat.to_line().unwrap(), "{\"type\":\"heartbeat\"}\n");
        assert_eq!(
            ControlMessage::Ready { generation: 3 }.to_line().unwrap(),
            "{\"type\":\"ready\",\"generation\":3}\n"
        );
        assert_eq!(
            ControlMessage::parse(" {\"type\":\"shutdown\"} ").unwrap(),
            ControlMessage::Shutdown
        );
        assert!(ControlMessage::parse("{\"type\":\"explode\"}").is_err());
    }

    #[tokio::test]
    async fn test_serve_commands() {
        let source = Arc::new(StaticConfigSource::new(document("1", false)));
        let engine = engine(source.clone(), StaticCatalog::new()).await.unwrap();

        let (mut supervisor_in, worker_in) = tokio::io::duplex(1024);
        let (worker_out, supervisor_out) = tokio::io::duplex(1024);
        let serving = tokio::spawn({
            let engine = engine.clone();
            async move { serve(&engine, BufReader::new(worker_in), worker_out).await }
        });
        let mut replies = BufReader::new(supervisor_out).lines();

        supervisor_in.write_all(b"{\"type\":\"heartbeat\"}\nnot json\n").await.unwrap();
        let reply = replies.next_line().await.unwrap().unwrap();
        assert_eq!(ControlMessage::parse(&reply).unwrap(), ControlMessage::Heartbeat);

        source.replace(document("2", false));
        supervisor_in.write_all(b"{\"type\":\"reload\"}\n").await.unwrap();
        let reply = replies.next_line().await.unwrap().unwrap();
        assert_eq!(ControlMessage::parse(&reply).unwrap(), ControlMessage::Ready { generation: 2 });

        supervisor_in.write_all(b"{\"type\":\"shutdown\"}\n").await.unwrap();
        assert_eq!(serving.await.unwrap().unwrap(), ControlExit::Shutdown);

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_heartbeats_answered_during_reload() {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let (started_in, release_in) = (started.clone(), release.clone());
        let catalog = StaticCatalog::new().with_handler(
            "hold",
            handler_fn(move |_ctx, _req| {
                let (started, release) = (started_in.clone(), release_in.clone());
                async move {
                    started.notify_one();
                    release.notified().await;
                    Ok(Value::Null)
                }
            }),
        );
        let mut doc = document("1", false);
        let hold = json!({"iid": "e-9", "name": "hold", "module": "hold"});
        doc.endpoints.push(serde_json::from_value(hold).unwrap());
        let source = Arc::new(StaticConfigSource::new(doc.clone()));
        let engine = engine(source.clone(), catalog).await.unwrap();

        // An in-flight request keeps the reload draining until it is released.
        let request = tokio::spawn({
            let engine = engine.clone();
            async move { engine.dispatch_endpoint("hold", testing::request(Value::Null)).await }
        });
        started.notified().await;

        let (mut supervisor_in, worker_in) = tokio::io::duplex(1024);
        let (worker_out, supervisor_out) = tokio::io::duplex(1024);
        let serving = tokio::spawn({
            let engine = engine.clone();
            async move { serve(&engine, BufReader::new(worker_in), worker_out).await }
        });
        let mut replies = BufReader::new(supervisor_out).lines();

        doc.timestamp = Some("2".to_string());
        source.replace(doc);
        supervisor_in.write_all(b"{\"type\":\"reload\"}\n").await.unwrap();
        let mut status = engine.subscribe_status();
        status.wait_for(|s| *s == EngineStatus::Initializing).await.unwrap();

        supervisor_in.write_all(b"{\"type\":\"heartbeat\"}\n").await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(1), replies.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(ControlMessage::parse(&reply).unwrap(), ControlMessage::Heartbeat);

        release.notify_one();
        request.await.unwrap().unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), replies.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(ControlMessage::parse(&reply).unwrap(), ControlMessage::Ready { generation: 2 });

        supervisor_in.write_all(b"{\"type\":\"shutdown\"}\n").await.unwrap();
        assert_eq!(serving.await.unwrap().unwrap(), ControlExit::Shutdown);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_closed_stream() {
        let source = Arc::new(StaticConfigSource::new(document("1", false)));
        let engine = engine(source, StaticCatalog::new()).await.unwrap();
        let exit = serve(&engine, BufReader::new(&b""[..]), tokio::io::sink()).await.unwrap();
        assert_eq!(exit, ControlExit::Closed);
        engine.shutdown().await;
    }
}
