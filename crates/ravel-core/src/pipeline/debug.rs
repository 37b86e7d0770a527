// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Debug-channel relay.
//!
//! A message submitted with a debug channel is processed inside a `debug_channel` span.
//! [`DebugRelayLayer`] forwards every event recorded inside such a span to a receiver,
//! which the engine publishes on the realtime bus. The span ends with the message, so
//! diagnostics of later messages are never relayed to the wrong channel, whichever way
//! the handler finished.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;

use crate::adapters::RealtimeAdapter;

/// Name of the span carrying a debug channel.
pub const DEBUG_SPAN: &str = "debug_channel";

/// Span whose events are relayed to `channel`.
pub fn debug_span(channel: &str) -> tracing::Span {
    tracing::info_span!("debug_channel", channel = %channel)
}

/// One relayed diagnostic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DebugEvent {
    /// Realtime channel.
    #[serde(skip)]
    pub channel: String,
    /// Level name.
    pub level: String,
    /// Event target (module path).
    pub target: String,
    /// Formatted message.
    pub message: String,
    /// Remaining structured fields.
    pub fields: Map<String, Value>,
    /// RFC 3339 timestamp.
    pub timestamp: String,
}

/// Channel name stored in the extensions of a `debug_channel` span.
struct DebugChannel(String);

#[derive(Default)]
struct JsonVisitor {
    fields: Map<String, Value>,
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.fields
            .insert(field.name().to_string(), Value::String(format!("{:?}", value)));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.fields.insert(field.name().to_string(), Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), Value::Bool(value));
    }
}

/// Forwards events inside `debug_channel` spans.
pub struct DebugRelayLayer {
    sender: mpsc::UnboundedSender<DebugEvent>,
}

/// A relay layer and the receiving end of its events.
pub fn debug_relay() -> (DebugRelayLayer, mpsc::UnboundedReceiver<DebugEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (DebugRelayLayer { sender }, receiver)
}

impl<S> Layer<S> for DebugRelayLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        if attrs.metadata().name() != DEBUG_SPAN {
            return;
        }
        let mut visitor = JsonVisitor::default();
        attrs.record(&mut visitor);
        if let Some(Value::String(channel)) = visitor.fields.remove("channel")
            && let Some(span) = ctx.span(id)
        {
            span.extensions_mut().insert(DebugChannel(channel));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(scope) = ctx.event_scope(event) else {
            return;
        };
        let channel = scope
            .into_iter()
            .find_map(|span| span.extensions().get::<DebugChannel>().map(|c| c.0.clone()));
        let Some(channel) = channel else {
            return;
        };

        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);
        let message = match visitor.fields.remove("message") {
            Some(Value::String(message)) => message,
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let metadata = event.metadata();
        // The receiver is gone only during process exit.
        let _ = self.sender.send(DebugEvent {
            channel,
            level: metadata.level().to_string(),
            target: metadata.target().to_string(),
            message,
            fields: visitor.fields,
            timestamp: Utc::now().to_rfc3339(),
        });
    }
}

/// Publish relayed events until the layer is dropped.
///
/// `realtime` is asked for the current bus per event, so the relay follows reloads.
/// Events are dropped while no realtime resource is configured.
pub async fn forward_events<F>(mut events: mpsc::UnboundedReceiver<DebugEvent>, realtime: F)
where
    F: Fn() -> Option<Arc<dyn RealtimeAdapter>>,
{
    while let Some(event) = events.recv().await {
        let Some(bus) = realtime() else {
            continue;
        };
        let payload = match serde_json::to_value(&event) {
            Ok(payload) => payload,
            Err(_) => continue,
        };
        if let Err(e) = bus.broadcast(&event.channel, &payload).await {
            // Outside any debug span, so this is not relayed again.
            tracing::warn!(channel = %event.channel, error = %e, "Debug relay broadcast failed");
        }
    }
}
