// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Endpoint dispatch.
//!
//! Middlewares run in the endpoint's order. Each receives the request and returns the
//! request handed to the next step; returning `null` passes it on unchanged and an
//! error stops the chain. The endpoint handler runs under the endpoint timeout.

use std::time::Duration;

use serde_json::Value;
use tracing::{Instrument, debug, error};

use super::Engine;
use crate::descriptor::EndpointConfig;
use crate::error::{EngineError, Result};
use crate::handlers::{HandlerContext, HandlerKind};
use crate::pipeline::debug_span;

impl Engine {
    /// Serve one request for `endpoint` (name or id) on the active generation.
    ///
    /// A handler that outlives the endpoint timeout fails the request with
    /// `endpointTimeout` and asks for this worker to be replaced.
    pub async fn dispatch_endpoint(&self, endpoint: &str, request: Value) -> Result<Value> {
        let (_guard, generation) = self.admit()?;
        let env = generation.environment();
        let config = env.endpoint(endpoint).ok_or_else(|| EngineError::ResourceNotFound {
            name: endpoint.to_string(),
            category: "endpoint".to_string(),
        })?;
        if env.suspended {
            return Err(EngineError::Suspended);
        }

        let ctx = generation.context(&self.inner.config.env_id);
        let span = match request.get("debugChannel").and_then(Value::as_str) {
            Some(channel) => debug_span(channel),
            None => tracing::Span::none(),
        };
        self.run_endpoint(&generation, config, &ctx, request)
            .instrument(span)
            .await
    }

    async fn run_endpoint(
        &self,
        generation: &super::Generation,
        config: &EndpointConfig,
        ctx: &HandlerContext,
        mut request: Value,
    ) -> Result<Value> {
        let env = generation.environment();
        for middleware_id in &config.middlewares {
            let middleware = env.middleware(middleware_id).ok_or_else(|| {
                EngineError::InvalidConfiguration(format!("unknown middleware '{}'", middleware_id))
            })?;
            let handler = generation
                .handlers()
                .resolve(middleware.module_id())
                .await
                .map_err(|e| e.into_engine_error(HandlerKind::Middleware))?;
            let next = handler.call(ctx, request.clone()).await?;
            if !next.is_null() {
                request = next;
            }
            debug!(endpoint = %config.name, middleware = %middleware.name, "Middleware passed");
        }

        let handler = generation
            .handlers()
            .resolve(config.module_id())
            .await
            .map_err(|e| e.into_engine_error(HandlerKind::Endpoint))?;

        let timeout = config
            .timeout
            .map(Duration::from_millis)
            .unwrap_or(self.inner.config.endpoint_timeout);
        match tokio::time::timeout(timeout, handler.call(ctx, request)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(EngineError::Handler {
                code: HandlerKind::Endpoint.execution_error_code().to_string(),
                message: e.to_string(),
                details: serde_json::to_value(e.to_error_message()).ok(),
            }),
            Err(_) => {
                let timeout_ms = timeout.as_millis() as u64;
                error!(
                    endpoint = %config.name,
                    timeout_ms,
                    "Endpoint timed out, requesting worker replacement"
                );
                self.request_termination();
                Err(EngineError::EndpointTimeout {
                    endpoint: config.name.clone(),
                    timeout_ms,
                })
            }
        }
    }
}
