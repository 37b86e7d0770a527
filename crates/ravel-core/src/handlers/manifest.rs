// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handler modules described by JSON manifests in a code directory.
//!
//! `{code_dir}/{module_id}.json`:
//!
//! ```json
//! { "default": { "command": "./bin/send-email", "args": ["--fast"], "env": {"LEVEL": "1"} } }
//! ```
//!
//! The command runs once per invocation with the code directory as working directory.
//! The handler input is written to stdin as JSON; stdout is the result (JSON, or a plain
//! string when it does not parse). A non-zero exit fails the invocation with stderr as
//! the message.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{Export, Handler, HandlerContext, Module, ModuleLoader, ResolveError};
use crate::error::{EngineError, Result};

/// An invocable default export: a command line.
#[derive(Debug, Clone, Deserialize)]
struct CommandSpec {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
}

/// Runs a manifest's command per invocation.
#[derive(Debug)]
struct ProcessHandler {
    module_id: String,
    code_dir: PathBuf,
    spec: CommandSpec,
}

impl ProcessHandler {
    fn program(&self) -> PathBuf {
        let command = Path::new(&self.spec.command);
        if command.is_relative() && self.spec.command.contains('/') {
            self.code_dir.join(command)
        } else {
            command.to_path_buf()
        }
    }
}

#[async_trait]
impl Handler for ProcessHandler {
    async fn call(&self, ctx: &HandlerContext, input: Value) -> Result<Value> {
        let mut command = Command::new(self.program());
        command
            .args(&self.spec.args)
            .current_dir(&self.code_dir)
            .envs(&self.spec.env)
            .env("RAVEL_ENV_ID", &ctx.env_id)
            .env("RAVEL_MODULE_ID", &self.module_id)
            .env("RAVEL_CACHE_TOKEN", &ctx.cache_token)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Timeouts drop the future; the process must not outlive it.
            .kill_on_drop(true);
        if let Some(tracking_id) = &ctx.tracking_id {
            command.env("RAVEL_TRACKING_ID", tracking_id);
        }

        let mut child = command.spawn().map_err(|e| {
            EngineError::handler(
                "handlerSpawnFailed",
                format!(
                    "cannot start '{}' for module '{}': {}",
                    self.spec.command, self.module_id, e
                ),
            )
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            let body = serde_json::to_vec(&input)?;
            let module_id = self.module_id.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&body).await {
                    tracing::debug!(module = %module_id, error = %e, "Handler closed stdin early");
                }
            });
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(EngineError::Handler {
                code: "handlerFailed".to_string(),
                message: if stderr.is_empty() {
                    format!("module '{}' exited with {}", self.module_id, output.status)
                } else {
                    stderr
                },
                details: output.status.code().map(|code| serde_json::json!({"exitCode": code})),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(stdout).unwrap_or_else(|_| Value::String(stdout.to_string())))
    }
}

/// Loads modules from `{code_dir}/{module_id}.json` manifests.
#[derive(Debug, Clone)]
pub struct ManifestModuleLoader {
    code_dir: PathBuf,
}

impl ManifestModuleLoader {
    /// Loader over `code_dir`.
    pub fn new(code_dir: impl AsRef<Path>) -> Self {
        Self {
            code_dir: code_dir.as_ref().to_path_buf(),
        }
    }

    fn manifest_path(&self, module_id: &str) -> Option<PathBuf> {
        let valid = !module_id.is_empty()
            && module_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !module_id.starts_with('.');
        valid.then(|| self.code_dir.join(format!("{}.json", module_id)))
    }
}

#[async_trait]
impl ModuleLoader for ManifestModuleLoader {
    fn name(&self) -> &'static str {
        "manifest"
    }

    async fn load(
        &self,
        module_id: &str,
        cache_token: &str,
    ) -> std::result::Result<Option<Module>, ResolveError> {
        let Some(path) = self.manifest_path(module_id) else {
            return Ok(None);
        };
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ResolveError::Load {
                    module: module_id.to_string(),
                    reason: e.to_string(),
                });
            }
        };
        let manifest: Value = serde_json::from_str(&raw).map_err(|e| ResolveError::Load {
            module: module_id.to_string(),
            reason: format!("invalid manifest: {}", e),
        })?;

        let default = match manifest.get("default") {
            None | Some(Value::Null) => None,
            Some(export) => match serde_json::from_value::<CommandSpec>(export.clone()) {
                Ok(spec) => Some(Export::Function(Arc::new(ProcessHandler {
                    module_id: module_id.to_string(),
                    code_dir: self.code_dir.clone(),
                    spec,
                }))),
                Err(_) => Some(Export::Value(export.clone())),
            },
        };
        tracing::debug!(
            module = %module_id,
            cache_token = %cache_token,
            path = %path.display(),
            "Manifest read"
        );
        Ok(Some(Module { default }))
    }
}
