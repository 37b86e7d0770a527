// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ravel Environment - Worker Supervision
//!
//! This crate keeps the worker process of one environment alive: it launches
//! `ravel-worker`, checks on it with heartbeats, replaces it when it crashes or hangs,
//! and forwards hot-reload triggers to it.
//!
//! # Architecture
//!
//! ```text
//!   Redis pub/sub                     SIGINT / SIGTERM
//!   ravel:reload:{envId}                     │
//!         │                                  ▼
//! ┌───────┼──────────────────────────────────────────────────────────┐
//! │       ▼          ravel-environment (This Crate)                   │
//! │ ┌────────────┐  trigger  ┌────────────┐  launch  ┌────────────┐  │
//! │ │  Reload    │──────────►│ Supervisor │─────────►│  Launcher  │  │
//! │ │  Listener  │           └────────────┘          └────────────┘  │
//! └──────────────────────────────────│───────────────────────────────┘
//!                                    │ stdin/stdout control channel
//!                                    ▼
//!                       ┌─────────────────────────┐
//!                       │      ravel-worker       │
//!                       │   (ravel_core::Engine)  │
//!                       └─────────────────────────┘
//! ```
//!
//! # Control Channel
//!
//! | Message | Sent by | When |
//! |---------|---------|------|
//! | `{"type":"ready","generation":n}` | worker | after start and after every reload |
//! | `{"type":"heartbeat"}` | both | supervisor ping every interval, worker echo |
//! | `{"type":"reload"}` | supervisor | a reload trigger arrived |
//! | `{"type":"shutdown"}` | supervisor | optional alternative to SIGINT |
//!
//! # Worker Lifecycle
//!
//! | Event | Supervisor reaction |
//! |-------|---------------------|
//! | exit with non-zero code or signal | respawn with exponential backoff |
//! | heartbeat unanswered within timeout | SIGTERM, then respawn |
//! | no `ready` within the ready timeout | SIGTERM, then respawn |
//! | exit with code 0 | stop supervising |
//! | supervisor shutdown | SIGINT, SIGKILL after the grace period, no respawn |

pub mod config;
pub mod error;
pub mod launcher;
pub mod reload;
pub mod runtime;
pub mod supervisor;

pub use error::{Result, SupervisorError};
pub use runtime::EnvironmentRuntime;
