// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ravel Core - Multi-tenant Backend Runtime
//!
//! This crate runs one deployed environment: it connects the environment's resources,
//! resolves handler modules, processes queue messages and scheduled tasks, serves
//! endpoints, and reloads all of it in place when the environment changes.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        ravel-environment                              │
//! │        (spawns, heartbeats and reloads the worker over stdio)         │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                  │ control channel
//!                                  ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  ravel-worker: Engine                                                 │
//! │  ┌────────────────────────── Generation ──────────────────────────┐   │
//! │  │ AdapterRegistry   HandlerRegistry   Pipeline (queues, tasks)   │   │
//! │  └────────────────────────────────────────────────────────────────┘   │
//! └──────────────────────────────────────────────────────────────────────┘
//!        │                 │                    │
//!        ▼                 ▼                    ▼
//!   Databases        Caches / Brokers      Tracking store
//!   (PG, MySQL,      (Redis, Memory)       (PostgreSQL or SQLite)
//!    SQLite)         Storage (S3, Local)
//! ```
//!
//! # Resource categories
//!
//! | Category | Backends | Capability |
//! |----------|----------|------------|
//! | database | `PostgreSQL`, `MySQL`, `SQLite` | [`adapters::DatabaseAdapter`] + [`query`] |
//! | cache | `Redis`, `Memory` | [`adapters::CacheAdapter`] |
//! | queue | `Redis`, `Memory` | [`adapters::QueueBroker`] |
//! | scheduler | `Cron` | [`adapters::SchedulerAdapter`] |
//! | storage | `AWS S3`, `MinIO`, `Local` | [`adapters::StorageAdapter`] |
//! | realtime | `Redis`, `Memory` | [`adapters::RealtimeAdapter`] |
//!
//! # Message lifecycle
//!
//! ```text
//! send_message ──► tracking: pending ──► broker ──► listener
//!                                                      │
//!                       tracking: processing ◄─────────┘
//!                                │
//!                         handler invoked
//!                                │
//!               tracking: completed | errors (terminal)
//! ```
//!
//! # Modules
//!
//! - [`descriptor`]: environment documents and resource descriptors
//! - [`adapters`]: capability traits and backend implementations
//! - [`registry`]: live adapter handles per environment
//! - [`query`]: cross-dialect SQL builder
//! - [`handlers`]: handler modules and their resolution
//! - [`tracking`]: tracking records and execution logs
//! - [`pipeline`]: queue and task processing
//! - [`engine`]: generations, readiness and hot reload
//! - [`control`]: supervisor control channel

pub mod adapters;
pub mod config;
pub mod control;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod migrations;
pub mod pipeline;
pub mod query;
pub mod registry;
pub mod tracking;

pub use engine::{Engine, EngineStatus};
pub use error::{EngineError, Result};
