// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Keel Core - resource model, dependency graph and stores
//!
//! This crate holds everything the orchestrator needs that does not execute
//! anything: the resource/run model with its condition-based status, the
//! dependency graph built from attribute interpolation, relationship row
//! derivation, and durable stores for SQLite and PostgreSQL.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         keel-orchestrator                               │
//! │   (Admission, Deployers, Relationship/Drift schedulers, Status sync)    │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                │                     │                      │
//!                ▼                     ▼                      ▼
//! ┌───────────────────────┐ ┌─────────────────────┐ ┌────────────────────┐
//! │  graph / relationship │ │  status (walker)    │ │  bus               │
//! │  sort, cycles, paths  │ │  conditions→summary │ │  RunChangedEvent   │
//! └───────────────────────┘ └─────────────────────┘ └────────────────────┘
//!                │
//!                ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │          persistence: ResourceStore + RunStore (SQLite, PostgreSQL)     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`graph`] | `${res.<name>.<field>}` parsing, [`graph::DependencyGraph`] (Kahn sort, cycle path) |
//! | [`status`] | [`status::Status`], conditions, the summary walker, resource/run transitions |
//! | [`models`] | [`models::Resource`], [`models::Run`], [`models::Relationship`] |
//! | [`relationship`] | Relationship row derivation and runtime cycle detection |
//! | [`state`] | Provider and output extraction from the backend state blob |
//! | [`persistence`] | Store traits and backends |
//! | [`bus`] | In-process run change notifications |
//!
//! # Single-flight runs
//!
//! The `runs` table carries a unique partial index on `resource_id` for rows
//! in state `Unknown`. [`persistence::RunStore::create_run`] checks and
//! inserts inside one transaction, so two concurrent admissions for the same
//! resource cannot both succeed.

#![deny(missing_docs)]

pub mod bus;
pub mod error;
pub mod graph;
pub mod migrations;
pub mod models;
pub mod persistence;
pub mod relationship;
pub mod state;
pub mod status;

pub use error::{CoreError, Result};
pub use graph::{CycleError, DependencyGraph};
pub use persistence::{PostgresStore, ResourceStore, RunStore, SqliteStore, Store};
