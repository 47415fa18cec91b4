// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Keel Orchestrator - Resource Lifecycle Execution
//!
//! This crate turns requested resource transitions into backend jobs, in
//! dependency order, and keeps resource status in line with what the jobs
//! and the external operators report.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                            Callers                                      │
//! │            (ResourceService: create, upgrade, delete, stop, start)     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ request transitions
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                  keel-orchestrator (This Crate)                         │
//! │  ┌──────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐    │
//! │  │ Relationship │  │   Drift     │  │   Status    │  │     Run     │    │
//! │  │  Scheduler   │  │  Scheduler  │  │   Syncer    │  │  Admission  │    │
//! │  └──────┬───────┘  └──────┬──────┘  └──────┬──────┘  └──────▲──────┘    │
//! │         │ dispatch        │ detect         │ query          │ create    │
//! │         ▼                 ▼                ▼                │           │
//! │  ┌─────────────────────────────────┐  ┌──────────┐          │           │
//! │  │     Deployer (Terraform)        │──┼──────────┼──────────┘           │
//! │  └───────────────┬─────────────────┘  │ Operator │                      │
//! │                  │ launch / poll      └──────────┘                      │
//! │                  ▼                                                      │
//! │  ┌─────────────────────────────────┐                                    │
//! │  │  JobRunner (child processes)    │                                    │
//! │  └─────────────────────────────────┘                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                 keel-core stores (SQLite / PostgreSQL)                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Resource lifecycle
//!
//! ```text
//!         create / upgrade / start
//!                  │
//!                  ▼
//!           ┌─────────────┐  dependency failed   ┌─────────────┐
//!           │ Progressing │─────────────────────►│ Progressing │ (error)
//!           └──────┬──────┘                      └─────────────┘
//!                  │ dependencies ready
//!                  ▼
//!           ┌─────────────┐  job failed          ┌──────────────┐
//!           │  Deploying  │─────────────────────►│ DeployFailed │
//!           └──────┬──────┘                      └──────────────┘
//!                  │ job succeeded
//!                  ▼
//!           ┌─────────────┐  operator reports    ┌─────────────┐
//!           │    Ready    │◄────────────────────►│   Unready   │
//!           └──────┬──────┘                      └─────────────┘
//!         delete   │   stop
//!          ┌───────┴────────┐
//!          ▼                ▼
//!    ┌──────────┐     ┌──────────┐
//!    │ Deleting │     │ Stopping │──► Stopped
//!    └────┬─────┘     └──────────┘
//!         │ job succeeded
//!         ▼
//!   (row removed)
//! ```
//!
//! # Configuration
//!
//! The binary reads its configuration from environment variables:
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `KEEL_DATABASE_URL` | Yes | - | `postgres://` or `sqlite:` URL |
//! | `KEEL_DATA_DIR` | No | `.data` | Job directories and logs |
//! | `KEEL_TERRAFORM_BIN` | No | `terraform` | Terraform executable |
//! | `KEEL_RELATIONSHIP_INTERVAL_SECS` | No | `5` | Relationship scheduler tick |
//! | `KEEL_DRIFT_INTERVAL_SECS` | No | `60` | Drift scheduler tick |
//! | `KEEL_DRIFT_DETECTION_ENABLED` | No | `true` | Drift detection switch |
//! | `KEEL_DRIFT_MAX_ACTIVE_JOBS` | No | `10` | Concurrent drift checks |
//! | `KEEL_STATUS_SYNC_INTERVAL_SECS` | No | `60` | Status sync tick |
//! | `KEEL_JOB_TIMEOUT_SECS` | No | `3600` | Wall-clock limit of one job |
//! | `KEEL_WORKER_POOL_SIZE` | No | `8` | Status sync pool size |
//! | `KEEL_OPERATOR_CONCURRENCY` | No | `4` | Calls per connector |
//!
//! # Modules
//!
//! - [`admission`]: Single-flight run creation and run status updates
//! - [`config`]: Configuration from environment variables
//! - [`deployer`]: Deployer trait, registry and the Terraform deployer
//! - [`drift_scheduler`]: Periodic drift checks
//! - [`relationship_scheduler`]: Dependency-ordered apply, destroy and stop
//! - [`runner`]: Detached job execution backends
//! - [`service`]: Resource request operations
//! - [`status_sync`]: Operator status synchronization
//! - [`worker_pool`]: Bounded task pool and per-operator limiter

#![deny(missing_docs)]

/// Run creation and status updates.
pub mod admission;

/// Configuration loaded from environment variables.
pub mod config;

/// Deployers turning resources into backend jobs.
pub mod deployer;

/// Background worker for periodic drift detection.
pub mod drift_scheduler;

/// Error types for orchestrator operations.
pub mod error;

/// Background worker applying, destroying and stopping resources in
/// dependency order.
pub mod relationship_scheduler;

/// Detached job execution backends.
pub mod runner;

/// Embeddable runtime for keel-orchestrator.
pub mod runtime;

/// Resource request operations.
pub mod service;

/// Background worker mirroring operator state into resource status.
pub mod status_sync;

/// Bounded task pool and per-operator limiter.
pub mod worker_pool;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use error::{Error, Result};
pub use runtime::OrchestratorRuntime;
pub use service::ResourceService;
