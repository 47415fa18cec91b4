// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Keel Orchestrator - infrastructure resource reconciliation service
//!
//! Runs the background workers against a SQLite or PostgreSQL store:
//! - Relationship scheduler (apply, destroy and stop in dependency order)
//! - Drift scheduler (periodic refresh-only plans)
//! - Terraform deployer backed by local child processes

use std::str::FromStr;
use std::sync::Arc;

use keel_core::bus::Bus;
use keel_core::persistence::Store;
use keel_core::{PostgresStore, SqliteStore, migrations};
use keel_orchestrator::admission::RunAdmissionManager;
use keel_orchestrator::config::Config;
use keel_orchestrator::deployer::{TerraformConfig, TerraformDeployer};
use keel_orchestrator::runner::{JobRunner, ProcessJobRunner};
use keel_orchestrator::runtime::OrchestratorRuntime;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keel_orchestrator=info,keel_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        data_dir = %config.data_dir.display(),
        terraform_bin = %config.terraform_bin,
        drift_detection = config.drift_detection_enabled,
        "Starting Keel Orchestrator"
    );

    let store = connect(&config.database_url).await?;
    info!("Database schema verified");

    let runner = Arc::new(ProcessJobRunner::new());
    info!(runner_type = runner.runner_type(), "Runner initialized");

    let bus = Bus::new();
    let admission = Arc::new(RunAdmissionManager::new(store.clone(), bus.clone()));
    let deployer = TerraformDeployer::new(
        store.clone(),
        admission,
        runner,
        TerraformConfig {
            data_dir: config.data_dir.clone(),
            terraform_bin: config.terraform_bin.clone(),
            job_timeout: config.job_timeout,
            ..Default::default()
        },
    );

    let runtime = OrchestratorRuntime::builder()
        .store(store)
        .bus(bus)
        .deployer(Arc::new(deployer))
        .relationship_poll_interval(config.relationship_interval)
        .drift_poll_interval(config.drift_interval)
        .drift_detection_enabled(config.drift_detection_enabled)
        .drift_max_active_jobs(config.drift_max_active_jobs)
        .status_sync_interval(config.status_sync_interval)
        .worker_pool_size(config.worker_pool_size)
        .operator_concurrency(config.operator_concurrency)
        .build()?
        .start()
        .await?;

    info!("Orchestrator ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Keel Orchestrator shut down");

    Ok(())
}

/// Open the store named by the URL scheme and bring its schema up to date.
async fn connect(database_url: &str) -> anyhow::Result<Arc<dyn Store>> {
    if database_url.starts_with("postgres://") || database_url.starts_with("postgresql://") {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        info!("Connected to PostgreSQL");
        migrations::run_postgres(&pool).await?;
        return Ok(Arc::new(PostgresStore::new(pool)));
    }

    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    info!("Connected to SQLite");
    migrations::run_sqlite(&pool).await?;
    Ok(Arc::new(SqliteStore::new(pool)))
}
