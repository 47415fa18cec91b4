// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that starts periodic drift checks.
//!
//! Ready resources whose last check is missing or older than the TTL get a
//! check, one at a time, each waiting until fewer than the configured
//! number of checks are running. Unlike relationship scheduling a pass
//! stops at the first failure: the failing resource is marked
//! `Detected=False` and the rest wait for the next tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keel_core::models::Resource;
use keel_core::persistence::Store;
use keel_core::status::{ConditionStatus, ConditionType, resource as rs};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::deployer::{Deployer, DeployerRegistry};
use crate::error::{Error, Result};

/// Configuration for the drift scheduler.
#[derive(Debug, Clone)]
pub struct DriftSchedulerConfig {
    /// How often to look for resources due a check.
    pub poll_interval: Duration,
    /// Global switch; a disabled scheduler does nothing.
    pub enabled: bool,
    /// Age after which a check result is stale.
    pub ttl: Duration,
    /// Maximum concurrently running checks.
    pub max_active_jobs: usize,
    /// How often to re-check for a free slot.
    pub wait_interval: Duration,
    /// Give up waiting for a slot after this long.
    pub wait_timeout: Duration,
}

impl Default for DriftSchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            enabled: true,
            ttl: Duration::from_secs(3600),
            max_active_jobs: 10,
            wait_interval: Duration::from_secs(5),
            wait_timeout: Duration::from_secs(3600),
        }
    }
}

/// Background worker dispatching drift checks.
pub struct DriftScheduler {
    store: Arc<dyn Store>,
    deployers: Arc<DeployerRegistry>,
    config: DriftSchedulerConfig,
    shutdown: Arc<Notify>,
    cancel: CancellationToken,
}

impl DriftScheduler {
    /// Create a new drift scheduler.
    pub fn new(
        store: Arc<dyn Store>,
        deployers: Arc<DeployerRegistry>,
        config: DriftSchedulerConfig,
    ) -> Self {
        Self {
            store,
            deployers,
            config,
            shutdown: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Token that aborts a pass in progress, including a wait for a slot.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the scheduler loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            enabled = self.config.enabled,
            max_active_jobs = self.config.max_active_jobs,
            "Drift scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Drift scheduler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.tick(&self.cancel).await {
                        error!(error = %e, "Drift detection pass failed");
                    }
                }
            }
        }

        info!("Drift scheduler stopped");
    }

    /// One pass; returns the number of checks dispatched.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<usize> {
        if !self.config.enabled {
            return Ok(0);
        }

        let ttl = chrono::Duration::from_std(self.config.ttl)
            .map_err(|e| Error::Other(format!("Invalid duration: {}", e)))?;
        let now = Utc::now();
        let due: Vec<Resource> = self
            .store
            .list_resources_by_status(rs::SUMMARY_READY, Some(false))
            .await?
            .into_iter()
            .filter(|r| r.drift_expired(now, ttl))
            .collect();

        if due.is_empty() {
            debug!("No resources due a drift check");
            return Ok(0);
        }
        debug!(count = due.len(), "Resources due a drift check");

        let mut dispatched = 0;
        for mut resource in due {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            rs::set(&mut resource.status, ConditionType::Detected, ConditionStatus::Unknown, "");
            self.store
                .update_resource_status(&resource.id, &resource.status)
                .await?;

            let result = match self.deployers.for_resource(&resource) {
                Ok(deployer) => self.dispatch(deployer.as_ref(), &resource, cancel).await,
                Err(e) => Err(e.into()),
            };

            if let Err(e) = result {
                warn!(resource_id = %resource.id, name = %resource.name, error = %e, "Drift check dispatch failed");
                rs::set(
                    &mut resource.status,
                    ConditionType::Detected,
                    ConditionStatus::False,
                    e.to_string(),
                );
                self.store
                    .update_resource_status(&resource.id, &resource.status)
                    .await?;
                return Err(e);
            }
            dispatched += 1;
        }

        info!(dispatched, "Drift checks dispatched");
        Ok(dispatched)
    }

    async fn dispatch(&self, deployer: &dyn Deployer, resource: &Resource, cancel: &CancellationToken) -> Result<()> {
        self.wait_for_slot(deployer, cancel).await?;
        deployer.detect(resource).await?;
        debug!(resource_id = %resource.id, name = %resource.name, "Drift check dispatched");
        Ok(())
    }

    async fn wait_for_slot(&self, deployer: &dyn Deployer, cancel: &CancellationToken) -> Result<()> {
        let started = tokio::time::Instant::now();
        loop {
            let active = deployer.active_detections().await?;
            if active < self.config.max_active_jobs {
                return Ok(());
            }
            if started.elapsed() >= self.config.wait_timeout {
                return Err(Error::DriftSlotTimeout { active });
            }
            debug!(active, max = self.config.max_active_jobs, "Waiting for a drift detection slot");
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(self.config.wait_interval) => {}
            }
        }
    }
}
