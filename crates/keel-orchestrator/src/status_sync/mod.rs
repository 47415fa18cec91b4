// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operator status synchronization.
//!
//! Settled resources that belong to a connector are periodically asked
//! about through that connector's [`Operator`], and the answer lands in the
//! resource's `Ready` condition. Work is split into buckets run by a
//! bounded [`WorkerPool`]; calls to the same connector are further capped
//! by an [`OperatorLimiter`].

pub mod mock;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_core::models::Resource;
use keel_core::persistence::Store;
use keel_core::status::{ConditionStatus, ConditionType, resource as rs};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{Error, MultiError, Result};
use crate::worker_pool::{OperatorLimiter, WorkerPool};

pub use mock::{MockOperator, MockOperatorFactory};

/// Message reported for resources whose operator cannot be reached.
pub const UNREACHABLE_MESSAGE: &str = "operator unreachable";

/// Connection to the system that runs the deployed workloads of one
/// connector.
#[async_trait]
pub trait Operator: Send + Sync {
    /// Whether the backend answers.
    async fn is_connected(&self) -> bool;

    /// Observed readiness of a resource and a message describing it.
    async fn resource_state(
        &self,
        resource: &Resource,
    ) -> std::result::Result<(ConditionStatus, String), String>;
}

/// Builds an [`Operator`] for a connector id.
#[async_trait]
pub trait OperatorFactory: Send + Sync {
    /// Connect to the operator behind `connector_id`.
    async fn build(&self, connector_id: &str) -> Result<Arc<dyn Operator>>;
}

/// Stand-in for an operator that could not be built or reached.
///
/// Reports every resource as transitioning instead of failed.
pub struct UnreachableOperator;

#[async_trait]
impl Operator for UnreachableOperator {
    async fn is_connected(&self) -> bool {
        false
    }

    async fn resource_state(
        &self,
        _resource: &Resource,
    ) -> std::result::Result<(ConditionStatus, String), String> {
        Ok((ConditionStatus::Unknown, UNREACHABLE_MESSAGE.to_string()))
    }
}

const SYNCED_SUMMARIES: [&str; 3] = [rs::SUMMARY_READY, rs::SUMMARY_UNREADY, rs::SUMMARY_PREPARING];

/// Configuration for the status syncer.
#[derive(Debug, Clone)]
pub struct StatusSyncerConfig {
    /// Time between passes.
    pub poll_interval: Duration,
    /// Resources handled by one pool task.
    pub bucket_size: usize,
    /// Pool size.
    pub pool_size: usize,
    /// Concurrent calls per connector.
    pub operator_concurrency: usize,
}

impl Default for StatusSyncerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            bucket_size: 10,
            pool_size: 8,
            operator_concurrency: 4,
        }
    }
}

/// Background worker mirroring operator state into resource status.
pub struct StatusSyncer {
    store: Arc<dyn Store>,
    factory: Arc<dyn OperatorFactory>,
    config: StatusSyncerConfig,
    pool: WorkerPool,
    limiter: Arc<OperatorLimiter>,
    shutdown: Arc<Notify>,
    cancel: CancellationToken,
}

impl StatusSyncer {
    /// Create a new status syncer.
    pub fn new(
        store: Arc<dyn Store>,
        factory: Arc<dyn OperatorFactory>,
        config: StatusSyncerConfig,
    ) -> Self {
        let pool = WorkerPool::new(config.pool_size);
        let limiter = Arc::new(OperatorLimiter::new(config.operator_concurrency));
        Self {
            store,
            factory,
            config,
            pool,
            limiter,
            shutdown: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Token that stops submitting buckets of a pass in progress.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the sync loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            bucket_size = self.config.bucket_size,
            pool_size = self.pool.size(),
            "Status syncer started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Status syncer received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.tick(&self.cancel).await {
                        error!(error = %e, "Status sync pass failed");
                    }
                }
            }
        }

        info!("Status syncer stopped");
    }

    /// One pass over every settled resource with a connector.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<()> {
        let mut resources = Vec::new();
        for summary in SYNCED_SUMMARIES {
            resources.extend(
                self.store
                    .list_resources_by_status(summary, None)
                    .await?
                    .into_iter()
                    .filter(|r| r.connector_id.is_some()),
            );
        }
        if resources.is_empty() {
            return Ok(());
        }

        let operators = self.operators(&resources).await;
        debug!(
            resources = resources.len(),
            connectors = operators.len(),
            "Syncing operator status"
        );

        let mut errs = MultiError::new();
        let bucket_size = self.config.bucket_size.max(1);
        let mut resources = resources.into_iter().peekable();
        while resources.peek().is_some() {
            if cancel.is_cancelled() {
                errs.push(Error::Cancelled);
                break;
            }
            let bucket: Vec<Resource> = resources.by_ref().take(bucket_size).collect();
            let store = self.store.clone();
            let limiter = self.limiter.clone();
            let operators = operators.clone();
            errs.record(
                self.pool
                    .submit(sync_bucket(store, limiter, operators, bucket))
                    .await,
            );
        }

        errs.record(self.pool.wait().await);
        errs.into_result()
    }

    async fn operators(&self, resources: &[Resource]) -> Arc<HashMap<String, Arc<dyn Operator>>> {
        let mut operators: HashMap<String, Arc<dyn Operator>> = HashMap::new();
        for connector_id in resources.iter().filter_map(|r| r.connector_id.as_deref()) {
            if operators.contains_key(connector_id) {
                continue;
            }
            let operator: Arc<dyn Operator> = match self.factory.build(connector_id).await {
                Ok(op) => {
                    if op.is_connected().await {
                        op
                    } else {
                        warn!(connector_id, "Operator is not connected, treating as unreachable");
                        Arc::new(UnreachableOperator)
                    }
                }
                Err(e) => {
                    warn!(connector_id, error = %e, "Failed to build operator, treating as unreachable");
                    Arc::new(UnreachableOperator)
                }
            };
            operators.insert(connector_id.to_string(), operator);
        }
        Arc::new(operators)
    }
}

async fn sync_bucket(
    store: Arc<dyn Store>,
    limiter: Arc<OperatorLimiter>,
    operators: Arc<HashMap<String, Arc<dyn Operator>>>,
    bucket: Vec<Resource>,
) -> Result<()> {
    let mut errs = MultiError::new();
    for resource in bucket {
        let Some(connector_id) = resource.connector_id.clone() else {
            continue;
        };
        let Some(operator) = operators.get(&connector_id) else {
            continue;
        };
        errs.record(sync_one(store.as_ref(), &limiter, operator.as_ref(), &connector_id, resource).await);
    }
    errs.into_result()
}

async fn sync_one(
    store: &dyn Store,
    limiter: &OperatorLimiter,
    operator: &dyn Operator,
    connector_id: &str,
    resource: Resource,
) -> Result<()> {
    let observed = {
        let _permit = limiter.acquire(connector_id).await?;
        operator.resource_state(&resource).await
    };
    let (value, message) = match observed {
        Ok(state) => state,
        Err(e) => {
            warn!(resource_id = %resource.id, connector_id, error = %e, "Operator status query failed");
            (ConditionStatus::Unknown, e)
        }
    };

    // Requests written during the query win over the listed snapshot.
    let Some(mut resource) = store.get_resource(&resource.id).await? else {
        return Ok(());
    };
    if !SYNCED_SUMMARIES.contains(&resource.status.summary.summary.as_str()) {
        debug!(
            resource_id = %resource.id,
            summary = %resource.status.summary.summary,
            "Resource left the settled states during the query, skipping"
        );
        return Ok(());
    }

    if rs::set(&mut resource.status, ConditionType::Ready, value, message) {
        debug!(
            resource_id = %resource.id,
            name = %resource.name,
            summary = %resource.status.summary.summary,
            "Resource readiness changed"
        );
        store
            .update_resource_status(&resource.id, &resource.status)
            .await?;
    }
    Ok(())
}
