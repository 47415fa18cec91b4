// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that moves pending resources through their
//! dependency gates.
//!
//! Each pass runs three independent checkers over the store:
//!
//! - **apply**: `Progressing` resources wait until every dependency is
//!   `Ready`, then the deployer's apply is dispatched. A dependency that
//!   failed, is being deleted or is stopped blocks the resource until an
//!   operator acts.
//! - **destroy**: `Deleting` resources wait until no dependant is deployed.
//! - **stop**: resources with a pending stop wait the same way.
//!
//! A resource whose previous run is still in flight keeps waiting; the
//! request is retried once that run finishes.
//!
//! A failure on one resource never stops the pass; failures are merged and
//! returned together. The pass keeps no state between ticks, everything is
//! re-read from the store. A finished run wakes the worker early.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use keel_core::bus::{RunChangedEvent, RunEventHandler};
use keel_core::error::CoreError;
use keel_core::models::{JobType, Resource};
use keel_core::persistence::Store;
use keel_core::relationship;
use keel_core::status::{ConditionStatus, ConditionType, Status, resource as rs};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::deployer::{self, DeployOptions, DeployerError, DeployerRegistry};
use crate::error::{Error, MultiError, Result};

const RUN_IN_FLIGHT_MESSAGE: &str = "Waiting for the running deployment to finish";

/// Configuration for the relationship scheduler.
#[derive(Debug, Clone)]
pub struct RelationshipSchedulerConfig {
    /// How often to run a pass when nothing wakes the worker.
    pub poll_interval: Duration,
}

impl Default for RelationshipSchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Background worker gating apply, destroy and stop on relationships.
pub struct RelationshipScheduler {
    store: Arc<dyn Store>,
    deployers: Arc<DeployerRegistry>,
    config: RelationshipSchedulerConfig,
    shutdown: Arc<Notify>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
}

impl RelationshipScheduler {
    /// Create a new relationship scheduler.
    pub fn new(
        store: Arc<dyn Store>,
        deployers: Arc<DeployerRegistry>,
        config: RelationshipSchedulerConfig,
    ) -> Self {
        Self {
            store,
            deployers,
            config,
            shutdown: Arc::new(Notify::new()),
            wake: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Token that aborts a pass in progress.
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Bus handler that wakes the worker when a run finishes.
    pub fn waker(&self) -> Arc<dyn RunEventHandler> {
        Arc::new(RunFinishedWaker {
            wake: self.wake.clone(),
        })
    }

    /// Run the scheduler loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Relationship scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Relationship scheduler received shutdown signal");
                    break;
                }

                _ = self.wake.notified() => {
                    debug!("Relationship scheduler woken by run change");
                    self.run_pass().await;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.run_pass().await;
                }
            }
        }

        info!("Relationship scheduler stopped");
    }

    async fn run_pass(&self) {
        if let Err(e) = self.tick(&self.cancel).await {
            error!(error = %e, "Relationship scheduling pass failed");
        }
    }

    /// One pass of all three checkers.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<()> {
        let mut errs = MultiError::new();
        errs.record(self.apply_resources(cancel).await);
        errs.record(self.destroy_resources(cancel).await);
        errs.record(self.stop_resources(cancel).await);
        errs.into_result()
    }

    /// Dispatch apply for pending resources whose dependencies are ready.
    pub async fn apply_resources(&self, cancel: &CancellationToken) -> Result<()> {
        let resources = self
            .store
            .list_resources_by_status(rs::SUMMARY_PROGRESSING, Some(true))
            .await?;

        let mut errs = MultiError::new();
        for mut resource in resources {
            if cancel.is_cancelled() {
                errs.push(Error::Cancelled);
                break;
            }
            // A pending stop belongs to the stop checker.
            if resource.status.is_unknown(ConditionType::Stopped) {
                continue;
            }
            if let Err(e) = self.apply_one(&mut resource).await {
                warn!(resource_id = %resource.id, name = %resource.name, error = %e, "Failed to apply resource");
                errs.push(e);
            }
        }
        errs.into_result()
    }

    /// Dispatch destroy for deleting resources without deployed dependants.
    pub async fn destroy_resources(&self, cancel: &CancellationToken) -> Result<()> {
        let resources = self
            .store
            .list_resources_by_status(rs::SUMMARY_DELETING, None)
            .await?;

        let mut errs = MultiError::new();
        for mut resource in resources {
            if cancel.is_cancelled() {
                errs.push(Error::Cancelled);
                break;
            }
            if resource.status.is_true(ConditionType::Progressing) {
                continue;
            }
            if let Err(e) = self.teardown_one(&mut resource, JobType::Destroy).await {
                warn!(resource_id = %resource.id, name = %resource.name, error = %e, "Failed to destroy resource");
                errs.push(e);
            }
        }
        errs.into_result()
    }

    /// Dispatch stop for resources with a pending stop and no deployed
    /// dependants.
    pub async fn stop_resources(&self, cancel: &CancellationToken) -> Result<()> {
        let resources = self
            .store
            .list_resources_by_status(rs::SUMMARY_PROGRESSING, None)
            .await?;

        let mut errs = MultiError::new();
        for mut resource in resources {
            if cancel.is_cancelled() {
                errs.push(Error::Cancelled);
                break;
            }
            if !resource.status.is_unknown(ConditionType::Stopped)
                || resource.status.is_true(ConditionType::Progressing)
            {
                continue;
            }
            if let Err(e) = self.teardown_one(&mut resource, JobType::Stop).await {
                warn!(resource_id = %resource.id, name = %resource.name, error = %e, "Failed to stop resource");
                errs.push(e);
            }
        }
        errs.into_result()
    }

    async fn apply_one(&self, resource: &mut Resource) -> Result<()> {
        let dependencies = self.store.get_dependencies(&resource.id).await?;
        if let Some(row) = dependencies.iter().find(|r| r.has_cycle()) {
            return Err(Error::CycleDetected {
                resource_id: resource.id.clone(),
                path: row.path_string(),
            });
        }

        let mut waiting = Vec::new();
        for id in relationship::dependency_ids(&dependencies) {
            let Some(dep) = self.store.get_resource(&id).await? else {
                let message = format!("Dependency resource \"{}\" no longer exists, please check it", id);
                return self.block(resource, &message).await;
            };
            if let Some(reason) = blocking_reason(&dep.status) {
                let message = format!("Dependency resource \"{}\" {}, please check it", dep.name, reason);
                return self.block(resource, &message).await;
            }
            if !rs::is_ready(&dep.status) {
                waiting.push(dep.name);
            }
        }

        if !waiting.is_empty() {
            waiting.sort();
            let message = format!(
                "Waiting for dependent resources to be ready: {}",
                waiting.join(", ")
            );
            return self.wait(resource, JobType::Apply, &message).await;
        }

        self.launch(resource, JobType::Apply).await
    }

    async fn teardown_one(&self, resource: &mut Resource, job_type: JobType) -> Result<()> {
        let mut blocking: Vec<String> = self
            .store
            .get_dependants(&resource.id)
            .await?
            .into_iter()
            .filter(|d| rs::is_deployed(&d.status))
            .map(|d| d.name)
            .collect();

        if !blocking.is_empty() {
            blocking.sort();
            let state = match job_type {
                JobType::Stop => "stopped",
                JobType::Apply | JobType::Destroy => "deleted",
            };
            let message = format!("Waiting for dependants to be {}: {}", state, blocking.join(", "));
            return self.wait(resource, job_type, &message).await;
        }

        self.launch(resource, job_type).await
    }

    /// Stop retrying until an operator acts.
    async fn block(&self, resource: &mut Resource, message: &str) -> Result<()> {
        let before = resource.status.clone();
        rs::mark_blocked(&mut resource.status, message);
        if resource.status != before {
            info!(resource_id = %resource.id, name = %resource.name, reason = %message, "Resource blocked by dependency");
            self.store
                .update_resource_status(&resource.id, &resource.status)
                .await?;
        }
        Ok(())
    }

    /// Keep waiting; retried on the next pass.
    async fn wait(&self, resource: &mut Resource, job_type: JobType, message: &str) -> Result<()> {
        let before = resource.status.clone();
        rs::mark_waiting(&mut resource.status, job_type, message);
        if resource.status != before {
            debug!(resource_id = %resource.id, name = %resource.name, reason = %message, "Resource waiting");
            self.store
                .update_resource_status(&resource.id, &resource.status)
                .await?;
        }
        Ok(())
    }

    async fn launch(&self, resource: &mut Resource, job_type: JobType) -> Result<()> {
        let running = self
            .store
            .latest_run(&resource.id, None)
            .await?
            .is_some_and(|run| run.is_running());
        if running {
            return self.wait(resource, job_type, RUN_IN_FLIGHT_MESSAGE).await;
        }

        rs::mark_launching(&mut resource.status, job_type);
        self.store
            .update_resource_status(&resource.id, &resource.status)
            .await?;

        info!(
            resource_id = %resource.id,
            name = %resource.name,
            job_type = %job_type,
            deployer_type = %resource.deployer_type,
            "Dispatching job"
        );

        let dispatched = match self.deployers.for_resource(resource) {
            Ok(d) => deployer::dispatch(d.as_ref(), resource, job_type, &DeployOptions::default()).await,
            Err(e) => Err(e),
        };

        if let Err(e) = dispatched {
            // Lost the admission race; the run that won will wake us.
            if matches!(e, DeployerError::Core(CoreError::DeploymentRunning)) {
                return self.wait(resource, job_type, RUN_IN_FLIGHT_MESSAGE).await;
            }
            deployer::complete_job(
                self.store.as_ref(),
                &resource.id,
                job_type,
                false,
                &e.to_string(),
                |_| {},
            )
            .await?;
            return Err(e.into());
        }
        Ok(())
    }
}

fn blocking_reason(status: &Status) -> Option<&'static str> {
    if rs::is_error(status) {
        Some("has encountered an error")
    } else if rs::is_deleted(status) {
        Some("is in delete status")
    } else if rs::is_stopped(status) {
        Some("is in stop status")
    } else {
        None
    }
}

struct RunFinishedWaker {
    wake: Arc<Notify>,
}

#[async_trait]
impl RunEventHandler for RunFinishedWaker {
    async fn handle(&self, event: &RunChangedEvent) -> std::result::Result<(), String> {
        if event.status != ConditionStatus::Unknown {
            self.wake.notify_one();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployer::MockDeployer;
    use crate::test_support;
    use keel_core::SqliteStore;
    use keel_core::models::{Relationship, RelationshipKind};
    use keel_core::persistence::ResourceStore;
    use serde_json::json;

    struct Fixture {
        store: Arc<SqliteStore>,
        deployer: Arc<MockDeployer>,
        scheduler: RelationshipScheduler,
    }

    async fn fixture() -> Fixture {
        let store = test_support::store().await;
        let deployer = Arc::new(MockDeployer::new("terraform"));
        let registry = DeployerRegistry::new().with(deployer.clone());
        let scheduler = RelationshipScheduler::new(
            store.clone(),
            Arc::new(registry),
            RelationshipSchedulerConfig::default(),
        );
        Fixture {
            store,
            deployer,
            scheduler,
        }
    }

    fn depends_on(name: &str) -> serde_json::Value {
        json!({ "input": format!("${{res.{}.id}}", name) })
    }

    #[tokio::test]
    async fn test_apply_waits_for_dependencies() {
        let f = fixture().await;
        let vpc = test_support::insert(&f.store, "env", "vpc", json!({})).await;
        let db = test_support::insert(&f.store, "env", "db", json!({})).await;
        let app = test_support::insert(
            &f.store,
            "env",
            "app",
            json!({"vpc": "${res.vpc.id}", "db": "${res.db.endpoint}"}),
        )
        .await;

        f.scheduler.tick(&CancellationToken::new()).await.unwrap();

        let mut applied = f.deployer.resources_for("apply").await;
        applied.sort();
        assert_eq!(applied, vec!["db", "vpc"]);
        let stored = test_support::reload(&f.store, &app.id).await;
        assert_eq!(stored.status.summary.summary, "Progressing");
        assert!(stored.status.summary.transitioning);
        assert_eq!(
            stored.status.summary.message,
            "Waiting for dependent resources to be ready: db, vpc"
        );
        assert_eq!(test_support::reload(&f.store, &vpc.id).await.status.summary.summary, "Deploying");

        test_support::set_status(&f.store, &vpc.id, |st| *st = test_support::ready_status()).await;
        test_support::set_status(&f.store, &db.id, |st| *st = test_support::ready_status()).await;
        f.scheduler.tick(&CancellationToken::new()).await.unwrap();

        assert_eq!(f.deployer.resources_for("apply").await.len(), 3);
        let stored = test_support::reload(&f.store, &app.id).await;
        assert_eq!(stored.status.summary.summary, "Deploying");
    }

    #[tokio::test]
    async fn test_failed_dependency_blocks_dependant() {
        let f = fixture().await;
        let vpc = test_support::insert(&f.store, "env", "vpc", json!({})).await;
        let app = test_support::insert(&f.store, "env", "app", depends_on("vpc")).await;
        test_support::set_status(&f.store, &vpc.id, |st| {
            rs::mark_launching(st, JobType::Apply);
            rs::apply_outcome(st, JobType::Apply, false, "quota exceeded");
        })
        .await;

        f.scheduler.apply_resources(&CancellationToken::new()).await.unwrap();

        let stored = test_support::reload(&f.store, &app.id).await;
        assert!(stored.status.is_false(ConditionType::Progressing));
        assert!(!stored.status.summary.transitioning);
        assert_eq!(
            stored.status.summary.message,
            "Dependency resource \"vpc\" has encountered an error, please check it"
        );
        assert!(f.deployer.calls().await.is_empty());

        // Blocked resources are not picked up again.
        f.scheduler.apply_resources(&CancellationToken::new()).await.unwrap();
        assert!(f.deployer.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_destroy_waits_for_dependants() {
        let f = fixture().await;
        let vpc = test_support::insert(&f.store, "env", "vpc", json!({})).await;
        let app = test_support::insert(&f.store, "env", "app", depends_on("vpc")).await;
        test_support::set_status(&f.store, &app.id, |st| *st = test_support::ready_status()).await;
        test_support::set_status(&f.store, &vpc.id, |st| {
            *st = test_support::ready_status();
            rs::request_delete(st);
        })
        .await;

        f.scheduler.destroy_resources(&CancellationToken::new()).await.unwrap();

        let stored = test_support::reload(&f.store, &vpc.id).await;
        assert_eq!(stored.status.summary.summary, "Deleting");
        assert_eq!(stored.status.summary.message, "Waiting for dependants to be deleted: app");
        assert!(f.deployer.calls().await.is_empty());

        f.store.delete_resource(&app.id).await.unwrap();
        f.scheduler.destroy_resources(&CancellationToken::new()).await.unwrap();

        assert_eq!(f.deployer.resources_for("destroy").await, vec!["vpc"]);
        let stored = test_support::reload(&f.store, &vpc.id).await;
        assert!(stored.status.is_true(ConditionType::Progressing));

        // A destroy in progress is left alone.
        f.scheduler.destroy_resources(&CancellationToken::new()).await.unwrap();
        assert_eq!(f.deployer.resources_for("destroy").await.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_waits_for_dependants() {
        let f = fixture().await;
        let vpc = test_support::insert(&f.store, "env", "vpc", json!({})).await;
        let app = test_support::insert(&f.store, "env", "app", depends_on("vpc")).await;
        test_support::set_status(&f.store, &app.id, |st| *st = test_support::ready_status()).await;
        test_support::set_status(&f.store, &vpc.id, |st| {
            *st = test_support::ready_status();
            rs::request_stop(st);
        })
        .await;

        f.scheduler.tick(&CancellationToken::new()).await.unwrap();

        let stored = test_support::reload(&f.store, &vpc.id).await;
        assert_eq!(stored.status.summary.message, "Waiting for dependants to be stopped: app");
        assert!(f.deployer.calls().await.is_empty());

        test_support::set_status(&f.store, &app.id, |st| {
            rs::request_stop(st);
            rs::mark_launching(st, JobType::Stop);
            rs::apply_outcome(st, JobType::Stop, true, "");
        })
        .await;
        f.scheduler.tick(&CancellationToken::new()).await.unwrap();

        assert_eq!(f.deployer.resources_for("stop").await, vec!["vpc"]);
        let stored = test_support::reload(&f.store, &vpc.id).await;
        assert_eq!(stored.status.summary.summary, "Stopping");
    }

    #[tokio::test]
    async fn test_dispatch_failure_marks_resource_and_continues() {
        let f = fixture().await;
        let a = test_support::insert(&f.store, "env", "a", json!({})).await;
        let b = test_support::insert(&f.store, "env", "b", json!({})).await;
        f.deployer.set_failing(true);

        let err = f.scheduler.tick(&CancellationToken::new()).await.unwrap_err();

        assert_eq!(err.to_string(), "Deployer error: Mock apply failure; Deployer error: Mock apply failure");
        for id in [&a.id, &b.id] {
            let stored = test_support::reload(&f.store, id).await;
            assert_eq!(stored.status.summary.summary, "DeployFailed");
            assert_eq!(stored.status.summary.message, "Mock apply failure");
        }
    }

    #[tokio::test]
    async fn test_run_in_flight_keeps_request_pending() {
        let f = fixture().await;
        let a = test_support::insert(&f.store, "env", "a", json!({})).await;
        f.deployer.set_busy(true);

        f.scheduler.tick(&CancellationToken::new()).await.unwrap();

        let stored = test_support::reload(&f.store, &a.id).await;
        assert_eq!(stored.status.summary.summary, rs::SUMMARY_PROGRESSING);
        assert!(stored.status.summary.transitioning);
        assert!(!rs::is_error(&stored.status));
        assert_eq!(stored.status.summary.message, RUN_IN_FLIGHT_MESSAGE);

        f.deployer.set_busy(false);
        f.scheduler.tick(&CancellationToken::new()).await.unwrap();
        assert_eq!(f.deployer.resources_for("apply").await, vec!["a", "a"]);
    }

    #[tokio::test]
    async fn test_stored_cycle_is_reported() {
        let f = fixture().await;
        let vpc = test_support::insert(&f.store, "env", "vpc", json!({})).await;
        let app = test_support::new_resource("app", depends_on("vpc")).into_resource("env");
        let rows = vec![
            Relationship {
                resource_id: app.id.clone(),
                dependency_id: app.id.clone(),
                path: vec![app.id.clone()],
                kind: RelationshipKind::Implicit,
            },
            Relationship {
                resource_id: app.id.clone(),
                dependency_id: vpc.id.clone(),
                path: vec![app.id.clone(), vpc.id.clone(), app.id.clone()],
                kind: RelationshipKind::Implicit,
            },
        ];
        f.store.create_resources(std::slice::from_ref(&app), &rows).await.unwrap();
        test_support::set_status(&f.store, &vpc.id, |st| *st = test_support::ready_status()).await;

        let err = f.scheduler.apply_resources(&CancellationToken::new()).await.unwrap_err();

        assert_eq!(
            err.to_string(),
            format!(
                "dependency cycle detected, resource id: {}, path: {} -> {} -> {}",
                app.id, app.id, vpc.id, app.id
            )
        );
        assert!(f.deployer.resources_for("apply").await.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_pass_dispatches_nothing() {
        let f = fixture().await;
        test_support::insert(&f.store, "env", "vpc", json!({})).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = f.scheduler.apply_resources(&cancel).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(f.deployer.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_finished_run_wakes_scheduler() {
        let f = fixture().await;
        let waker = f.scheduler.waker();
        let event = RunChangedEvent {
            run_id: "run-1".into(),
            resource_id: "res-1".into(),
            job_type: JobType::Apply,
            status: ConditionStatus::True,
        };
        waker.handle(&event).await.unwrap();

        tokio::time::timeout(Duration::from_millis(100), f.scheduler.wake.notified())
            .await
            .unwrap();
    }
}
