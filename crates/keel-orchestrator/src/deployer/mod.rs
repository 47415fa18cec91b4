// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deployers.
//!
//! A deployer turns a resource into a backend job. It admits a run through
//! the [`RunAdmissionManager`](crate::admission::RunAdmissionManager),
//! launches the job and returns; a monitor task it spawns finishes the run
//! and applies the outcome to the resource. Failing after the run exists
//! always leaves the run `False`, never `Unknown`.

pub mod mock;
pub mod terraform;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use keel_core::error::CoreError;
use keel_core::models::{JobType, Resource};
use keel_core::persistence::Store;
use keel_core::status::resource::{self as rs, OutcomeAction};
use thiserror::Error;
use tracing::{debug, info};

use crate::runner::JobRunnerError;

pub use mock::MockDeployer;
pub use terraform::{TerraformConfig, TerraformDeployer};

/// Errors from deployer operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DeployerError {
    /// No deployer is registered for the type.
    #[error("unknown deployer type '{0}'")]
    Unknown(String),

    /// Run admission or persistence failed.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The job could not be launched.
    #[error(transparent)]
    Runner(#[from] JobRunnerError),

    /// Backend configuration could not be rendered.
    #[error("render failed: {0}")]
    Render(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type for deployer operations.
pub type Result<T> = std::result::Result<T, DeployerError>;

/// Per-request options.
#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    /// Free-form change comment recorded on the run.
    pub change_comment: Option<String>,
    /// Acting subject; the resource's subject when absent.
    pub subject: Option<String>,
}

/// Executes resource jobs on a backend.
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Registry key, matched against `Resource::deployer_type`.
    fn deployer_type(&self) -> &str;

    /// Create or update the resource's infrastructure.
    async fn apply(&self, resource: &Resource, options: &DeployOptions) -> Result<()>;

    /// Tear the infrastructure down; the resource is removed on success.
    async fn destroy(&self, resource: &Resource, options: &DeployOptions) -> Result<()>;

    /// Tear the infrastructure down but keep the resource.
    async fn stop(&self, resource: &Resource, options: &DeployOptions) -> Result<()>;

    /// Start a drift check against the last deployed configuration.
    async fn detect(&self, resource: &Resource) -> Result<()>;

    /// Number of drift checks currently running.
    async fn active_detections(&self) -> Result<usize>;
}

/// Deployers by type.
#[derive(Clone, Default)]
pub struct DeployerRegistry {
    deployers: HashMap<String, Arc<dyn Deployer>>,
}

impl DeployerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a deployer under its own type, replacing any previous one.
    pub fn register(&mut self, deployer: Arc<dyn Deployer>) {
        let key = deployer.deployer_type().to_string();
        debug!(deployer_type = %key, "Deployer registered");
        self.deployers.insert(key, deployer);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, deployer: Arc<dyn Deployer>) -> Self {
        self.register(deployer);
        self
    }

    /// Deployer for a type.
    pub fn get(&self, deployer_type: &str) -> Result<Arc<dyn Deployer>> {
        self.deployers
            .get(deployer_type)
            .cloned()
            .ok_or_else(|| DeployerError::Unknown(deployer_type.to_string()))
    }

    /// Deployer responsible for a resource.
    pub fn for_resource(&self, resource: &Resource) -> Result<Arc<dyn Deployer>> {
        self.get(&resource.deployer_type)
    }

    /// Every registered deployer.
    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn Deployer>> {
        self.deployers.values()
    }

    /// Number of registered deployers.
    pub fn len(&self) -> usize {
        self.deployers.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.deployers.is_empty()
    }
}

/// Dispatch a job of the given type.
pub async fn dispatch(
    deployer: &dyn Deployer,
    resource: &Resource,
    job_type: JobType,
    options: &DeployOptions,
) -> Result<()> {
    match job_type {
        JobType::Apply => deployer.apply(resource, options).await,
        JobType::Destroy => deployer.destroy(resource, options).await,
        JobType::Stop => deployer.stop(resource, options).await,
    }
}

/// Apply a finished job's outcome to the current stored resource.
///
/// The resource is re-read so concurrent status changes are not lost; a
/// successful destroy removes it. `update` may adjust the resource before it
/// is written (e.g. computed attributes). Returns the written resource, or
/// None when it was removed or is already gone.
pub async fn complete_job<F>(
    store: &dyn Store,
    resource_id: &str,
    job_type: JobType,
    succeeded: bool,
    message: &str,
    update: F,
) -> std::result::Result<Option<Resource>, CoreError>
where
    F: FnOnce(&mut Resource),
{
    let Some(mut resource) = store.get_resource(resource_id).await? else {
        debug!(resource_id = %resource_id, "Resource gone before job outcome was applied");
        return Ok(None);
    };

    match rs::apply_outcome(&mut resource.status, job_type, succeeded, message) {
        OutcomeAction::Delete => {
            store.delete_resource(resource_id).await?;
            info!(resource_id = %resource_id, name = %resource.name, "Resource destroyed");
            Ok(None)
        }
        OutcomeAction::Update => {
            update(&mut resource);
            store.update_resource(&resource).await?;
            info!(
                resource_id = %resource_id,
                job_type = %job_type,
                succeeded,
                summary = %resource.status.summary.summary,
                "Job outcome applied"
            );
            Ok(Some(resource))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use keel_core::persistence::ResourceStore;
    use keel_core::status::ConditionType;
    use serde_json::json;

    #[test]
    fn test_registry_lookup() {
        let registry = DeployerRegistry::new().with(Arc::new(MockDeployer::new("terraform")));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("terraform").is_ok());
        let err = registry.get("pulumi").err().unwrap();
        assert_eq!(err.to_string(), "unknown deployer type 'pulumi'");
    }

    #[tokio::test]
    async fn test_complete_job_outcomes() {
        let store = test_support::store().await;
        let res = test_support::insert(&store, "env", "vpc", json!({})).await;
        test_support::set_status(&store, &res.id, |st| rs::mark_launching(st, JobType::Apply)).await;

        let updated = complete_job(store.as_ref(), &res.id, JobType::Apply, true, "", |r| {
            r.computed_attributes.insert("id".into(), json!("vpc-1"));
        })
        .await
        .unwrap()
        .unwrap();
        assert!(rs::is_ready(&updated.status));
        let stored = test_support::reload(&store, &res.id).await;
        assert_eq!(stored.computed_attributes["id"], json!("vpc-1"));

        test_support::set_status(&store, &res.id, |st| {
            rs::request_delete(st);
            rs::mark_launching(st, JobType::Destroy);
        })
        .await;
        complete_job(store.as_ref(), &res.id, JobType::Destroy, false, "denied", |_| {})
            .await
            .unwrap();
        let stored = test_support::reload(&store, &res.id).await;
        assert!(stored.status.is_false(ConditionType::Deleted));
        assert_eq!(stored.status.summary.summary, "DeleteFailed");

        let removed = complete_job(store.as_ref(), &res.id, JobType::Destroy, true, "", |_| {})
            .await
            .unwrap();
        assert!(removed.is_none());
        assert!(store.get_resource(&res.id).await.unwrap().is_none());
    }
}
