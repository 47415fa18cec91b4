// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for keel-orchestrator integration tests.
//!
//! Provides TestContext wiring an in-memory SQLite store, the Terraform
//! deployer over a mock job runner, and the resource service.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use keel_core::SqliteStore;
use keel_core::bus::Bus;
use keel_core::models::{NewResource, ProviderRequirement, Resource, ResourceSource, TemplateRef};
use keel_core::persistence::ResourceStore;
use keel_orchestrator::admission::RunAdmissionManager;
use keel_orchestrator::deployer::{DeployerRegistry, TerraformConfig, TerraformDeployer};
use keel_orchestrator::relationship_scheduler::{RelationshipScheduler, RelationshipSchedulerConfig};
use keel_orchestrator::runner::MockJobRunner;
use keel_orchestrator::service::ResourceService;
use serde_json::{Value, json};
use sqlx::sqlite::SqlitePoolOptions;

pub const ENV: &str = "test-env";

/// Test context holding every collaborator of one orchestrator.
pub struct TestContext {
    pub store: Arc<SqliteStore>,
    pub bus: Bus,
    pub runner: Arc<MockJobRunner>,
    pub deployer: Arc<TerraformDeployer>,
    pub service: ResourceService,
    pub scheduler: RelationshipScheduler,
    _temp_dir: tempfile::TempDir,
}

impl TestContext {
    /// Create a new test context around `runner`.
    pub async fn new(runner: MockJobRunner) -> Self {
        let store = Arc::new(sqlite_store().await);
        let bus = Bus::new();
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let runner = Arc::new(runner);

        let admission = Arc::new(RunAdmissionManager::new(store.clone(), bus.clone()));
        let deployer = Arc::new(TerraformDeployer::new(
            store.clone(),
            admission,
            runner.clone(),
            TerraformConfig {
                data_dir: temp_dir.path().to_path_buf(),
                terraform_bin: "terraform".to_string(),
                job_timeout: Duration::from_secs(30),
                poll_interval: Duration::from_millis(10),
            },
        ));
        let registry = DeployerRegistry::new().with(deployer.clone());
        let scheduler = RelationshipScheduler::new(
            store.clone(),
            Arc::new(registry),
            RelationshipSchedulerConfig::default(),
        );

        Self {
            service: ResourceService::new(store.clone()),
            store,
            bus,
            runner,
            deployer,
            scheduler,
            _temp_dir: temp_dir,
        }
    }

    /// Reload a resource by name.
    pub async fn resource(&self, name: &str) -> Option<Resource> {
        self.store
            .get_resource_by_name(ENV, name)
            .await
            .expect("Failed to load resource")
    }
}

/// Fresh in-memory SQLite store with migrations applied.
pub async fn sqlite_store() -> SqliteStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to open SQLite");
    keel_core::migrations::run_sqlite(&pool)
        .await
        .expect("Failed to run migrations");
    SqliteStore::new(pool)
}

pub fn template() -> TemplateRef {
    TemplateRef {
        id: "tpl-network".to_string(),
        name: "network".to_string(),
        version: "1.2.0".to_string(),
        source: "git::https://example.com/modules/network.git".to_string(),
        required_providers: vec![ProviderRequirement {
            name: "aws".to_string(),
            source: Some("hashicorp/aws".to_string()),
            version: Some("~> 5.0".to_string()),
        }],
        outputs: vec!["vpc_id".to_string()],
    }
}

pub fn new_resource(name: &str, attributes: Value) -> NewResource {
    NewResource {
        name: name.to_string(),
        attributes: attributes.as_object().cloned().unwrap_or_default(),
        source: Some(ResourceSource::Template(template())),
        subject: Some("alice".to_string()),
        ..Default::default()
    }
}

/// State blob with one aws resource and the given outputs.
pub fn state(outputs: Value) -> String {
    let outputs: serde_json::Map<String, Value> = outputs
        .as_object()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, json!({ "value": v })))
        .collect();
    json!({
        "version": 4,
        "resources": [{
            "mode": "managed",
            "type": "aws_vpc",
            "provider": "provider[\"registry.terraform.io/hashicorp/aws\"]",
        }],
        "outputs": outputs,
    })
    .to_string()
}

/// Poll `check` until it holds, panicking after about five seconds.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
