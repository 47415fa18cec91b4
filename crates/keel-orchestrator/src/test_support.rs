// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for unit tests.

use std::sync::Arc;

use async_trait::async_trait;
use keel_core::SqliteStore;
use keel_core::bus::{RunChangedEvent, RunEventHandler};
use keel_core::models::{JobType, NewResource, ProviderRequirement, Resource, ResourceSource, TemplateRef};
use keel_core::persistence::ResourceStore;
use keel_core::relationship;
use keel_core::status::{Status, resource as rs};
use serde_json::{Value, json};
use sqlx::sqlite::SqlitePoolOptions;
use tokio::sync::Mutex;

pub(crate) const SUBJECT: &str = "alice";

pub(crate) async fn store() -> Arc<SqliteStore> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");
    keel_core::migrations::run_sqlite(&pool)
        .await
        .expect("Failed to run migrations");
    Arc::new(SqliteStore::new(pool))
}

pub(crate) fn template() -> TemplateRef {
    TemplateRef {
        id: "tpl-1".into(),
        name: "network".into(),
        version: "1.0.0".into(),
        source: "git::https://example.com/modules/network.git".into(),
        required_providers: vec![
            ProviderRequirement {
                name: "aws".into(),
                source: Some("hashicorp/aws".into()),
                version: Some("~> 5.0".into()),
            },
            ProviderRequirement {
                name: "random".into(),
                source: Some("hashicorp/random".into()),
                version: None,
            },
        ],
        outputs: vec!["vpc_id".into(), "cidr".into()],
    }
}

pub(crate) fn new_resource(name: &str, attributes: Value) -> NewResource {
    NewResource {
        name: name.to_string(),
        attributes: attributes.as_object().cloned().unwrap_or_default(),
        source: Some(ResourceSource::Template(template())),
        subject: Some(SUBJECT.to_string()),
        ..Default::default()
    }
}

/// Insert one resource with relationships derived from already stored
/// dependencies.
pub(crate) async fn insert_new(store: &SqliteStore, env: &str, new: NewResource) -> Resource {
    let resource = new.into_resource(env);
    let mut dependency_rows = Vec::new();
    for name in resource.dependency_names() {
        if let Some(dep) = store.get_resource_by_name(env, &name).await.unwrap() {
            dependency_rows.extend(store.get_relationships(&dep.id).await.unwrap());
        }
    }
    let rows = relationship::derive(&resource.id, &dependency_rows).unwrap();
    store
        .create_resources(std::slice::from_ref(&resource), &rows)
        .await
        .unwrap();
    resource
}

pub(crate) async fn insert(store: &SqliteStore, env: &str, name: &str, attributes: Value) -> Resource {
    insert_new(store, env, new_resource(name, attributes)).await
}

/// Status of a resource whose apply succeeded.
pub(crate) fn ready_status() -> Status {
    let mut st = Status::default();
    rs::request_apply(&mut st);
    rs::mark_launching(&mut st, JobType::Apply);
    rs::apply_outcome(&mut st, JobType::Apply, true, "");
    st
}

pub(crate) async fn set_status(store: &SqliteStore, id: &str, f: impl FnOnce(&mut Status)) -> Resource {
    let mut res = store.get_resource(id).await.unwrap().unwrap();
    f(&mut res.status);
    store.update_resource_status(id, &res.status).await.unwrap();
    res
}

pub(crate) async fn reload(store: &SqliteStore, id: &str) -> Resource {
    store.get_resource(id).await.unwrap().unwrap()
}

/// A state blob with one resource of `provider` and the given outputs.
pub(crate) fn state(provider: &str, outputs: Value) -> String {
    let outputs: serde_json::Map<String, Value> = outputs
        .as_object()
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| (k, json!({"value": v})))
        .collect();
    json!({
        "version": 4,
        "resources": [{
            "mode": "managed",
            "type": format!("{}_thing", provider),
            "provider": format!("provider[\"registry.terraform.io/hashicorp/{}\"]", provider),
        }],
        "outputs": outputs,
    })
    .to_string()
}

pub(crate) fn state_with_provider(provider: &str) -> String {
    state(provider, json!({}))
}

/// Records every run event.
#[derive(Default)]
pub(crate) struct Recorder {
    events: Mutex<Vec<RunChangedEvent>>,
}

impl Recorder {
    pub(crate) async fn events(&self) -> Vec<RunChangedEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl RunEventHandler for Recorder {
    async fn handle(&self, event: &RunChangedEvent) -> Result<(), String> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}
