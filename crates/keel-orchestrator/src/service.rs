// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource request operations.
//!
//! These only record intent: they write the requested transition into the
//! resource status and leave execution to the
//! [`RelationshipScheduler`](crate::relationship_scheduler::RelationshipScheduler).

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use keel_core::error::CoreError;
use keel_core::graph::{CycleError, DependencyGraph};
use keel_core::models::{Attributes, NewResource, Relationship, Resource, ResourceSource};
use keel_core::persistence::Store;
use keel_core::relationship;
use keel_core::status::resource as rs;
use tracing::{debug, info};

type Result<T> = std::result::Result<T, CoreError>;

/// Creates, upgrades and requests lifecycle changes of resources.
#[derive(Clone)]
pub struct ResourceService {
    store: Arc<dyn Store>,
}

impl ResourceService {
    /// Service writing through `store`.
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Create one resource.
    pub async fn create(&self, environment_id: &str, new: NewResource) -> Result<Resource> {
        let mut created = self.create_batch(environment_id, vec![new]).await?;
        created
            .pop()
            .ok_or_else(|| CoreError::InvalidState("nothing created".to_string()))
    }

    /// Create a batch of resources, dependencies first.
    ///
    /// Nothing is written when a name is taken, a reference cannot be
    /// resolved or the batch contains a cycle.
    pub async fn create_batch(
        &self,
        environment_id: &str,
        batch: Vec<NewResource>,
    ) -> Result<Vec<Resource>> {
        let mut seen = HashSet::new();
        for new in &batch {
            let taken = !seen.insert(new.name.as_str())
                || self
                    .store
                    .get_resource_by_name(environment_id, &new.name)
                    .await?
                    .is_some();
            if taken {
                return Err(CoreError::DuplicateResource {
                    environment_id: environment_id.to_string(),
                    name: new.name.clone(),
                });
            }
        }

        let order: Vec<usize> = DependencyGraph::from_attributes(
            batch.iter().map(|n| (n.name.as_str(), &n.attributes)),
        )
        .sort_indices()?;

        let mut slots: Vec<Option<NewResource>> = batch.into_iter().map(Some).collect();
        let mut resources = Vec::with_capacity(slots.len());
        let mut ids: HashMap<String, String> = HashMap::new();
        let mut rows_by_id: HashMap<String, Vec<Relationship>> = HashMap::new();
        let mut relationships = Vec::new();

        for idx in order {
            let Some(new) = slots[idx].take() else {
                continue;
            };
            let resource = new.into_resource(environment_id);

            let mut dependency_rows = Vec::new();
            for name in resource.dependency_names() {
                if let Some(id) = ids.get(&name) {
                    dependency_rows.extend(rows_by_id.get(id).cloned().unwrap_or_default());
                    continue;
                }
                let dep = self
                    .store
                    .get_resource_by_name(environment_id, &name)
                    .await?
                    .ok_or_else(|| CoreError::ResourceNotFound(name.clone()))?;
                dependency_rows.extend(self.store.get_relationships(&dep.id).await?);
            }

            let rows = relationship::derive(&resource.id, &dependency_rows)
                .map_err(|row| CycleError::new(row.path))?;
            debug!(
                resource_id = %resource.id,
                name = %resource.name,
                rows = rows.len(),
                "Derived relationships"
            );

            ids.insert(resource.name.clone(), resource.id.clone());
            rows_by_id.insert(resource.id.clone(), rows.clone());
            relationships.extend(rows);
            resources.push(resource);
        }

        self.store.create_resources(&resources, &relationships).await?;
        info!(
            environment_id,
            count = resources.len(),
            "Resources created"
        );
        Ok(resources)
    }

    /// Replace the attributes (and optionally the source) of a resource and
    /// request a new apply.
    ///
    /// Relationship rows of the resource and of everything depending on it,
    /// directly or not, are recomputed in the same transaction.
    pub async fn upgrade(
        &self,
        resource_id: &str,
        attributes: Attributes,
        source: Option<ResourceSource>,
    ) -> Result<Resource> {
        let mut resource = self.get(resource_id).await?;
        resource.attributes = attributes;
        if let Some(source) = source {
            resource.source = Some(source);
        }
        rs::request_apply(&mut resource.status);

        let mut own_deps = BTreeSet::new();
        for name in resource.dependency_names() {
            let dep = self
                .store
                .get_resource_by_name(&resource.environment_id, &name)
                .await?
                .ok_or_else(|| CoreError::ResourceNotFound(name.clone()))?;
            own_deps.insert(dep.id);
        }

        // Everything downstream of the resource, with its direct dependencies.
        let mut names = HashMap::from([(resource.id.clone(), resource.name.clone())]);
        let mut direct: Vec<(String, BTreeSet<String>)> = vec![(resource.id.clone(), own_deps)];
        let mut queue = VecDeque::from([resource.id.clone()]);
        let mut visited = HashSet::from([resource.id.clone()]);
        while let Some(id) = queue.pop_front() {
            for dependant in self.store.get_dependants(&id).await? {
                if !visited.insert(dependant.id.clone()) {
                    continue;
                }
                let deps = relationship::dependency_ids(&self.store.get_dependencies(&dependant.id).await?);
                names.insert(dependant.id.clone(), dependant.name.clone());
                direct.push((dependant.id.clone(), deps));
                queue.push_back(dependant.id);
            }
        }

        let graph = DependencyGraph::new(direct.iter().map(|(id, deps)| (id.clone(), deps.iter())));
        let order = graph.sort_indices().map_err(|e| named_cycle(&e, &names))?;

        let mut recomputed: HashMap<String, Vec<Relationship>> = HashMap::new();
        let mut updates = Vec::with_capacity(order.len());
        for idx in order {
            let (id, deps) = &direct[idx];
            let mut dependency_rows = Vec::new();
            for dep in deps {
                match recomputed.get(dep) {
                    Some(rows) => dependency_rows.extend(rows.iter().cloned()),
                    None => dependency_rows.extend(self.store.get_relationships(dep).await?),
                }
            }
            let rows = relationship::derive(id, &dependency_rows)
                .map_err(|row| CycleError::new(relationship::name_path(&row.path, &names)))?;
            recomputed.insert(id.clone(), rows.clone());
            updates.push((id.clone(), rows));
        }

        self.store
            .update_resource_with_relationships(&resource, &updates)
            .await?;
        info!(
            resource_id = %resource.id,
            name = %resource.name,
            dependants = updates.len() - 1,
            "Resource upgrade requested"
        );
        Ok(resource)
    }

    /// Request deletion. Deleting a resource that no longer exists is not
    /// an error.
    pub async fn delete(&self, resource_id: &str) -> Result<Option<Resource>> {
        let Some(mut resource) = self.store.get_resource(resource_id).await? else {
            debug!(resource_id, "Resource already gone");
            return Ok(None);
        };
        rs::request_delete(&mut resource.status);
        self.store
            .update_resource_status(&resource.id, &resource.status)
            .await?;
        info!(resource_id, name = %resource.name, "Resource deletion requested");
        Ok(Some(resource))
    }

    /// Request a stop.
    pub async fn stop(&self, resource_id: &str) -> Result<Resource> {
        let mut resource = self.get(resource_id).await?;
        if rs::is_deleted(&resource.status) {
            return Err(CoreError::InvalidState(format!(
                "resource '{}' is being deleted",
                resource.name
            )));
        }
        rs::request_stop(&mut resource.status);
        self.store
            .update_resource_status(&resource.id, &resource.status)
            .await?;
        info!(resource_id, name = %resource.name, "Resource stop requested");
        Ok(resource)
    }

    /// Request a stopped resource to be applied again.
    pub async fn start(&self, resource_id: &str) -> Result<Resource> {
        let mut resource = self.get(resource_id).await?;
        if !rs::is_stopped(&resource.status) {
            return Err(CoreError::InvalidState(format!(
                "resource '{}' is not stopped",
                resource.name
            )));
        }
        rs::request_apply(&mut resource.status);
        self.store
            .update_resource_status(&resource.id, &resource.status)
            .await?;
        info!(resource_id, name = %resource.name, "Resource start requested");
        Ok(resource)
    }

    async fn get(&self, resource_id: &str) -> Result<Resource> {
        self.store
            .get_resource(resource_id)
            .await?
            .ok_or_else(|| CoreError::ResourceNotFound(resource_id.to_string()))
    }
}

fn named_cycle(err: &CycleError, names: &HashMap<String, String>) -> CycleError {
    CycleError::new(relationship::name_path(err.path(), names))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use keel_core::SqliteStore;
    use keel_core::persistence::ResourceStore;
    use keel_core::status::ConditionType;
    use serde_json::json;

    fn service(store: &Arc<SqliteStore>) -> ResourceService {
        ResourceService::new(store.clone())
    }

    fn names(resources: &[Resource]) -> Vec<&str> {
        resources.iter().map(|r| r.name.as_str()).collect()
    }

    fn attrs(value: serde_json::Value) -> Attributes {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_create_batch_sorts_and_links() {
        let store = test_support::store().await;
        let batch = vec![
            test_support::new_resource("6", json!({"in": "${res.5.id}"})),
            test_support::new_resource("5", json!({"in": "${res.4.id}"})),
            test_support::new_resource("4", json!({})),
        ];

        let created = service(&store).create_batch("env", batch).await.unwrap();

        assert_eq!(names(&created), vec!["4", "5", "6"]);
        let (four, five, six) = (&created[0], &created[1], &created[2]);
        let deps = store.get_dependencies(&six.id).await.unwrap();
        let paths: BTreeSet<String> = deps.iter().map(|r| r.path.join(",")).collect();
        assert_eq!(
            paths,
            BTreeSet::from([
                format!("{},{}", five.id, six.id),
                format!("{},{},{}", four.id, five.id, six.id),
            ])
        );
        assert!(deps.iter().all(|r| r.dependency_id == five.id));
        assert_eq!(six.status.summary.summary, rs::SUMMARY_PROGRESSING);
        assert!(six.status.summary.transitioning);
    }

    #[tokio::test]
    async fn test_create_batch_cycle_writes_nothing() {
        let store = test_support::store().await;
        let batch = vec![
            test_support::new_resource("1", json!({"x": "${res.3.id}"})),
            test_support::new_resource("2", json!({"x": "${res.1.id}"})),
            test_support::new_resource("3", json!({"x": "${res.2.id}"})),
        ];

        let err = service(&store).create_batch("env", batch).await.unwrap_err();

        match err {
            CoreError::Cycle(e) => assert_eq!(e.path_string(), "3 -> 1 -> 2 -> 3"),
            other => panic!("expected cycle, got {other:?}"),
        }
        assert!(store.list_resources("env").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_batch_rejects_duplicates() {
        let store = test_support::store().await;
        test_support::insert(&store, "env", "vpc", json!({})).await;
        let svc = service(&store);

        let err = svc
            .create_batch("env", vec![test_support::new_resource("vpc", json!({}))])
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DuplicateResource { ref name, .. } if name == "vpc"));

        let err = svc
            .create_batch(
                "env",
                vec![
                    test_support::new_resource("db", json!({})),
                    test_support::new_resource("db", json!({})),
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DuplicateResource { .. }));

        svc.create("other", test_support::new_resource("vpc", json!({})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_create_links_to_stored_dependency() {
        let store = test_support::store().await;
        let vpc = test_support::insert(&store, "env", "vpc", json!({})).await;
        let svc = service(&store);

        let app = svc
            .create("env", test_support::new_resource("app", json!({"vpc": "${res.vpc.id}"})))
            .await
            .unwrap();
        let dependants = store.get_dependants(&vpc.id).await.unwrap();
        assert_eq!(names(&dependants), vec!["app"]);

        let err = svc
            .create("env", test_support::new_resource("web", json!({"db": "${res.db.id}"})))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ResourceNotFound(ref n) if n == "db"));
        assert!(store.get_resource_by_name("env", "web").await.unwrap().is_none());
        assert_eq!(app.status.summary.summary, rs::SUMMARY_PROGRESSING);
    }

    #[tokio::test]
    async fn test_upgrade_recomputes_dependant_paths() {
        let store = test_support::store().await;
        let svc = service(&store);
        let created = svc
            .create_batch(
                "env",
                vec![
                    test_support::new_resource("vpc", json!({})),
                    test_support::new_resource("net", json!({})),
                    test_support::new_resource("db", json!({"net": "${res.net.id}"})),
                    test_support::new_resource("app", json!({"db": "${res.db.id}"})),
                ],
            )
            .await
            .unwrap();
        let (vpc, net, db, app) = (&created[0], &created[1], &created[2], &created[3]);
        test_support::set_status(&store, &db.id, |st| *st = test_support::ready_status()).await;

        let upgraded = svc
            .upgrade(&net.id, attrs(json!({"vpc": "${res.vpc.id}"})), None)
            .await
            .unwrap();

        assert_eq!(upgraded.attributes["vpc"], json!("${res.vpc.id}"));
        assert!(upgraded.status.summary.transitioning);
        let app_paths: Vec<Vec<String>> = store
            .get_dependencies(&app.id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.path)
            .collect();
        assert_eq!(app_paths.len(), 3);
        assert!(app_paths.contains(&vec![
            vpc.id.clone(),
            net.id.clone(),
            db.id.clone(),
            app.id.clone()
        ]));
        // Dependants keep their own status.
        let db = test_support::reload(&store, &db.id).await;
        assert!(rs::is_ready(&db.status));
    }

    #[tokio::test]
    async fn test_upgrade_into_cycle_is_rejected() {
        let store = test_support::store().await;
        let svc = service(&store);
        let created = svc
            .create_batch(
                "env",
                vec![
                    test_support::new_resource("a", json!({})),
                    test_support::new_resource("b", json!({"a": "${res.a.id}"})),
                ],
            )
            .await
            .unwrap();

        let err = svc
            .upgrade(&created[0].id, attrs(json!({"b": "${res.b.id}"})), None)
            .await
            .unwrap_err();

        match err {
            CoreError::Cycle(e) => {
                assert!(e.path().contains(&"a".to_string()));
                assert!(e.path().contains(&"b".to_string()));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
        let a = test_support::reload(&store, &created[0].id).await;
        assert!(a.attributes.is_empty());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = test_support::store().await;
        let vpc = test_support::insert(&store, "env", "vpc", json!({})).await;
        let svc = service(&store);

        let deleted = svc.delete(&vpc.id).await.unwrap().unwrap();
        assert_eq!(deleted.status.summary.summary, rs::SUMMARY_DELETING);
        assert!(svc.delete("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stop_then_start() {
        let store = test_support::store().await;
        let vpc = test_support::insert(&store, "env", "vpc", json!({})).await;
        test_support::set_status(&store, &vpc.id, |st| *st = test_support::ready_status()).await;
        let svc = service(&store);

        let err = svc.start(&vpc.id).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));

        let stopped = svc.stop(&vpc.id).await.unwrap();
        assert!(stopped.status.is_unknown(ConditionType::Stopped));

        let started = svc.start(&vpc.id).await.unwrap();
        assert!(!started.status.exists(ConditionType::Stopped));
        assert!(started.status.is_unknown(ConditionType::Progressing));
        assert_eq!(
            test_support::reload(&store, &vpc.id).await.status,
            started.status
        );
    }

    #[tokio::test]
    async fn test_stop_deleting_resource_fails() {
        let store = test_support::store().await;
        let vpc = test_support::insert(&store, "env", "vpc", json!({})).await;
        let svc = service(&store);
        svc.delete(&vpc.id).await.unwrap();

        let err = svc.stop(&vpc.id).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));
        let err = svc.stop("missing").await.unwrap_err();
        assert!(matches!(err, CoreError::ResourceNotFound(_)));
    }
}
