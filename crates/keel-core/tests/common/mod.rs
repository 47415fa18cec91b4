// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared helpers for keel-core integration tests.

#![allow(dead_code)]

use chrono::Utc;
use keel_core::models::{JobType, NewResource, Resource, Run};
use keel_core::status::{self, ConditionStatus};
use serde_json::json;
use sqlx::PgPool;

/// Helper macro to skip tests if database URL is not set.
#[macro_export]
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_KEEL_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_KEEL_DATABASE_URL not set");
            return;
        }
    };
}

/// Get a migrated database pool for testing.
pub async fn get_test_pool() -> Option<PgPool> {
    let database_url = std::env::var("TEST_KEEL_DATABASE_URL").ok()?;
    let pool = PgPool::connect(&database_url).await.ok()?;
    keel_core::migrations::run_postgres(&pool).await.ok()?;
    Some(pool)
}

/// A fresh environment id so tests never see each other's rows.
pub fn environment() -> String {
    format!("test-env-{}", uuid::Uuid::new_v4())
}

/// A resource pending apply in the given environment.
pub fn resource(environment_id: &str, name: &str) -> Resource {
    NewResource {
        name: name.to_string(),
        attributes: json!({"name": name}).as_object().cloned().unwrap_or_default(),
        subject: Some("tester".to_string()),
        ..Default::default()
    }
    .into_resource(environment_id)
}

/// An apply run of a resource in the given state.
pub fn run(resource: &Resource, state: ConditionStatus) -> Run {
    Run {
        id: uuid::Uuid::new_v4().to_string(),
        resource_id: resource.id.clone(),
        environment_id: resource.environment_id.clone(),
        deployer_type: resource.deployer_type.clone(),
        job_type: JobType::Apply,
        status: status::run::new(state, ""),
        template: None,
        attributes: resource.attributes.clone(),
        computed_attributes: Default::default(),
        output: String::new(),
        previous_required_providers: vec![],
        change_comment: None,
        created_by: "tester".to_string(),
        created_at: Utc::now(),
        finished_at: None,
    }
}

/// Remove everything a test created in its environment.
pub async fn cleanup(pool: &PgPool, environment_id: &str) {
    let _ = sqlx::query(
        "DELETE FROM resource_relationships WHERE resource_id IN (SELECT id FROM resources WHERE environment_id = $1)",
    )
    .bind(environment_id)
    .execute(pool)
    .await;
    let _ = sqlx::query("DELETE FROM runs WHERE environment_id = $1")
        .bind(environment_id)
        .execute(pool)
        .await;
    let _ = sqlx::query("DELETE FROM resources WHERE environment_id = $1")
        .bind(environment_id)
        .execute(pool)
        .await;
}
