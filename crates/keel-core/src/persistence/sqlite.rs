// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed store implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{SqliteConnection, SqlitePool};

use crate::error::{CoreError, is_unique_violation};
use crate::models::{Relationship, Resource, Run};
use crate::status::{self, Status};

use super::{
    RESOURCE_COLUMNS, RUN_COLUMNS, RelationshipRecord, ResourceRecord, ResourceStore, RunRecord,
    RunStore, decode_all,
};

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Create a new SQLite store from an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite store from a file path.
    ///
    /// Creates parent directories and the database file when missing, then
    /// runs all migrations.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let store = SqliteStore::from_path(".data/keel.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        crate::migrations::SQLITE.run(&pool).await?;

        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn insert_resource(conn: &mut SqliteConnection, r: &Resource) -> Result<(), CoreError> {
    let rec = ResourceRecord::encode(r)?;
    sqlx::query(
        r#"
        INSERT INTO resources (
            id, environment_id, name, deployer_type, connector_id, subject,
            attributes, computed_attributes, labels, source,
            status_summary, status_message, status_transitioning, status_error, status_conditions,
            drift_detection, created_at, updated_at
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
        "#,
    )
    .bind(&rec.id)
    .bind(&rec.environment_id)
    .bind(&rec.name)
    .bind(&rec.deployer_type)
    .bind(&rec.connector_id)
    .bind(&rec.subject)
    .bind(&rec.attributes)
    .bind(&rec.computed_attributes)
    .bind(&rec.labels)
    .bind(&rec.source)
    .bind(&rec.status_summary)
    .bind(&rec.status_message)
    .bind(rec.status_transitioning)
    .bind(rec.status_error)
    .bind(&rec.status_conditions)
    .bind(&rec.drift_detection)
    .bind(rec.created_at)
    .bind(rec.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            CoreError::DuplicateResource {
                environment_id: r.environment_id.clone(),
                name: r.name.clone(),
            }
        } else {
            e.into()
        }
    })?;
    Ok(())
}

async fn write_resource(conn: &mut SqliteConnection, r: &Resource) -> Result<(), CoreError> {
    let rec = ResourceRecord::encode(r)?;
    let result = sqlx::query(
        r#"
        UPDATE resources
        SET attributes = ?2,
            computed_attributes = ?3,
            labels = ?4,
            source = ?5,
            connector_id = ?6,
            status_summary = ?7,
            status_message = ?8,
            status_transitioning = ?9,
            status_error = ?10,
            status_conditions = ?11,
            drift_detection = ?12,
            updated_at = ?13
        WHERE id = ?1
        "#,
    )
    .bind(&rec.id)
    .bind(&rec.attributes)
    .bind(&rec.computed_attributes)
    .bind(&rec.labels)
    .bind(&rec.source)
    .bind(&rec.connector_id)
    .bind(&rec.status_summary)
    .bind(&rec.status_message)
    .bind(rec.status_transitioning)
    .bind(rec.status_error)
    .bind(&rec.status_conditions)
    .bind(&rec.drift_detection)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(CoreError::ResourceNotFound(r.id.clone()));
    }
    Ok(())
}

async fn insert_relationship(
    conn: &mut SqliteConnection,
    rel: &Relationship,
) -> Result<(), CoreError> {
    let rec = RelationshipRecord::encode(rel)?;
    sqlx::query(
        r#"
        INSERT INTO resource_relationships (resource_id, dependency_id, path, kind)
        VALUES (?1, ?2, ?3, ?4)
        ON CONFLICT (resource_id, path) DO NOTHING
        "#,
    )
    .bind(&rec.resource_id)
    .bind(&rec.dependency_id)
    .bind(&rec.path)
    .bind(&rec.kind)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[async_trait::async_trait]
impl ResourceStore for SqliteStore {
    async fn get_resource(&self, id: &str) -> Result<Option<Resource>, CoreError> {
        let sql = format!("SELECT {} FROM resources WHERE id = ?1", RESOURCE_COLUMNS);
        let record = sqlx::query_as::<_, ResourceRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        record.map(ResourceRecord::decode).transpose()
    }

    async fn get_resource_by_name(
        &self,
        environment_id: &str,
        name: &str,
    ) -> Result<Option<Resource>, CoreError> {
        let sql = format!(
            "SELECT {} FROM resources WHERE environment_id = ?1 AND name = ?2",
            RESOURCE_COLUMNS
        );
        let record = sqlx::query_as::<_, ResourceRecord>(&sql)
            .bind(environment_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        record.map(ResourceRecord::decode).transpose()
    }

    async fn list_resources(&self, environment_id: &str) -> Result<Vec<Resource>, CoreError> {
        let sql = format!(
            "SELECT {} FROM resources WHERE environment_id = ?1 ORDER BY created_at, name",
            RESOURCE_COLUMNS
        );
        let records = sqlx::query_as::<_, ResourceRecord>(&sql)
            .bind(environment_id)
            .fetch_all(&self.pool)
            .await?;
        decode_all(records, ResourceRecord::decode)
    }

    async fn list_resources_by_status(
        &self,
        summary: &str,
        transitioning: Option<bool>,
    ) -> Result<Vec<Resource>, CoreError> {
        let sql = format!(
            r#"
            SELECT {} FROM resources
            WHERE status_summary = ?1
              AND (?2 IS NULL OR status_transitioning = ?2)
            ORDER BY created_at, name
            "#,
            RESOURCE_COLUMNS
        );
        let records = sqlx::query_as::<_, ResourceRecord>(&sql)
            .bind(summary)
            .bind(transitioning)
            .fetch_all(&self.pool)
            .await?;
        decode_all(records, ResourceRecord::decode)
    }

    async fn update_resource_status(&self, id: &str, status: &Status) -> Result<(), CoreError> {
        let conditions = serde_json::to_string(&status.conditions)?;
        let result = sqlx::query(
            r#"
            UPDATE resources
            SET status_summary = ?2,
                status_message = ?3,
                status_transitioning = ?4,
                status_error = ?5,
                status_conditions = ?6,
                updated_at = ?7
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(&status.summary.summary)
        .bind(&status.summary.message)
        .bind(status.summary.transitioning)
        .bind(status.summary.error)
        .bind(&conditions)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::ResourceNotFound(id.to_string()));
        }
        Ok(())
    }

    async fn update_resource(&self, resource: &Resource) -> Result<(), CoreError> {
        let mut conn = self.pool.acquire().await?;
        write_resource(&mut conn, resource).await
    }

    async fn create_resources(
        &self,
        resources: &[Resource],
        relationships: &[Relationship],
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        for r in resources {
            insert_resource(&mut tx, r).await?;
        }
        for rel in relationships {
            insert_relationship(&mut tx, rel).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_resource_with_relationships(
        &self,
        resource: &Resource,
        relationships: &[(String, Vec<Relationship>)],
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        write_resource(&mut tx, resource).await?;
        for (resource_id, rows) in relationships {
            sqlx::query("DELETE FROM resource_relationships WHERE resource_id = ?1")
                .bind(resource_id)
                .execute(&mut *tx)
                .await?;
            for rel in rows {
                insert_relationship(&mut tx, rel).await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_resource(&self, id: &str) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM resource_relationships WHERE resource_id = ?1 OR dependency_id = ?1",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM resources WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_relationships(&self, resource_id: &str) -> Result<Vec<Relationship>, CoreError> {
        let records = sqlx::query_as::<_, RelationshipRecord>(
            r#"
            SELECT resource_id, dependency_id, path, kind
            FROM resource_relationships
            WHERE resource_id = ?1
            ORDER BY dependency_id, path
            "#,
        )
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await?;
        decode_all(records, RelationshipRecord::decode)
    }

    async fn get_dependencies(&self, resource_id: &str) -> Result<Vec<Relationship>, CoreError> {
        let records = sqlx::query_as::<_, RelationshipRecord>(
            r#"
            SELECT resource_id, dependency_id, path, kind
            FROM resource_relationships
            WHERE resource_id = ?1
              AND dependency_id <> ?1
              AND kind = 'implicit'
            ORDER BY dependency_id, path
            "#,
        )
        .bind(resource_id)
        .fetch_all(&self.pool)
        .await?;
        decode_all(records, RelationshipRecord::decode)
    }

    async fn get_dependants(&self, resource_id: &str) -> Result<Vec<Resource>, CoreError> {
        let sql = format!(
            r#"
            SELECT {} FROM resources
            WHERE id IN (
                SELECT resource_id FROM resource_relationships
                WHERE dependency_id = ?1 AND resource_id <> ?1
            )
            ORDER BY created_at, name
            "#,
            RESOURCE_COLUMNS
        );
        let records = sqlx::query_as::<_, ResourceRecord>(&sql)
            .bind(resource_id)
            .fetch_all(&self.pool)
            .await?;
        decode_all(records, ResourceRecord::decode)
    }
}

#[async_trait::async_trait]
impl RunStore for SqliteStore {
    async fn latest_run(
        &self,
        resource_id: &str,
        deployer_type: Option<&str>,
    ) -> Result<Option<Run>, CoreError> {
        let sql = format!(
            r#"
            SELECT {} FROM runs
            WHERE resource_id = ?1
              AND (?2 IS NULL OR deployer_type = ?2)
            ORDER BY created_at DESC, seq DESC
            LIMIT 1
            "#,
            RUN_COLUMNS
        );
        let record = sqlx::query_as::<_, RunRecord>(&sql)
            .bind(resource_id)
            .bind(deployer_type)
            .fetch_optional(&self.pool)
            .await?;
        record.map(RunRecord::decode).transpose()
    }

    async fn get_run(&self, id: &str) -> Result<Option<Run>, CoreError> {
        let sql = format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS);
        let record = sqlx::query_as::<_, RunRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        record.map(RunRecord::decode).transpose()
    }

    async fn list_runs(&self, resource_id: &str) -> Result<Vec<Run>, CoreError> {
        let sql = format!(
            "SELECT {} FROM runs WHERE resource_id = ?1 ORDER BY created_at DESC, seq DESC",
            RUN_COLUMNS
        );
        let records = sqlx::query_as::<_, RunRecord>(&sql)
            .bind(resource_id)
            .fetch_all(&self.pool)
            .await?;
        decode_all(records, RunRecord::decode)
    }

    async fn create_run(&self, run: &Run) -> Result<(), CoreError> {
        let rec = RunRecord::encode(run)?;
        let mut tx = self.pool.begin().await?;

        let running: Option<(String,)> = sqlx::query_as(
            "SELECT id FROM runs WHERE resource_id = ?1 AND state = 'Unknown' LIMIT 1",
        )
        .bind(&rec.resource_id)
        .fetch_optional(&mut *tx)
        .await?;
        if running.is_some() {
            return Err(CoreError::DeploymentRunning);
        }

        sqlx::query(
            r#"
            INSERT INTO runs (
                id, resource_id, environment_id, deployer_type, job_type, state,
                status_summary, status_message, status_conditions, template,
                attributes, computed_attributes, output, previous_required_providers,
                change_comment, created_by, created_at, finished_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
            "#,
        )
        .bind(&rec.id)
        .bind(&rec.resource_id)
        .bind(&rec.environment_id)
        .bind(&rec.deployer_type)
        .bind(&rec.job_type)
        .bind(&rec.state)
        .bind(&rec.status_summary)
        .bind(&rec.status_message)
        .bind(&rec.status_conditions)
        .bind(&rec.template)
        .bind(&rec.attributes)
        .bind(&rec.computed_attributes)
        .bind(&rec.output)
        .bind(&rec.previous_required_providers)
        .bind(&rec.change_comment)
        .bind(&rec.created_by)
        .bind(rec.created_at)
        .bind(rec.finished_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                CoreError::DeploymentRunning
            } else {
                e.into()
            }
        })?;

        tx.commit().await?;
        Ok(())
    }

    async fn update_run_status(
        &self,
        id: &str,
        status: &Status,
        finished_at: Option<DateTime<Utc>>,
        output: Option<&str>,
    ) -> Result<(), CoreError> {
        let conditions = serde_json::to_string(&status.conditions)?;
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET state = ?2,
                status_summary = ?3,
                status_message = ?4,
                status_conditions = ?5,
                finished_at = ?6,
                output = COALESCE(?7, output)
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .bind(status::run::state(status).as_str())
        .bind(&status.summary.summary)
        .bind(&status.summary.message)
        .bind(&conditions)
        .bind(finished_at)
        .bind(output)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::RunNotFound(id.to_string()));
        }
        Ok(())
    }
}
