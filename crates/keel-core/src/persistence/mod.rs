// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for keel-core.
//!
//! This module defines the store abstraction and backend implementations.
//! Every multi-row write that must be atomic is a single store method that
//! runs its own transaction; callers never hold a transaction open.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresStore;
pub use self::sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::models::{
    DriftDetection, JobType, ProviderRequirement, Relationship, Resource, ResourceSource, Run,
    TemplateRef,
};
use crate::status::{ConditionStatus, Status, Summary};

/// Resource row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResourceRecord {
    /// Unique identifier.
    pub id: String,
    /// Owning environment.
    pub environment_id: String,
    /// Name, unique per environment.
    pub name: String,
    /// Deployer registry key.
    pub deployer_type: String,
    /// Connector used by status sync.
    pub connector_id: Option<String>,
    /// Recorded subject.
    pub subject: Option<String>,
    /// JSON object.
    pub attributes: String,
    /// JSON object.
    pub computed_attributes: String,
    /// JSON object of string labels.
    pub labels: String,
    /// JSON-encoded [`ResourceSource`].
    pub source: Option<String>,
    /// Summary display.
    pub status_summary: String,
    /// Summary message.
    pub status_message: String,
    /// Summary transitioning flag.
    pub status_transitioning: bool,
    /// Summary error flag.
    pub status_error: bool,
    /// JSON array of conditions.
    pub status_conditions: String,
    /// JSON-encoded [`DriftDetection`].
    pub drift_detection: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl ResourceRecord {
    /// Encode a domain resource.
    pub fn encode(r: &Resource) -> Result<Self, CoreError> {
        Ok(Self {
            id: r.id.clone(),
            environment_id: r.environment_id.clone(),
            name: r.name.clone(),
            deployer_type: r.deployer_type.clone(),
            connector_id: r.connector_id.clone(),
            subject: r.subject.clone(),
            attributes: serde_json::to_string(&r.attributes)?,
            computed_attributes: serde_json::to_string(&r.computed_attributes)?,
            labels: serde_json::to_string(&r.labels)?,
            source: r.source.as_ref().map(serde_json::to_string).transpose()?,
            status_summary: r.status.summary.summary.clone(),
            status_message: r.status.summary.message.clone(),
            status_transitioning: r.status.summary.transitioning,
            status_error: r.status.summary.error,
            status_conditions: serde_json::to_string(&r.status.conditions)?,
            drift_detection: r
                .drift_detection
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }

    /// Decode into the domain resource.
    pub fn decode(self) -> Result<Resource, CoreError> {
        Ok(Resource {
            id: self.id,
            environment_id: self.environment_id,
            name: self.name,
            deployer_type: self.deployer_type,
            connector_id: self.connector_id,
            subject: self.subject,
            attributes: serde_json::from_str(&self.attributes)?,
            computed_attributes: serde_json::from_str(&self.computed_attributes)?,
            labels: serde_json::from_str(&self.labels)?,
            source: self
                .source
                .as_deref()
                .map(serde_json::from_str::<ResourceSource>)
                .transpose()?,
            status: Status {
                summary: Summary {
                    summary: self.status_summary,
                    message: self.status_message,
                    transitioning: self.status_transitioning,
                    error: self.status_error,
                },
                conditions: serde_json::from_str(&self.status_conditions)?,
            },
            drift_detection: self
                .drift_detection
                .as_deref()
                .map(serde_json::from_str::<DriftDetection>)
                .transpose()?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Run row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunRecord {
    /// Unique identifier.
    pub id: String,
    /// Owning resource.
    pub resource_id: String,
    /// Environment of the resource.
    pub environment_id: String,
    /// Deployer registry key.
    pub deployer_type: String,
    /// `apply`, `destroy` or `stop`.
    pub job_type: String,
    /// `Unknown`, `True` or `False`; mirrors the `Completed` condition.
    pub state: String,
    /// Summary display.
    pub status_summary: String,
    /// Summary message.
    pub status_message: String,
    /// JSON array of conditions.
    pub status_conditions: String,
    /// JSON-encoded [`TemplateRef`].
    pub template: Option<String>,
    /// JSON object.
    pub attributes: String,
    /// JSON object.
    pub computed_attributes: String,
    /// Backend state blob.
    pub output: String,
    /// JSON array of [`ProviderRequirement`].
    pub previous_required_providers: String,
    /// Change comment.
    pub change_comment: Option<String>,
    /// Acting subject.
    pub created_by: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Completion time.
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    /// Encode a domain run.
    pub fn encode(run: &Run) -> Result<Self, CoreError> {
        Ok(Self {
            id: run.id.clone(),
            resource_id: run.resource_id.clone(),
            environment_id: run.environment_id.clone(),
            deployer_type: run.deployer_type.clone(),
            job_type: run.job_type.as_str().to_string(),
            state: run.state().as_str().to_string(),
            status_summary: run.status.summary.summary.clone(),
            status_message: run.status.summary.message.clone(),
            status_conditions: serde_json::to_string(&run.status.conditions)?,
            template: run.template.as_ref().map(serde_json::to_string).transpose()?,
            attributes: serde_json::to_string(&run.attributes)?,
            computed_attributes: serde_json::to_string(&run.computed_attributes)?,
            output: run.output.clone(),
            previous_required_providers: serde_json::to_string(&run.previous_required_providers)?,
            change_comment: run.change_comment.clone(),
            created_by: run.created_by.clone(),
            created_at: run.created_at,
            finished_at: run.finished_at,
        })
    }

    /// Decode into the domain run.
    pub fn decode(self) -> Result<Run, CoreError> {
        let job_type: JobType = self.job_type.parse().map_err(CoreError::InvalidState)?;
        let state: ConditionStatus = self.state.parse().map_err(CoreError::InvalidState)?;
        Ok(Run {
            id: self.id,
            resource_id: self.resource_id,
            environment_id: self.environment_id,
            deployer_type: self.deployer_type,
            job_type,
            status: Status {
                summary: Summary {
                    summary: self.status_summary,
                    message: self.status_message,
                    transitioning: state == ConditionStatus::Unknown,
                    error: state == ConditionStatus::False,
                },
                conditions: serde_json::from_str(&self.status_conditions)?,
            },
            template: self
                .template
                .as_deref()
                .map(serde_json::from_str::<TemplateRef>)
                .transpose()?,
            attributes: serde_json::from_str(&self.attributes)?,
            computed_attributes: serde_json::from_str(&self.computed_attributes)?,
            output: self.output,
            previous_required_providers: serde_json::from_str::<Vec<ProviderRequirement>>(
                &self.previous_required_providers,
            )?,
            change_comment: self.change_comment,
            created_by: self.created_by,
            created_at: self.created_at,
            finished_at: self.finished_at,
        })
    }
}

/// Relationship row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RelationshipRecord {
    /// Dependant side.
    pub resource_id: String,
    /// Dependency side.
    pub dependency_id: String,
    /// JSON array of resource ids.
    pub path: String,
    /// `implicit` or `explicit`.
    pub kind: String,
}

impl RelationshipRecord {
    /// Encode a domain relationship.
    pub fn encode(r: &Relationship) -> Result<Self, CoreError> {
        Ok(Self {
            resource_id: r.resource_id.clone(),
            dependency_id: r.dependency_id.clone(),
            path: serde_json::to_string(&r.path)?,
            kind: r.kind.as_str().to_string(),
        })
    }

    /// Decode into the domain relationship.
    pub fn decode(self) -> Result<Relationship, CoreError> {
        Ok(Relationship {
            resource_id: self.resource_id,
            dependency_id: self.dependency_id,
            path: serde_json::from_str(&self.path)?,
            kind: self.kind.parse().map_err(CoreError::InvalidState)?,
        })
    }
}

pub(crate) fn decode_all<R, T>(
    records: Vec<R>,
    decode: impl Fn(R) -> Result<T, CoreError>,
) -> Result<Vec<T>, CoreError> {
    records.into_iter().map(decode).collect()
}

/// Resource and relationship access.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Load a resource by id.
    async fn get_resource(&self, id: &str) -> Result<Option<Resource>, CoreError>;

    /// Load a resource by name within an environment.
    async fn get_resource_by_name(
        &self,
        environment_id: &str,
        name: &str,
    ) -> Result<Option<Resource>, CoreError>;

    /// All resources of an environment, oldest first.
    async fn list_resources(&self, environment_id: &str) -> Result<Vec<Resource>, CoreError>;

    /// Resources whose summary matches, optionally filtered on the
    /// transitioning flag, oldest first.
    async fn list_resources_by_status(
        &self,
        summary: &str,
        transitioning: Option<bool>,
    ) -> Result<Vec<Resource>, CoreError>;

    /// Persist the status of a resource.
    async fn update_resource_status(&self, id: &str, status: &Status) -> Result<(), CoreError>;

    /// Persist every mutable field of a resource (attributes, source,
    /// labels, status, drift detection).
    async fn update_resource(&self, resource: &Resource) -> Result<(), CoreError>;

    /// Insert resources and their relationship rows atomically, in order.
    async fn create_resources(
        &self,
        resources: &[Resource],
        relationships: &[Relationship],
    ) -> Result<(), CoreError>;

    /// Update a resource and replace the relationship rows of every listed
    /// resource atomically.
    async fn update_resource_with_relationships(
        &self,
        resource: &Resource,
        relationships: &[(String, Vec<Relationship>)],
    ) -> Result<(), CoreError>;

    /// Remove a resource and every relationship row touching it.
    async fn delete_resource(&self, id: &str) -> Result<(), CoreError>;

    /// Every stored relationship row of a resource, self row included.
    async fn get_relationships(&self, resource_id: &str) -> Result<Vec<Relationship>, CoreError>;

    /// Implicit dependency edges of a resource (`dependency_id != resource_id`).
    async fn get_dependencies(&self, resource_id: &str) -> Result<Vec<Relationship>, CoreError>;

    /// Distinct resources that depend on the given one.
    async fn get_dependants(&self, resource_id: &str) -> Result<Vec<Resource>, CoreError>;
}

/// Run access.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Most recent run of a resource, optionally for one deployer type.
    async fn latest_run(
        &self,
        resource_id: &str,
        deployer_type: Option<&str>,
    ) -> Result<Option<Run>, CoreError>;

    /// Load a run by id.
    async fn get_run(&self, id: &str) -> Result<Option<Run>, CoreError>;

    /// Runs of a resource, newest first.
    async fn list_runs(&self, resource_id: &str) -> Result<Vec<Run>, CoreError>;

    /// Insert a run unless the resource already has one running.
    ///
    /// The check and the insert share a transaction and the schema enforces
    /// one running run per resource, so a lost race also fails with
    /// [`CoreError::DeploymentRunning`].
    async fn create_run(&self, run: &Run) -> Result<(), CoreError>;

    /// Persist a run status, completion time and, when given, a new output.
    async fn update_run_status(
        &self,
        id: &str,
        status: &Status,
        finished_at: Option<DateTime<Utc>>,
        output: Option<&str>,
    ) -> Result<(), CoreError>;
}

/// Both stores behind one handle.
pub trait Store: ResourceStore + RunStore {}

impl<T: ResourceStore + RunStore> Store for T {}

pub(crate) const RESOURCE_COLUMNS: &str = "id, environment_id, name, deployer_type, connector_id, subject, \
     attributes, computed_attributes, labels, source, \
     status_summary, status_message, status_transitioning, status_error, status_conditions, \
     drift_detection, created_at, updated_at";

pub(crate) const RUN_COLUMNS: &str = "id, resource_id, environment_id, deployer_type, job_type, state, \
     status_summary, status_message, status_conditions, template, attributes, computed_attributes, \
     output, previous_required_providers, change_comment, created_by, created_at, finished_at";
