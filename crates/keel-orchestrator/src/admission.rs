// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run admission.
//!
//! [`RunAdmissionManager`] is the only way runs are created or change state.
//! Creating a run is single-flight per resource: while the latest run is
//! still `Unknown` every new request fails with
//! [`CoreError::DeploymentRunning`]. Every state change is published on the
//! [`Bus`].

use std::sync::Arc;

use chrono::Utc;
use keel_core::bus::{Bus, RunChangedEvent};
use keel_core::error::CoreError;
use keel_core::models::{Attributes, JobType, ProviderRequirement, Resource, ResourceSource, Run, TemplateRef};
use keel_core::persistence::Store;
use keel_core::state;
use keel_core::status::{self, ConditionStatus};
use tracing::{debug, info};

/// Request to create a run.
#[derive(Debug, Clone)]
pub struct CreateRunOptions {
    /// Resource to run against.
    pub resource_id: String,
    /// Deployer that will execute the run.
    pub deployer_type: String,
    /// Job kind.
    pub job_type: JobType,
    /// Free-form change comment.
    pub change_comment: Option<String>,
    /// Acting subject of the request; falls back to the resource's subject.
    pub subject: Option<String>,
}

impl CreateRunOptions {
    /// Options for a job against a resource, acting as the resource's subject.
    pub fn for_resource(resource: &Resource, job_type: JobType) -> Self {
        Self {
            resource_id: resource.id.clone(),
            deployer_type: resource.deployer_type.clone(),
            job_type,
            change_comment: None,
            subject: None,
        }
    }
}

/// Creates runs and moves them between states.
pub struct RunAdmissionManager {
    store: Arc<dyn Store>,
    bus: Bus,
}

impl RunAdmissionManager {
    /// Create a manager over a store, publishing on `bus`.
    pub fn new(store: Arc<dyn Store>, bus: Bus) -> Self {
        Self { store, bus }
    }

    /// Bus run changes are published on.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Admit a new run for a resource.
    pub async fn create(&self, options: CreateRunOptions) -> Result<Run, CoreError> {
        let resource = self
            .store
            .get_resource(&options.resource_id)
            .await?
            .ok_or_else(|| CoreError::ResourceNotFound(options.resource_id.clone()))?;

        let previous = self
            .store
            .latest_run(&resource.id, Some(&options.deployer_type))
            .await?;
        if previous.as_ref().is_some_and(Run::is_running) {
            return Err(CoreError::DeploymentRunning);
        }

        let source = resource.source.as_ref().ok_or(CoreError::NoTemplate)?;
        let (template, attributes) = merge_attributes(source, &resource.attributes);

        let subject = non_empty(options.subject.as_deref())
            .or_else(|| non_empty(resource.subject.as_deref()))
            .ok_or(CoreError::NoSubject)?;

        let mut run = Run {
            id: uuid::Uuid::new_v4().to_string(),
            resource_id: resource.id.clone(),
            environment_id: resource.environment_id.clone(),
            deployer_type: options.deployer_type.clone(),
            job_type: options.job_type,
            status: status::run::new(ConditionStatus::Unknown, ""),
            template: Some(template),
            attributes,
            computed_attributes: resource.computed_attributes.clone(),
            output: String::new(),
            previous_required_providers: Vec::new(),
            change_comment: options.change_comment.clone(),
            created_by: subject.to_string(),
            created_at: Utc::now(),
            finished_at: None,
        };

        if let Some(prev) = previous.filter(|p| !p.output.trim().is_empty()) {
            run.output = prev.output.clone();
            match options.job_type {
                JobType::Apply => {
                    run.previous_required_providers = carried_providers(&prev);
                }
                JobType::Destroy | JobType::Stop => {
                    if prev.state() == ConditionStatus::False {
                        run.previous_required_providers = carried_providers(&prev);
                    } else {
                        // Tear down what was deployed, not the latest edit.
                        run.previous_required_providers = prev.previous_required_providers;
                        run.template = prev.template;
                        run.attributes = prev.attributes;
                        run.computed_attributes = prev.computed_attributes;
                    }
                }
            }
        }

        self.store.create_run(&run).await?;

        info!(
            run_id = %run.id,
            resource_id = %run.resource_id,
            job_type = %run.job_type,
            created_by = %run.created_by,
            "Run admitted"
        );

        self.bus
            .notify(RunChangedEvent {
                run_id: run.id.clone(),
                resource_id: run.resource_id.clone(),
                job_type: run.job_type,
                status: ConditionStatus::Unknown,
            })
            .await;

        Ok(run)
    }

    /// Move a run to a new state.
    ///
    /// A terminal state records the completion time; `output`, when given,
    /// replaces the stored backend state.
    pub async fn update_status(
        &self,
        run_id: &str,
        state: ConditionStatus,
        message: &str,
        output: Option<&str>,
    ) -> Result<Run, CoreError> {
        let mut run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| CoreError::RunNotFound(run_id.to_string()))?;

        status::run::set(&mut run.status, state, message);
        if state != ConditionStatus::Unknown {
            run.finished_at = Some(Utc::now());
        }
        if let Some(output) = output {
            run.output = output.to_string();
        }

        self.store
            .update_run_status(&run.id, &run.status, run.finished_at, output)
            .await?;

        debug!(run_id = %run.id, state = %state, summary = %run.status.summary.summary, "Run status updated");

        self.bus
            .notify(RunChangedEvent {
                run_id: run.id.clone(),
                resource_id: run.resource_id.clone(),
                job_type: run.job_type,
                status: state,
            })
            .await;

        Ok(run)
    }
}

/// Template and attributes a run of this source deploys.
///
/// A definition rule supplies base attributes that the resource's own
/// attributes override key by key.
pub fn merge_attributes(source: &ResourceSource, own: &Attributes) -> (TemplateRef, Attributes) {
    match source {
        ResourceSource::Template(template) => (template.clone(), own.clone()),
        ResourceSource::Definition(rule) => {
            let mut merged = rule.attributes.clone();
            for (k, v) in own {
                merged.insert(k.clone(), v.clone());
            }
            (rule.template.clone(), merged)
        }
    }
}

/// Providers of the previous run that still own resources in its state.
fn carried_providers(prev: &Run) -> Vec<ProviderRequirement> {
    let mut candidates: Vec<ProviderRequirement> = prev
        .template
        .as_ref()
        .map(|t| t.required_providers.clone())
        .unwrap_or_default();
    for p in &prev.previous_required_providers {
        if !candidates.iter().any(|c| c.name == p.name) {
            candidates.push(p.clone());
        }
    }
    state::required_providers_from_state(&candidates, &prev.output)
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}
