// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Terraform deployer.
//!
//! Every job gets its own directory holding a rendered `main.tf.json` and
//! the inherited `terraform.tfstate`:
//!
//! ```text
//! <data_dir>/
//! ├── runs/<run_id>/        apply, destroy and stop jobs
//! │   ├── main.tf.json
//! │   ├── terraform.tfstate
//! │   └── job.log
//! └── drift/<job_id>/       drift checks, removed when done
//! ```
//!
//! The template is rendered as a single module named `resource`, with one
//! root output per declared module output. After the job the state file is
//! read back into the run's output and its outputs become the resource's
//! computed attributes, which is what `${res.<name>.<output>}` resolves to.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use keel_core::error::CoreError;
use keel_core::graph;
use keel_core::models::{Attributes, DriftDetection, JobType, ProviderRequirement, Resource, Run};
use keel_core::persistence::Store;
use keel_core::state;
use keel_core::status::{ConditionStatus, ConditionType, resource as rs};
use serde_json::{Map, Value, json};
use tracing::{debug, error, info, warn};

use super::{DeployOptions, Deployer, DeployerError, Result, complete_job};
use crate::admission::{CreateRunOptions, RunAdmissionManager};
use crate::runner::{JobHandle, JobOptions, JobResult, JobRunner, log_tail};

/// Registry key of this deployer.
pub const DEPLOYER_TYPE: &str = "terraform";

/// Label carrying the run id of apply, destroy and stop jobs.
pub const LABEL_RUN_ID: &str = "keel.io/run-id";
/// Label carrying the resource id.
pub const LABEL_RESOURCE_ID: &str = "keel.io/resource-id";
/// Label carrying the job type (`apply`, `destroy`, `stop`, `detect`).
pub const LABEL_JOB_TYPE: &str = "keel.io/job-type";
/// Label marking drift detection jobs.
pub const LABEL_DRIFT_DETECTION: &str = "keel.io/drift-detection";

const CONFIG_FILE: &str = "main.tf.json";
const STATE_FILE: &str = "terraform.tfstate";
const MODULE_NAME: &str = "resource";

/// `plan -detailed-exitcode` exit code for a non-empty diff.
const EXIT_DRIFTED: i32 = 2;

/// Terraform deployer configuration.
#[derive(Debug, Clone)]
pub struct TerraformConfig {
    /// Root for job directories
    pub data_dir: PathBuf,
    /// Terraform executable
    pub terraform_bin: String,
    /// Wall-clock limit of one job
    pub job_timeout: Duration,
    /// How often running jobs are polled
    pub poll_interval: Duration,
}

impl Default for TerraformConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".data"),
            terraform_bin: "terraform".to_string(),
            job_timeout: Duration::from_secs(3600),
            poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Apply,
    Destroy,
    Detect,
}

impl Command {
    fn for_job(job_type: JobType) -> Self {
        match job_type {
            JobType::Apply => Self::Apply,
            JobType::Destroy | JobType::Stop => Self::Destroy,
        }
    }

    fn args(&self) -> &'static str {
        match self {
            Self::Apply => "apply -auto-approve -input=false -no-color",
            Self::Destroy => "apply -destroy -auto-approve -input=false -no-color",
            Self::Detect => "plan -detailed-exitcode -refresh-only -lock=false -input=false -no-color",
        }
    }
}

/// Runs resources through Terraform.
pub struct TerraformDeployer {
    store: Arc<dyn Store>,
    admission: Arc<RunAdmissionManager>,
    runner: Arc<dyn JobRunner>,
    config: TerraformConfig,
}

impl TerraformDeployer {
    /// Create a deployer launching jobs through `runner`.
    pub fn new(
        store: Arc<dyn Store>,
        admission: Arc<RunAdmissionManager>,
        runner: Arc<dyn JobRunner>,
        config: TerraformConfig,
    ) -> Self {
        Self {
            store,
            admission,
            runner,
            config,
        }
    }

    /// Directory of a run's job.
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.config.data_dir.join("runs").join(run_id)
    }

    async fn execute(&self, resource: &Resource, job_type: JobType, options: &DeployOptions) -> Result<()> {
        let run = self
            .admission
            .create(CreateRunOptions {
                resource_id: resource.id.clone(),
                deployer_type: DEPLOYER_TYPE.to_string(),
                job_type,
                change_comment: options.change_comment.clone(),
                subject: options.subject.clone(),
            })
            .await?;

        if job_type != JobType::Apply && run.output.trim().is_empty() {
            info!(
                run_id = %run.id,
                resource_id = %resource.id,
                job_type = %job_type,
                "Nothing deployed, completing without a job"
            );
            self.admission
                .update_status(&run.id, ConditionStatus::True, "", None)
                .await?;
            complete_job(self.store.as_ref(), &resource.id, job_type, true, "", |_| {}).await?;
            return Ok(());
        }

        let dir = self.run_dir(&run.id);
        match self.launch_run(&run, &dir).await {
            Ok(handle) => {
                self.spawn_run_monitor(run, handle, dir);
                Ok(())
            }
            Err(e) => {
                warn!(run_id = %run.id, resource_id = %run.resource_id, error = %e, "Failed to launch job");
                if let Err(ue) = self
                    .admission
                    .update_status(&run.id, ConditionStatus::False, &e.to_string(), None)
                    .await
                {
                    error!(run_id = %run.id, error = %ue, "Failed to mark run as failed");
                }
                Err(e)
            }
        }
    }

    async fn launch_run(&self, run: &Run, dir: &Path) -> Result<JobHandle> {
        let config = self.render(run).await?;
        write_job_dir(dir, &config, &run.output).await?;

        let labels = BTreeMap::from([
            (LABEL_RUN_ID.to_string(), run.id.clone()),
            (LABEL_RESOURCE_ID.to_string(), run.resource_id.clone()),
            (LABEL_JOB_TYPE.to_string(), run.job_type.as_str().to_string()),
        ]);

        let handle = self
            .runner
            .launch_detached(&self.job_options(&run.id, dir, Command::for_job(run.job_type), labels))
            .await?;
        Ok(handle)
    }

    fn job_options(
        &self,
        job_id: &str,
        dir: &Path,
        command: Command,
        labels: BTreeMap<String, String>,
    ) -> JobOptions {
        let bin = shell_quote(&self.config.terraform_bin);
        let script = format!(
            "{bin} init -input=false -no-color && {bin} {}",
            command.args()
        );
        JobOptions {
            job_id: job_id.to_string(),
            work_dir: dir.to_path_buf(),
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script],
            env: HashMap::from([
                ("TF_IN_AUTOMATION".to_string(), "1".to_string()),
                ("TF_INPUT".to_string(), "0".to_string()),
            ]),
            labels,
        }
    }

    /// Render `main.tf.json` for a run.
    async fn render(&self, run: &Run) -> Result<Value> {
        let template = run.template.as_ref().ok_or(CoreError::NoTemplate)?;
        let attributes = self.resolve(&run.environment_id, &run.attributes).await?;

        let mut providers = template.required_providers.clone();
        for p in &run.previous_required_providers {
            if !providers.iter().any(|q| q.name == p.name) {
                providers.push(p.clone());
            }
        }

        let mut module = attributes;
        module.insert("source".to_string(), Value::String(template.source.clone()));

        let outputs: Map<String, Value> = template
            .outputs
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    json!({ "value": format!("${{module.{}.{}}}", MODULE_NAME, name) }),
                )
            })
            .collect();

        let mut config = json!({
            "terraform": { "required_providers": required_providers_block(&providers) },
            "module": { MODULE_NAME: module },
        });
        if !outputs.is_empty() {
            config["output"] = Value::Object(outputs);
        }
        Ok(config)
    }

    /// Replace `${res.<name>.<output>}` with the outputs of the named
    /// resources in the environment.
    async fn resolve(&self, environment_id: &str, attributes: &Attributes) -> Result<Attributes> {
        let mut outputs: HashMap<String, Attributes> = HashMap::new();
        for name in graph::parse_dependency_names(attributes) {
            let Some(dep) = self.store.get_resource_by_name(environment_id, &name).await? else {
                continue;
            };
            let mut values = dep.computed_attributes.clone();
            if let Some(run) = self.store.latest_run(&dep.id, Some(DEPLOYER_TYPE)).await? {
                values.extend(state::outputs(&run.output));
            }
            outputs.insert(name, values);
        }

        let lookup = |resource: &str, field: &str| outputs.get(resource).and_then(|o| o.get(field)).cloned();
        match graph::resolve_references(&Value::Object(attributes.clone()), &lookup) {
            Ok(Value::Object(resolved)) => Ok(resolved),
            Ok(_) => Err(DeployerError::Render("attributes must be an object".to_string())),
            Err(missing) => Err(DeployerError::Render(format!(
                "unresolved references: {}",
                missing.join(", ")
            ))),
        }
    }

    fn spawn_run_monitor(&self, run: Run, handle: JobHandle, dir: PathBuf) {
        let store = self.store.clone();
        let admission = self.admission.clone();
        let runner = self.runner.clone();
        let timeout = self.config.job_timeout;
        let poll = self.config.poll_interval;

        tokio::spawn(async move {
            let result = wait_for_job(runner.as_ref(), &handle, timeout, poll).await;
            let succeeded = result.success();
            let message = if succeeded {
                String::new()
            } else {
                result.failure_message()
            };
            let output = read_state(&dir).await;

            let state = if succeeded {
                ConditionStatus::True
            } else {
                ConditionStatus::False
            };
            if let Err(e) = admission
                .update_status(&run.id, state, &message, output.as_deref())
                .await
            {
                error!(run_id = %run.id, error = %e, "Failed to persist run result");
            }

            let job_type = run.job_type;
            let computed = output.as_deref().map(state::outputs);
            if let Err(e) = complete_job(store.as_ref(), &run.resource_id, job_type, succeeded, &message, |r| {
                if job_type == JobType::Apply
                    && succeeded
                    && let Some(computed) = computed
                {
                    r.computed_attributes = computed;
                }
            })
            .await
            {
                error!(run_id = %run.id, resource_id = %run.resource_id, error = %e, "Failed to apply job outcome");
            }
        });
    }

    fn spawn_detect_monitor(&self, resource_id: String, handle: JobHandle, dir: PathBuf) {
        let store = self.store.clone();
        let runner = self.runner.clone();
        let timeout = self.config.job_timeout;
        let poll = self.config.poll_interval;

        tokio::spawn(async move {
            let result = wait_for_job(runner.as_ref(), &handle, timeout, poll).await;
            let outcome = match (result.exit_code, &result.error) {
                (Some(0), None) => Ok(DriftDetection {
                    drifted: false,
                    time: Utc::now(),
                    result: None,
                }),
                (Some(EXIT_DRIFTED), None) => Ok(DriftDetection {
                    drifted: true,
                    time: Utc::now(),
                    result: result.log.as_deref().map(|l| log_tail(l, 200)),
                }),
                _ => Err(result.failure_message()),
            };

            if let Err(e) = record_detection(store.as_ref(), &resource_id, outcome).await {
                error!(resource_id = %resource_id, error = %e, "Failed to record drift detection");
            }
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                debug!(path = %dir.display(), error = %e, "Failed to remove drift job directory");
            }
        });
    }
}

#[async_trait]
impl Deployer for TerraformDeployer {
    fn deployer_type(&self) -> &str {
        DEPLOYER_TYPE
    }

    async fn apply(&self, resource: &Resource, options: &DeployOptions) -> Result<()> {
        self.execute(resource, JobType::Apply, options).await
    }

    async fn destroy(&self, resource: &Resource, options: &DeployOptions) -> Result<()> {
        self.execute(resource, JobType::Destroy, options).await
    }

    async fn stop(&self, resource: &Resource, options: &DeployOptions) -> Result<()> {
        self.execute(resource, JobType::Stop, options).await
    }

    async fn detect(&self, resource: &Resource) -> Result<()> {
        let latest = self
            .store
            .latest_run(&resource.id, Some(DEPLOYER_TYPE))
            .await?;
        let Some(run) = latest.filter(|r| !r.output.trim().is_empty()) else {
            debug!(resource_id = %resource.id, "No deployed state, nothing can drift");
            let clean = DriftDetection {
                drifted: false,
                time: Utc::now(),
                result: None,
            };
            record_detection(self.store.as_ref(), &resource.id, Ok(clean)).await?;
            return Ok(());
        };

        let job_id = uuid::Uuid::new_v4().to_string();
        let dir = self.config.data_dir.join("drift").join(&job_id);
        let config = self.render(&run).await?;
        write_job_dir(&dir, &config, &run.output).await?;

        let labels = BTreeMap::from([
            (LABEL_RESOURCE_ID.to_string(), resource.id.clone()),
            (LABEL_JOB_TYPE.to_string(), "detect".to_string()),
            (LABEL_DRIFT_DETECTION.to_string(), "true".to_string()),
        ]);
        let handle = self
            .runner
            .launch_detached(&self.job_options(&job_id, &dir, Command::Detect, labels))
            .await?;

        info!(resource_id = %resource.id, job_id = %job_id, "Drift detection launched");
        self.spawn_detect_monitor(resource.id.clone(), handle, dir);
        Ok(())
    }

    async fn active_detections(&self) -> Result<usize> {
        Ok(self
            .runner
            .count_active(&[(LABEL_DRIFT_DETECTION, "true")])
            .await)
    }
}

/// Poll a job until it finishes or exceeds `timeout`, then collect it.
async fn wait_for_job(
    runner: &dyn JobRunner,
    handle: &JobHandle,
    timeout: Duration,
    poll: Duration,
) -> JobResult {
    let started = tokio::time::Instant::now();
    loop {
        if !runner.is_running(handle).await {
            return runner.collect_result(handle).await;
        }
        if started.elapsed() >= timeout {
            warn!(
                job_id = %handle.job_id,
                timeout_secs = timeout.as_secs(),
                "Job exceeded timeout, stopping"
            );
            if let Err(e) = runner.stop(handle).await {
                warn!(job_id = %handle.job_id, error = %e, "Failed to stop timed out job");
            }
            let mut result = runner.collect_result(handle).await;
            result.error = Some("job timed out".to_string());
            return result;
        }
        tokio::time::sleep(poll).await;
    }
}

async fn record_detection(
    store: &dyn Store,
    resource_id: &str,
    outcome: std::result::Result<DriftDetection, String>,
) -> std::result::Result<(), CoreError> {
    let Some(mut resource) = store.get_resource(resource_id).await? else {
        return Ok(());
    };
    match outcome {
        Ok(detection) => {
            info!(resource_id = %resource_id, drifted = detection.drifted, "Drift detection finished");
            rs::set(&mut resource.status, ConditionType::Detected, ConditionStatus::True, "");
            resource.drift_detection = Some(detection);
        }
        Err(message) => {
            warn!(resource_id = %resource_id, error = %message, "Drift detection failed");
            rs::set(&mut resource.status, ConditionType::Detected, ConditionStatus::False, message);
        }
    }
    store.update_resource(&resource).await
}

async fn write_job_dir(dir: &Path, config: &Value, state: &str) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(dir.join(CONFIG_FILE), serde_json::to_vec_pretty(config)?).await?;
    if !state.trim().is_empty() {
        tokio::fs::write(dir.join(STATE_FILE), state).await?;
    }
    Ok(())
}

async fn read_state(dir: &Path) -> Option<String> {
    tokio::fs::read_to_string(dir.join(STATE_FILE))
        .await
        .ok()
        .filter(|s| !s.trim().is_empty())
}

fn required_providers_block(providers: &[ProviderRequirement]) -> Value {
    let block: Map<String, Value> = providers
        .iter()
        .map(|p| {
            let mut entry = Map::new();
            if let Some(source) = &p.source {
                entry.insert("source".to_string(), Value::String(source.clone()));
            }
            if let Some(version) = &p.version {
                entry.insert("version".to_string(), Value::String(version.clone()));
            }
            (p.name.clone(), Value::Object(entry))
        })
        .collect();
    Value::Object(block)
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
