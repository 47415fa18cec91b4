// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain model: resources, runs, relationships.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graph;
use crate::status::{self, ConditionStatus, Status};

/// Attribute map of a resource or run. Values may contain interpolation
/// references such as `${res.db.endpoint}`.
pub type Attributes = serde_json::Map<String, Value>;

/// Deployer type used when a resource does not name one.
pub const DEFAULT_DEPLOYER_TYPE: &str = "terraform";

/// Kind of job a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    /// Create or update the infrastructure.
    Apply,
    /// Tear the infrastructure down and forget the resource.
    Destroy,
    /// Tear the infrastructure down but keep the resource for a later start.
    Stop,
}

impl JobType {
    /// Canonical string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
            Self::Stop => "stop",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "apply" => Ok(Self::Apply),
            "destroy" => Ok(Self::Destroy),
            "stop" => Ok(Self::Stop),
            other => Err(format!("unknown job type '{}'", other)),
        }
    }
}

/// A provider a template needs, e.g. `aws` from `hashicorp/aws`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRequirement {
    /// Local provider name.
    pub name: String,
    /// Registry source address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Version constraint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// A versioned template a resource is rendered from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateRef {
    /// Template identifier.
    pub id: String,
    /// Template name.
    pub name: String,
    /// Template version.
    pub version: String,
    /// Module source address handed to the backend.
    pub source: String,
    /// Providers the template version declares.
    #[serde(default)]
    pub required_providers: Vec<ProviderRequirement>,
    /// Output names the module exposes.
    #[serde(default)]
    pub outputs: Vec<String>,
}

/// Resource definition matching rule: a template plus base attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchingRule {
    /// Rule name.
    pub name: String,
    /// Template the rule resolves to.
    pub template: TemplateRef,
    /// Base attributes, overridden per key by the resource's own.
    #[serde(default)]
    pub attributes: Attributes,
}

/// Where a resource's configuration comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceSource {
    /// Bound to a template directly.
    Template(TemplateRef),
    /// Bound through a resource definition rule.
    Definition(MatchingRule),
}

impl ResourceSource {
    /// The template ultimately used.
    pub fn template(&self) -> &TemplateRef {
        match self {
            Self::Template(t) => t,
            Self::Definition(rule) => &rule.template,
        }
    }
}

/// Result of the most recent drift check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftDetection {
    /// Whether actual state diverges from the recorded state.
    pub drifted: bool,
    /// When the check finished.
    pub time: DateTime<Utc>,
    /// Backend report; cleared when nothing drifted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// A managed infrastructure object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Unique identifier.
    pub id: String,
    /// Environment the resource lives in; dependency names resolve here.
    pub environment_id: String,
    /// Name, unique within the environment.
    pub name: String,
    /// Deployer registry key.
    pub deployer_type: String,
    /// Connector whose operator reports the resource's health.
    pub connector_id: Option<String>,
    /// Subject recorded when the resource was created.
    pub subject: Option<String>,
    /// Raw attributes.
    pub attributes: Attributes,
    /// Attributes computed by the backend.
    pub computed_attributes: Attributes,
    /// Free-form labels.
    pub labels: BTreeMap<String, String>,
    /// Template or definition rule.
    pub source: Option<ResourceSource>,
    /// Condition-based status.
    pub status: Status,
    /// Last drift check.
    pub drift_detection: Option<DriftDetection>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    /// Names of the resources this one references through interpolation.
    pub fn dependency_names(&self) -> BTreeSet<String> {
        graph::parse_dependency_names(&self.attributes)
    }

    /// Template the resource renders from, if bound.
    pub fn template(&self) -> Option<&TemplateRef> {
        self.source.as_ref().map(ResourceSource::template)
    }

    /// Whether the last drift check is missing or older than `ttl`.
    pub fn drift_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        match &self.drift_detection {
            None => true,
            Some(d) => now - d.time >= ttl,
        }
    }
}

/// Input for creating a resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NewResource {
    /// Name, unique within the environment.
    pub name: String,
    /// Raw attributes.
    #[serde(default)]
    pub attributes: Attributes,
    /// Free-form labels.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Template or definition rule.
    #[serde(default)]
    pub source: Option<ResourceSource>,
    /// Deployer registry key, defaults to [`DEFAULT_DEPLOYER_TYPE`].
    #[serde(default)]
    pub deployer_type: Option<String>,
    /// Connector for status sync.
    #[serde(default)]
    pub connector_id: Option<String>,
    /// Subject creating the resource.
    #[serde(default)]
    pub subject: Option<String>,
}

impl NewResource {
    /// Materialize a resource in the environment with a fresh id, pending apply.
    pub fn into_resource(self, environment_id: &str) -> Resource {
        let now = Utc::now();
        let mut st = Status::default();
        status::resource::request_apply(&mut st);
        Resource {
            id: uuid::Uuid::new_v4().to_string(),
            environment_id: environment_id.to_string(),
            name: self.name,
            deployer_type: self
                .deployer_type
                .unwrap_or_else(|| DEFAULT_DEPLOYER_TYPE.to_string()),
            connector_id: self.connector_id,
            subject: self.subject,
            attributes: self.attributes,
            computed_attributes: Attributes::new(),
            labels: self.labels,
            source: self.source,
            status: st,
            drift_detection: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One execution attempt against a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Unique identifier.
    pub id: String,
    /// Owning resource.
    pub resource_id: String,
    /// Environment of the owning resource.
    pub environment_id: String,
    /// Deployer that executes the run.
    pub deployer_type: String,
    /// Job kind.
    pub job_type: JobType,
    /// Run status (`Completed` condition).
    pub status: Status,
    /// Template snapshot the run deploys.
    pub template: Option<TemplateRef>,
    /// Attributes the run deploys.
    pub attributes: Attributes,
    /// Computed attributes the run deploys.
    pub computed_attributes: Attributes,
    /// Backend state blob, inherited from the previous run.
    pub output: String,
    /// Providers carried over from the previous state.
    pub previous_required_providers: Vec<ProviderRequirement>,
    /// Free-form change comment.
    pub change_comment: Option<String>,
    /// Subject that triggered the run.
    pub created_by: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When the run reached True or False.
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    /// Unknown while running, True on success, False on failure.
    pub fn state(&self) -> ConditionStatus {
        status::run::state(&self.status)
    }

    /// Whether the run is still in flight.
    pub fn is_running(&self) -> bool {
        self.state() == ConditionStatus::Unknown
    }
}

/// Relationship edge kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipKind {
    /// Derived from attribute interpolation.
    Implicit,
    /// Declared by the user.
    Explicit,
}

impl RelationshipKind {
    /// Canonical string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Implicit => "implicit",
            Self::Explicit => "explicit",
        }
    }
}

impl FromStr for RelationshipKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "implicit" => Ok(Self::Implicit),
            "explicit" => Ok(Self::Explicit),
            other => Err(format!("unknown relationship kind '{}'", other)),
        }
    }
}

/// A dependency edge, `resource_id` depends on `dependency_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    /// Dependant side.
    pub resource_id: String,
    /// Dependency side; equal to `resource_id` for the self edge.
    pub dependency_id: String,
    /// Resource ids traversed from the root dependency to `resource_id`.
    pub path: Vec<String>,
    /// Edge kind.
    pub kind: RelationshipKind,
}

impl Relationship {
    /// Whether the recorded path visits a resource twice.
    pub fn has_cycle(&self) -> bool {
        let mut seen = BTreeSet::new();
        self.path.iter().any(|id| !seen.insert(id))
    }

    /// Path rendered as `a -> b -> c`.
    pub fn path_string(&self) -> String {
        self.path.join(" -> ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_source_serialization_is_tagged() {
        let src = ResourceSource::Template(TemplateRef {
            id: "t1".into(),
            name: "vpc".into(),
            version: "1.0.0".into(),
            source: "github.com/org/vpc".into(),
            required_providers: vec![],
            outputs: vec!["vpc_id".into()],
        });
        let v = serde_json::to_value(&src).unwrap();
        assert_eq!(v["kind"], "template");
        assert_eq!(v["name"], "vpc");

        let back: ResourceSource = serde_json::from_value(v).unwrap();
        assert_eq!(back, src);
    }

    #[test]
    fn test_new_resource_is_pending_apply() {
        let res = NewResource {
            name: "db".into(),
            ..Default::default()
        }
        .into_resource("env-1");

        assert_eq!(res.deployer_type, DEFAULT_DEPLOYER_TYPE);
        assert_eq!(res.status.summary.summary, "Progressing");
        assert!(res.status.summary.transitioning);
        assert!(res.drift_expired(Utc::now(), Duration::hours(1)));
    }

    #[test]
    fn test_dependency_names() {
        let mut res = NewResource {
            name: "app".into(),
            ..Default::default()
        }
        .into_resource("env-1");
        res.attributes.insert("db".into(), json!("${res.db.endpoint}"));

        assert_eq!(
            res.dependency_names().into_iter().collect::<Vec<_>>(),
            vec!["db".to_string()]
        );
    }

    #[test]
    fn test_relationship_cycle_detection() {
        let ok = Relationship {
            resource_id: "c".into(),
            dependency_id: "a".into(),
            path: vec!["a".into(), "b".into(), "c".into()],
            kind: RelationshipKind::Implicit,
        };
        assert!(!ok.has_cycle());

        let looped = Relationship {
            path: vec!["a".into(), "b".into(), "a".into()],
            ..ok
        };
        assert!(looped.has_cycle());
        assert_eq!(looped.path_string(), "a -> b -> a");
    }

    #[test]
    fn test_drift_ttl() {
        let mut res = NewResource {
            name: "x".into(),
            ..Default::default()
        }
        .into_resource("env");
        let now = Utc::now();
        res.drift_detection = Some(DriftDetection {
            drifted: false,
            time: now - Duration::minutes(30),
            result: None,
        });
        assert!(!res.drift_expired(now, Duration::hours(1)));
        assert!(res.drift_expired(now + Duration::minutes(31), Duration::hours(1)));
    }

    #[test]
    fn test_job_type_parse() {
        assert_eq!("destroy".parse::<JobType>().unwrap(), JobType::Destroy);
        assert!("rollback".parse::<JobType>().is_err());
    }
}
