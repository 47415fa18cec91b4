// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed condition/summary status shared by resources and runs.
//!
//! A [`Status`] holds a list of [`Condition`]s plus a [`Summary`] derived from
//! them by a [`walker::Walker`]. Entities never write the summary directly;
//! they set conditions and re-walk, so the summary is always a pure function
//! of the condition list.
//!
//! ```text
//!   set(Deployed, Unknown) ──► conditions ──► Walker::walk ──► Summary
//!                                                              { summary: "Deploying",
//!                                                                transitioning: true,
//!                                                                error: false }
//! ```

pub mod resource;
pub mod run;
pub mod walker;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tri-state value of a single condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    /// Settled.
    True,
    /// Failed or needs attention.
    False,
    /// In progress.
    Unknown,
}

impl ConditionStatus {
    /// Canonical string form stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConditionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "True" => Ok(Self::True),
            "False" => Ok(Self::False),
            "Unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown condition status '{}'", other)),
        }
    }
}

/// Kinds of conditions tracked on resources and runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionType {
    /// Resource is waiting on its relationships before an operation starts.
    Progressing,
    /// Resource's infrastructure has been applied.
    Deployed,
    /// Resource's infrastructure is healthy according to its operator.
    Ready,
    /// Resource is being (or has been) destroyed.
    Deleted,
    /// Resource is being (or has been) stopped.
    Stopped,
    /// Drift detection state of a resource.
    Detected,
    /// Run completion.
    Completed,
}

impl ConditionType {
    /// Name used in serialized condition lists and in summaries.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Progressing => "Progressing",
            Self::Deployed => "Deployed",
            Self::Ready => "Ready",
            Self::Deleted => "Deleted",
            Self::Stopped => "Stopped",
            Self::Detected => "Detected",
            Self::Completed => "Completed",
        }
    }
}

impl fmt::Display for ConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    /// Condition kind.
    #[serde(rename = "type")]
    pub kind: ConditionType,
    /// Current value.
    pub status: ConditionStatus,
    /// Human-readable detail, names blocking resources when relevant.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// When the status or message last changed.
    pub last_update_time: DateTime<Utc>,
}

/// Summary derived from the conditions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    /// Display status, e.g. `Deploying`, `Ready`, `DeleteFailed`.
    pub summary: String,
    /// Message of the condition that decided the summary.
    #[serde(default)]
    pub message: String,
    /// Between states and may still succeed.
    #[serde(default)]
    pub transitioning: bool,
    /// Failed, needs attention.
    #[serde(default)]
    pub error: bool,
}

/// Conditions plus their derived summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Derived summary.
    #[serde(flatten)]
    pub summary: Summary,
    /// Observed conditions in insertion order.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Status {
    /// Look up a condition by kind.
    pub fn condition(&self, kind: ConditionType) -> Option<&Condition> {
        self.conditions.iter().find(|c| c.kind == kind)
    }

    /// Value of a condition, if present.
    pub fn condition_status(&self, kind: ConditionType) -> Option<ConditionStatus> {
        self.condition(kind).map(|c| c.status)
    }

    /// Whether the condition is present at all.
    pub fn exists(&self, kind: ConditionType) -> bool {
        self.condition(kind).is_some()
    }

    /// Whether the condition is present and True.
    pub fn is_true(&self, kind: ConditionType) -> bool {
        self.condition_status(kind) == Some(ConditionStatus::True)
    }

    /// Whether the condition is present and False.
    pub fn is_false(&self, kind: ConditionType) -> bool {
        self.condition_status(kind) == Some(ConditionStatus::False)
    }

    /// Whether the condition is present and Unknown.
    pub fn is_unknown(&self, kind: ConditionType) -> bool {
        self.condition_status(kind) == Some(ConditionStatus::Unknown)
    }

    /// Set a condition. Only a change of status or message touches the
    /// condition (and its timestamp); returns whether anything changed.
    pub fn set(
        &mut self,
        kind: ConditionType,
        status: ConditionStatus,
        message: impl Into<String>,
    ) -> bool {
        let message = message.into();
        match self.conditions.iter_mut().find(|c| c.kind == kind) {
            Some(c) if c.status == status && c.message == message => false,
            Some(c) => {
                c.status = status;
                c.message = message;
                c.last_update_time = Utc::now();
                true
            }
            None => {
                self.conditions.push(Condition {
                    kind,
                    status,
                    message,
                    last_update_time: Utc::now(),
                });
                true
            }
        }
    }

    /// Drop a condition; returns whether it was present.
    pub fn remove(&mut self, kind: ConditionType) -> bool {
        let before = self.conditions.len();
        self.conditions.retain(|c| c.kind != kind);
        before != self.conditions.len()
    }

    /// Clear every condition and start over with a single Unknown one.
    pub fn reset(&mut self, kind: ConditionType, message: impl Into<String>) {
        self.conditions.clear();
        self.set(kind, ConditionStatus::Unknown, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_status_round_trips_through_str() {
        for st in [
            ConditionStatus::True,
            ConditionStatus::False,
            ConditionStatus::Unknown,
        ] {
            assert_eq!(st.as_str().parse::<ConditionStatus>().unwrap(), st);
        }
        assert!("maybe".parse::<ConditionStatus>().is_err());
    }

    #[test]
    fn test_set_is_idempotent() {
        let mut status = Status::default();
        assert!(status.set(ConditionType::Deployed, ConditionStatus::Unknown, ""));
        let stamp = status.conditions[0].last_update_time;

        assert!(!status.set(ConditionType::Deployed, ConditionStatus::Unknown, ""));
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].last_update_time, stamp);
    }

    #[test]
    fn test_set_message_change_counts_as_change() {
        let mut status = Status::default();
        status.set(ConditionType::Progressing, ConditionStatus::Unknown, "a");
        assert!(status.set(ConditionType::Progressing, ConditionStatus::Unknown, "b"));
        assert_eq!(
            status.condition(ConditionType::Progressing).unwrap().message,
            "b"
        );
    }

    #[test]
    fn test_reset_leaves_single_unknown_condition() {
        let mut status = Status::default();
        status.set(ConditionType::Progressing, ConditionStatus::True, "");
        status.set(ConditionType::Ready, ConditionStatus::True, "");

        status.reset(ConditionType::Deployed, "Upgrading");

        assert_eq!(status.conditions.len(), 1);
        assert!(status.is_unknown(ConditionType::Deployed));
        assert!(!status.exists(ConditionType::Ready));
    }

    #[test]
    fn test_remove() {
        let mut status = Status::default();
        status.set(ConditionType::Stopped, ConditionStatus::True, "");
        assert!(status.remove(ConditionType::Stopped));
        assert!(!status.remove(ConditionType::Stopped));
    }

    #[test]
    fn test_serialized_shape() {
        let mut status = Status::default();
        status.set(ConditionType::Ready, ConditionStatus::True, "");
        status.summary.summary = "Ready".into();

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["summary"], "Ready");
        assert_eq!(json["conditions"][0]["type"], "Ready");
        assert_eq!(json["conditions"][0]["status"], "True");
        assert!(json["conditions"][0].get("message").is_none());
    }
}
