// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource status transitions.
//!
//! Path priority (earlier wins ties):
//!
//! | Path | Unknown | False | True |
//! |------|---------|-------|------|
//! | `Deleted` | Deleting | DeleteFailed | Deleted |
//! | `Progressing` → `Deployed` → `Ready` | Progressing / Deploying / Preparing | Progressing / DeployFailed / Unready | Progressed / Deployed / Ready |
//! | `Stopped` | Stopping | StopFailed | Stopped |
//!
//! `Detected` is not part of any path, so drift detection never moves the
//! summary.

use std::sync::LazyLock;

use super::walker::{Displays, Walker};
use super::{ConditionStatus, ConditionType, Status};
use crate::models::JobType;

/// Summary shown while a resource waits on its relationships.
pub const SUMMARY_PROGRESSING: &str = "Progressing";
/// Summary of a resource being destroyed.
pub const SUMMARY_DELETING: &str = "Deleting";
/// Summary of a settled, healthy resource.
pub const SUMMARY_READY: &str = "Ready";
/// Summary of a stopped resource.
pub const SUMMARY_STOPPED: &str = "Stopped";
/// Summary of a resource whose operator reports it unhealthy.
pub const SUMMARY_UNREADY: &str = "Unready";
/// Summary of a resource whose operator has not settled yet.
pub const SUMMARY_PREPARING: &str = "Preparing";

static WALKER: LazyLock<Walker> = LazyLock::new(|| {
    Walker::new(&[
        &[ConditionType::Deleted],
        &[
            ConditionType::Progressing,
            ConditionType::Deployed,
            ConditionType::Ready,
        ],
        &[ConditionType::Stopped],
    ])
    .with_displays(
        ConditionType::Deleted,
        Displays::new("Deleting", "DeleteFailed", "Deleted"),
    )
    .with_displays(
        ConditionType::Stopped,
        Displays::new("Stopping", "StopFailed", "Stopped"),
    )
});

/// Recompute the summary from the conditions.
pub fn summarize(status: &mut Status) {
    status.summary = WALKER.walk(status);
}

/// Set a condition and recompute the summary.
pub fn set(
    status: &mut Status,
    kind: ConditionType,
    value: ConditionStatus,
    message: impl Into<String>,
) -> bool {
    let changed = status.set(kind, value, message);
    summarize(status);
    changed
}

/// Settled and healthy.
pub fn is_ready(status: &Status) -> bool {
    status.summary.summary == SUMMARY_READY
        && !status.summary.error
        && !status.summary.transitioning
}

/// Failed and needs attention.
pub fn is_error(status: &Status) -> bool {
    status.summary.error
}

/// Being deleted or deleted.
pub fn is_deleted(status: &Status) -> bool {
    status.exists(ConditionType::Deleted)
}

/// Being stopped or stopped.
pub fn is_stopped(status: &Status) -> bool {
    status.exists(ConditionType::Stopped)
}

/// Deployed or to be deployed: neither failed, fully deleted nor fully stopped.
pub fn is_deployed(status: &Status) -> bool {
    !status.summary.error
        && !status.is_true(ConditionType::Deleted)
        && !status.is_true(ConditionType::Stopped)
}

/// A create, upgrade or start request: wait on dependencies, then apply.
pub fn request_apply(status: &mut Status) {
    status.remove(ConditionType::Stopped);
    status.remove(ConditionType::Deleted);
    status.set(ConditionType::Progressing, ConditionStatus::Unknown, "");
    summarize(status);
}

/// A delete request: wait on dependants, then destroy.
pub fn request_delete(status: &mut Status) {
    status.set(ConditionType::Deleted, ConditionStatus::Unknown, "");
    status.set(ConditionType::Progressing, ConditionStatus::Unknown, "");
    summarize(status);
}

/// A stop request: wait on dependants, then stop.
pub fn request_stop(status: &mut Status) {
    status.set(ConditionType::Stopped, ConditionStatus::Unknown, "");
    status.set(ConditionType::Progressing, ConditionStatus::Unknown, "");
    summarize(status);
}

/// Keep the resource pending with a message naming what it waits for.
///
/// The message lands on `Progressing` and on the operation's own condition
/// so it is visible whichever path decides the summary.
pub fn mark_waiting(status: &mut Status, job_type: JobType, message: &str) {
    status.set(ConditionType::Progressing, ConditionStatus::Unknown, message);
    if let Some(kind) = operation_condition(job_type) {
        status.set(kind, ConditionStatus::Unknown, message);
    }
    summarize(status);
}

/// Block the resource until an operator acts.
pub fn mark_blocked(status: &mut Status, message: &str) {
    status.set(ConditionType::Progressing, ConditionStatus::False, message);
    summarize(status);
}

/// Relationships are satisfied and the job is about to launch.
pub fn mark_launching(status: &mut Status, job_type: JobType) {
    match job_type {
        JobType::Apply => status.reset(ConditionType::Deployed, ""),
        JobType::Destroy | JobType::Stop => {
            let keep = operation_condition(job_type);
            status
                .conditions
                .retain(|c| c.status != ConditionStatus::False || Some(c.kind) == keep);
            status.set(ConditionType::Progressing, ConditionStatus::True, "");
            if let Some(kind) = keep {
                status.set(kind, ConditionStatus::Unknown, "");
            }
        }
    }
    summarize(status);
}

/// What the caller must do after a job outcome has been applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeAction {
    /// Persist the updated status.
    Update,
    /// Remove the resource and its relationships.
    Delete,
}

/// Apply the terminal outcome of a job to the resource status.
///
/// A `Progressing=Unknown` left by a request made while the job ran is kept,
/// so the resource stays pending and the request is picked up next pass.
pub fn apply_outcome(
    status: &mut Status,
    job_type: JobType,
    succeeded: bool,
    message: &str,
) -> OutcomeAction {
    match (job_type, succeeded) {
        (JobType::Apply, true) => {
            // A request made while the job ran is still pending.
            if !status.is_unknown(ConditionType::Progressing) {
                status.remove(ConditionType::Progressing);
            }
            status.set(ConditionType::Deployed, ConditionStatus::True, "");
            status.set(ConditionType::Ready, ConditionStatus::True, "");
        }
        (JobType::Apply, false) => {
            status.set(ConditionType::Deployed, ConditionStatus::False, message);
        }
        (JobType::Destroy, true) => {
            status.set(ConditionType::Deleted, ConditionStatus::True, "");
            summarize(status);
            return OutcomeAction::Delete;
        }
        (JobType::Destroy, false) => {
            status.set(ConditionType::Deleted, ConditionStatus::False, message);
        }
        (JobType::Stop, true) => {
            status.remove(ConditionType::Progressing);
            status.remove(ConditionType::Deployed);
            status.remove(ConditionType::Ready);
            status.set(ConditionType::Stopped, ConditionStatus::True, "");
        }
        (JobType::Stop, false) => {
            status.set(ConditionType::Stopped, ConditionStatus::False, message);
        }
    }
    summarize(status);
    OutcomeAction::Update
}

fn operation_condition(job_type: JobType) -> Option<ConditionType> {
    match job_type {
        JobType::Apply => None,
        JobType::Destroy => Some(ConditionType::Deleted),
        JobType::Stop => Some(ConditionType::Stopped),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready() -> Status {
        let mut st = Status::default();
        request_apply(&mut st);
        mark_launching(&mut st, JobType::Apply);
        apply_outcome(&mut st, JobType::Apply, true, "");
        st
    }

    #[test]
    fn test_create_request_is_progressing() {
        let mut st = Status::default();
        request_apply(&mut st);
        assert_eq!(st.summary.summary, SUMMARY_PROGRESSING);
        assert!(st.summary.transitioning);
        assert!(!st.summary.error);
    }

    #[test]
    fn test_apply_lifecycle() {
        let mut st = Status::default();
        request_apply(&mut st);
        mark_launching(&mut st, JobType::Apply);
        assert_eq!(st.summary.summary, "Deploying");
        assert!(st.summary.transitioning);

        apply_outcome(&mut st, JobType::Apply, true, "");
        assert!(is_ready(&st));
    }

    #[test]
    fn test_apply_failure_is_error_with_message() {
        let mut st = Status::default();
        request_apply(&mut st);
        mark_launching(&mut st, JobType::Apply);
        apply_outcome(&mut st, JobType::Apply, false, "plan failed");

        assert_eq!(st.summary.summary, "DeployFailed");
        assert_eq!(st.summary.message, "plan failed");
        assert!(is_error(&st));
    }

    #[test]
    fn test_same_condition_twice_keeps_summary() {
        let mut st = ready();
        let before = st.summary.clone();
        assert!(!set(&mut st, ConditionType::Ready, ConditionStatus::True, ""));
        assert_eq!(st.summary, before);
        assert!(!st.summary.transitioning);
    }

    #[test]
    fn test_delete_lifecycle() {
        let mut st = ready();
        request_delete(&mut st);
        assert_eq!(st.summary.summary, SUMMARY_DELETING);
        assert!(!st.is_true(ConditionType::Progressing));

        mark_launching(&mut st, JobType::Destroy);
        assert_eq!(st.summary.summary, SUMMARY_DELETING);
        assert!(st.is_true(ConditionType::Progressing));

        assert_eq!(
            apply_outcome(&mut st, JobType::Destroy, true, ""),
            OutcomeAction::Delete
        );
    }

    #[test]
    fn test_delete_failure() {
        let mut st = ready();
        request_delete(&mut st);
        mark_launching(&mut st, JobType::Destroy);
        apply_outcome(&mut st, JobType::Destroy, false, "locked");
        assert_eq!(st.summary.summary, "DeleteFailed");
        assert!(is_error(&st));
    }

    #[test]
    fn test_stop_request_is_progressing_until_launched() {
        let mut st = ready();
        request_stop(&mut st);
        assert_eq!(st.summary.summary, SUMMARY_PROGRESSING);
        assert!(st.is_unknown(ConditionType::Stopped));

        mark_launching(&mut st, JobType::Stop);
        assert_eq!(st.summary.summary, "Stopping");

        apply_outcome(&mut st, JobType::Stop, true, "");
        assert_eq!(st.summary.summary, SUMMARY_STOPPED);
        assert!(is_stopped(&st));
        assert!(!is_deployed(&st));
    }

    #[test]
    fn test_stop_after_failed_deploy_drops_stale_error() {
        let mut st = Status::default();
        request_apply(&mut st);
        mark_launching(&mut st, JobType::Apply);
        apply_outcome(&mut st, JobType::Apply, false, "boom");

        request_stop(&mut st);
        mark_launching(&mut st, JobType::Stop);
        assert_eq!(st.summary.summary, "Stopping");
        assert!(!st.summary.error);
    }

    #[test]
    fn test_start_after_stop() {
        let mut st = ready();
        request_stop(&mut st);
        mark_launching(&mut st, JobType::Stop);
        apply_outcome(&mut st, JobType::Stop, true, "");

        request_apply(&mut st);
        assert_eq!(st.summary.summary, SUMMARY_PROGRESSING);
        assert!(!is_stopped(&st));
    }

    #[test]
    fn test_waiting_message_is_visible_for_delete() {
        let mut st = ready();
        request_delete(&mut st);
        mark_waiting(&mut st, JobType::Destroy, "Waiting for dependants to be deleted: b");
        assert_eq!(st.summary.summary, SUMMARY_DELETING);
        assert_eq!(st.summary.message, "Waiting for dependants to be deleted: b");
        assert!(st.summary.transitioning);
    }

    #[test]
    fn test_request_during_apply_survives_outcome() {
        let mut st = Status::default();
        request_apply(&mut st);
        mark_launching(&mut st, JobType::Apply);

        request_apply(&mut st);
        apply_outcome(&mut st, JobType::Apply, true, "");
        assert_eq!(st.summary.summary, SUMMARY_PROGRESSING);
        assert!(st.summary.transitioning);
        assert!(st.is_true(ConditionType::Deployed));

        let mut st = ready();
        request_apply(&mut st);
        mark_launching(&mut st, JobType::Apply);
        request_delete(&mut st);
        apply_outcome(&mut st, JobType::Apply, false, "boom");
        assert_eq!(st.summary.summary, SUMMARY_DELETING);
        assert!(!is_error(&st));
    }

    #[test]
    fn test_blocked_is_error() {
        let mut st = Status::default();
        request_apply(&mut st);
        mark_blocked(&mut st, "Dependency resource \"a\" is in delete status, please check it");
        assert_eq!(st.summary.summary, SUMMARY_PROGRESSING);
        assert!(st.summary.error);
        assert!(!st.summary.transitioning);
    }

    #[test]
    fn test_detected_does_not_change_summary() {
        let mut st = ready();
        set(&mut st, ConditionType::Detected, ConditionStatus::False, "no quota");
        assert!(is_ready(&st));
    }

    #[test]
    fn test_deleting_dependant_still_counts_as_deployed() {
        let mut st = ready();
        request_delete(&mut st);
        assert!(is_deployed(&st));
        assert!(is_deleted(&st));
    }
}
