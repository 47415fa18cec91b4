// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run status: a single `Completed` condition.

use std::sync::LazyLock;

use super::walker::{Displays, Walker};
use super::{ConditionStatus, ConditionType, Status};

static WALKER: LazyLock<Walker> = LazyLock::new(|| {
    Walker::new(&[&[ConditionType::Completed]]).with_displays(
        ConditionType::Completed,
        Displays::new("Running", "Failed", "Succeeded"),
    )
});

/// Build the status of a run in the given state.
pub fn new(state: ConditionStatus, message: impl Into<String>) -> Status {
    let mut status = Status::default();
    set(&mut status, state, message);
    status
}

/// Set the run state and recompute the summary.
pub fn set(status: &mut Status, state: ConditionStatus, message: impl Into<String>) -> bool {
    let changed = status.set(ConditionType::Completed, state, message);
    status.summary = WALKER.walk(status);
    changed
}

/// Current run state; a run without a condition is treated as running.
pub fn state(status: &Status) -> ConditionStatus {
    status
        .condition_status(ConditionType::Completed)
        .unwrap_or(ConditionStatus::Unknown)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_summaries() {
        let running = new(ConditionStatus::Unknown, "");
        assert_eq!(running.summary.summary, "Running");
        assert!(running.summary.transitioning);

        let failed = new(ConditionStatus::False, "exit 1");
        assert_eq!(failed.summary.summary, "Failed");
        assert_eq!(failed.summary.message, "exit 1");
        assert!(failed.summary.error);

        let ok = new(ConditionStatus::True, "");
        assert_eq!(ok.summary.summary, "Succeeded");
        assert_eq!(state(&ok), ConditionStatus::True);
    }

    #[test]
    fn test_state_defaults_to_unknown() {
        assert_eq!(state(&Status::default()), ConditionStatus::Unknown);
    }
}
