// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Summary walker.
//!
//! A walker holds one or more ordered *paths* of condition steps. Walking a
//! path visits its steps in order:
//!
//! | Condition | Result |
//! |-----------|--------|
//! | absent    | skip to next step |
//! | `Unknown` | transitioning, stop |
//! | `False`   | error, stop |
//! | `True`    | done, continue |
//!
//! Every path that contains at least one present condition yields a
//! candidate summary. The candidate with the highest score wins
//! (error > transitioning > done); on a tie the earlier path wins, which is
//! how path order encodes priority. With no candidate the summary falls back
//! to the done display of the first path's last step.

use super::{ConditionStatus, ConditionType, Status, Summary};

/// Display strings of one step: transitioning, error, done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Displays {
    /// Shown while the condition is Unknown.
    pub transitioning: &'static str,
    /// Shown when the condition is False.
    pub error: &'static str,
    /// Shown when the condition is True.
    pub done: &'static str,
}

impl Displays {
    /// Build a display triple.
    pub const fn new(transitioning: &'static str, error: &'static str, done: &'static str) -> Self {
        Self {
            transitioning,
            error,
            done,
        }
    }

    /// Default displays for a condition type.
    pub fn general(kind: ConditionType) -> Self {
        match kind {
            ConditionType::Progressing => Self::new("Progressing", "Progressing", "Progressed"),
            ConditionType::Deployed => Self::new("Deploying", "DeployFailed", "Deployed"),
            ConditionType::Ready => Self::new("Preparing", "Unready", "Ready"),
            other => {
                let s = other.as_str();
                Self::new(s, s, s)
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Step {
    kind: ConditionType,
    displays: Displays,
}

const SCORE_DONE: u8 = 0;
const SCORE_TRANSITIONING: u8 = 1;
const SCORE_ERROR: u8 = 2;

fn score(s: &Summary) -> u8 {
    if s.error {
        SCORE_ERROR
    } else if s.transitioning {
        SCORE_TRANSITIONING
    } else {
        SCORE_DONE
    }
}

/// Stacked step paths producing a [`Summary`] from a [`Status`].
#[derive(Debug, Clone)]
pub struct Walker {
    paths: Vec<Vec<Step>>,
}

impl Walker {
    /// Create a walker from ordered paths of condition types, using the
    /// general displays for every step.
    pub fn new(paths: &[&[ConditionType]]) -> Self {
        debug_assert!(!paths.is_empty(), "empty steps group");
        let paths = paths
            .iter()
            .map(|steps| {
                debug_assert!(!steps.is_empty(), "empty steps");
                steps
                    .iter()
                    .map(|&kind| Step {
                        kind,
                        displays: Displays::general(kind),
                    })
                    .collect()
            })
            .collect();
        Self { paths }
    }

    /// Override the displays of every step of the given kind.
    pub fn with_displays(mut self, kind: ConditionType, displays: Displays) -> Self {
        for step in self.paths.iter_mut().flatten() {
            if step.kind == kind {
                step.displays = displays;
            }
        }
        self
    }

    /// Walk the conditions and produce a summary.
    pub fn walk(&self, status: &Status) -> Summary {
        let mut best: Option<Summary> = None;

        for path in &self.paths {
            let Some(candidate) = walk_path(path, status) else {
                continue;
            };
            let better = match &best {
                None => true,
                Some(b) => score(&candidate) > score(b),
            };
            if better {
                let top = score(&candidate) == SCORE_ERROR;
                best = Some(candidate);
                if top {
                    break;
                }
            }
        }

        best.unwrap_or_else(|| {
            let last = self
                .paths
                .first()
                .and_then(|p| p.last())
                .map(|s| s.displays.done)
                .unwrap_or_default();
            Summary {
                summary: last.to_string(),
                ..Summary::default()
            }
        })
    }
}

fn walk_path(path: &[Step], status: &Status) -> Option<Summary> {
    let mut result = None;

    for step in path {
        let Some(c) = status.condition(step.kind) else {
            continue;
        };
        let (display, error, transitioning) = match c.status {
            ConditionStatus::Unknown => (step.displays.transitioning, false, true),
            ConditionStatus::False => (step.displays.error, true, false),
            ConditionStatus::True => (step.displays.done, false, false),
        };
        result = Some(Summary {
            summary: display.to_string(),
            message: c.message.clone(),
            transitioning,
            error,
        });
        if error || transitioning {
            break;
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walker() -> Walker {
        Walker::new(&[
            &[ConditionType::Deleted],
            &[
                ConditionType::Progressing,
                ConditionType::Deployed,
                ConditionType::Ready,
            ],
        ])
        .with_displays(
            ConditionType::Deleted,
            Displays::new("Deleting", "DeleteFailed", "Deleted"),
        )
    }

    #[test]
    fn test_empty_status_uses_first_path_last_step() {
        let s = walker().walk(&Status::default());
        assert_eq!(s.summary, "Deleted");
        assert!(!s.transitioning);
        assert!(!s.error);
    }

    #[test]
    fn test_true_moves_to_next_step() {
        let mut st = Status::default();
        st.set(ConditionType::Progressing, ConditionStatus::True, "");
        st.set(ConditionType::Deployed, ConditionStatus::Unknown, "applying");

        let s = walker().walk(&st);
        assert_eq!(s.summary, "Deploying");
        assert_eq!(s.message, "applying");
        assert!(s.transitioning);
    }

    #[test]
    fn test_false_is_error() {
        let mut st = Status::default();
        st.set(ConditionType::Deployed, ConditionStatus::False, "boom");

        let s = walker().walk(&st);
        assert_eq!(s.summary, "DeployFailed");
        assert!(s.error);
        assert!(!s.transitioning);
    }

    #[test]
    fn test_error_beats_transitioning_on_another_path() {
        let mut st = Status::default();
        st.set(ConditionType::Deleted, ConditionStatus::Unknown, "");
        st.set(ConditionType::Ready, ConditionStatus::False, "unhealthy");

        let s = walker().walk(&st);
        assert_eq!(s.summary, "Unready");
        assert!(s.error);
    }

    #[test]
    fn test_tie_keeps_earlier_path() {
        let mut st = Status::default();
        st.set(ConditionType::Deleted, ConditionStatus::Unknown, "");
        st.set(ConditionType::Progressing, ConditionStatus::Unknown, "");

        assert_eq!(walker().walk(&st).summary, "Deleting");
    }

    #[test]
    fn test_all_done_reports_last_present_step() {
        let mut st = Status::default();
        st.set(ConditionType::Deployed, ConditionStatus::True, "");

        let s = walker().walk(&st);
        assert_eq!(s.summary, "Deployed");
        assert!(!s.transitioning);
    }
}
