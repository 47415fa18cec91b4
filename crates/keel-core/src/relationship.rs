// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Relationship row derivation.
//!
//! Every resource stores one row per path that reaches it:
//!
//! ```text
//!   self row:        (R, R, [R])
//!   per dependency:  (R, S, d.path + [R])   for every stored row d of S
//! ```
//!
//! so a row's `path` always starts at a root dependency and ends at the
//! resource itself. Walking the path for a repeated id is how cycles that
//! slipped past the batch sort are found later at runtime.

use std::collections::{BTreeSet, HashMap};

use crate::models::{Relationship, RelationshipKind};

/// Derive the relationship rows of `resource_id` from the stored rows of its
/// direct dependencies.
///
/// `dependency_rows` must hold every row whose `resource_id` is one of the
/// direct dependencies (self rows included). Returns the offending row when a
/// derived path visits a resource twice.
pub fn derive(
    resource_id: &str,
    dependency_rows: &[Relationship],
) -> Result<Vec<Relationship>, Relationship> {
    let mut rows = vec![Relationship {
        resource_id: resource_id.to_string(),
        dependency_id: resource_id.to_string(),
        path: vec![resource_id.to_string()],
        kind: RelationshipKind::Implicit,
    }];

    for d in dependency_rows {
        if d.resource_id == resource_id {
            continue;
        }
        let mut path = d.path.clone();
        path.push(resource_id.to_string());
        let row = Relationship {
            resource_id: resource_id.to_string(),
            dependency_id: d.resource_id.clone(),
            path,
            kind: d.kind,
        };
        if row.has_cycle() {
            return Err(row);
        }
        if !rows.contains(&row) {
            rows.push(row);
        }
    }

    Ok(rows)
}

/// Direct dependency ids of a resource: the distinct `dependency_id`s of its
/// non-self rows.
pub fn dependency_ids(rows: &[Relationship]) -> BTreeSet<String> {
    rows.iter()
        .filter(|r| r.resource_id != r.dependency_id)
        .map(|r| r.dependency_id.clone())
        .collect()
}

/// Map a path of ids to names where known.
pub fn name_path(path: &[String], names: &HashMap<String, String>) -> Vec<String> {
    path.iter()
        .map(|id| names.get(id).cloned().unwrap_or_else(|| id.clone()))
        .collect()
}
