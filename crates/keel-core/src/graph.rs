// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dependency graph built from attribute interpolation.
//!
//! Attributes reference other resources with `${res.<name>.<field>}` (the
//! legacy `${svc.<name>.<field>}` form is accepted too), anywhere inside
//! nested objects and arrays. Every reference from R to S is an edge
//! "R depends on S".
//!
//! The graph is an arena: nodes live in a `Vec` in input order and edges are
//! indices into it. Sorting is Kahn's algorithm with a FIFO queue, seeded and
//! fed in input order, which makes the output a pure function of the input
//! order:
//!
//! ```text
//! input  1  2→1  3→1,7  4→2  5→6,7  6  7→6  8→2,4  9→3,5  10→8,9
//! sorted 1, 6, 2, 7, 4, 3, 5, 8, 9, 10
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::models::Attributes;

static INTERPOLATION: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\$\{(svc|res)\.([^.\s]+)\.([^}]+)\}").ok());

/// A single `${res.<resource>.<field>}` occurrence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// The full matched text, e.g. `${res.db.endpoint}`.
    pub raw: String,
    /// Referenced resource name.
    pub resource: String,
    /// Referenced output/field.
    pub field: String,
}

/// All references in a string, in order of appearance.
pub fn references_in(s: &str) -> Vec<Reference> {
    let Some(re) = INTERPOLATION.as_ref() else {
        return Vec::new();
    };
    re.captures_iter(s)
        .map(|c| Reference {
            raw: c[0].to_string(),
            resource: c[2].to_string(),
            field: c[3].to_string(),
        })
        .collect()
}

fn collect_references(value: &Value, out: &mut Vec<Reference>) {
    match value {
        Value::String(s) => out.extend(references_in(s)),
        Value::Array(items) => items.iter().for_each(|v| collect_references(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_references(v, out)),
        _ => {}
    }
}

/// Every reference found in the attributes, walking nested values.
pub fn references(attributes: &Attributes) -> Vec<Reference> {
    let mut out = Vec::new();
    attributes
        .values()
        .for_each(|v| collect_references(v, &mut out));
    out
}

/// Sorted, de-duplicated names of the resources the attributes reference.
pub fn parse_dependency_names(attributes: &Attributes) -> BTreeSet<String> {
    references(attributes)
        .into_iter()
        .map(|r| r.resource)
        .collect()
}

/// Replace references with values from `lookup(resource, field)`.
///
/// A string that consists of exactly one reference takes the looked-up value
/// as-is (keeping its JSON type); references embedded in longer strings are
/// replaced by the value's text. Unresolvable references are returned as the
/// error, by their raw text.
pub fn resolve_references<F>(value: &Value, lookup: &F) -> Result<Value, Vec<String>>
where
    F: Fn(&str, &str) -> Option<Value>,
{
    let mut missing = Vec::new();
    let resolved = resolve_value(value, lookup, &mut missing);
    if missing.is_empty() {
        Ok(resolved)
    } else {
        Err(missing)
    }
}

fn resolve_value<F>(value: &Value, lookup: &F, missing: &mut Vec<String>) -> Value
where
    F: Fn(&str, &str) -> Option<Value>,
{
    match value {
        Value::String(s) => {
            let refs = references_in(s);
            if refs.is_empty() {
                return value.clone();
            }
            if refs.len() == 1 && refs[0].raw == *s {
                return match lookup(&refs[0].resource, &refs[0].field) {
                    Some(v) => v,
                    None => {
                        missing.push(refs[0].raw.clone());
                        value.clone()
                    }
                };
            }
            let mut out = s.clone();
            for r in refs {
                match lookup(&r.resource, &r.field) {
                    Some(Value::String(text)) => out = out.replace(&r.raw, &text),
                    Some(other) => out = out.replace(&r.raw, &other.to_string()),
                    None => missing.push(r.raw),
                }
            }
            Value::String(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| resolve_value(v, lookup, missing))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, lookup, missing)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// A dependency cycle, reported as a path of resource names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError {
    path: Vec<String>,
}

impl CycleError {
    /// Create a cycle error; the path starts and ends on the same name.
    pub fn new(path: Vec<String>) -> Self {
        Self { path }
    }

    /// Names along the cycle.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Path rendered as `a -> b -> a`.
    pub fn path_string(&self) -> String {
        self.path.join(" -> ")
    }
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dependency cycle detected: {}", self.path_string())
    }
}

impl std::error::Error for CycleError {}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    /// Indices of the nodes this one depends on, ascending.
    dependencies: Vec<usize>,
    /// Indices of the nodes depending on this one, ascending.
    dependants: Vec<usize>,
}

/// Arena-backed dependency graph over one batch of resources.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
}

impl DependencyGraph {
    /// Build from `(name, dependency names)` pairs in batch order.
    ///
    /// Dependency names outside the batch are ignored; they already exist in
    /// the environment and cannot affect the order of this batch.
    pub fn new<I, N, D>(items: I) -> Self
    where
        I: IntoIterator<Item = (N, D)>,
        N: Into<String>,
        D: IntoIterator,
        D::Item: AsRef<str>,
    {
        let raw: Vec<(String, Vec<String>)> = items
            .into_iter()
            .map(|(n, deps)| {
                (
                    n.into(),
                    deps.into_iter().map(|d| d.as_ref().to_string()).collect(),
                )
            })
            .collect();

        let mut graph = DependencyGraph::default();
        for (name, _) in &raw {
            let idx = graph.nodes.len();
            graph.index.entry(name.clone()).or_insert(idx);
            graph.nodes.push(Node {
                name: name.clone(),
                dependencies: Vec::new(),
                dependants: Vec::new(),
            });
        }

        for (idx, (_, deps)) in raw.iter().enumerate() {
            let mut resolved: Vec<usize> = deps
                .iter()
                .filter_map(|d| graph.index.get(d.as_str()).copied())
                .collect();
            resolved.sort_unstable();
            resolved.dedup();
            for &dep in &resolved {
                graph.nodes[dep].dependants.push(idx);
            }
            graph.nodes[idx].dependencies = resolved;
        }

        graph
    }

    /// Build from resource names and their attributes.
    pub fn from_attributes<'a, I>(items: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a Attributes)>,
    {
        Self::new(
            items
                .into_iter()
                .map(|(name, attrs)| (name, parse_dependency_names(attrs))),
        )
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Names of the in-batch dependencies of `name`, in batch order.
    pub fn dependencies_of(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&i| {
                self.nodes[i]
                    .dependencies
                    .iter()
                    .map(|&d| self.nodes[d].name.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Topological order as node indices (dependencies first).
    pub fn sort_indices(&self) -> Result<Vec<usize>, CycleError> {
        let mut in_degree: Vec<usize> = self.nodes.iter().map(|n| n.dependencies.len()).collect();
        let mut queue: std::collections::VecDeque<usize> =
            (0..self.nodes.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(i) = queue.pop_front() {
            order.push(i);
            for &d in &self.nodes[i].dependants {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    queue.push_back(d);
                }
            }
        }

        if order.len() == self.nodes.len() {
            return Ok(order);
        }

        let remaining: Vec<bool> = in_degree.iter().map(|&d| d > 0).collect();
        Err(self.cycle_from(&remaining))
    }

    /// Topological order as names (dependencies first).
    pub fn sort(&self) -> Result<Vec<&str>, CycleError> {
        Ok(self
            .sort_indices()?
            .into_iter()
            .map(|i| self.nodes[i].name.as_str())
            .collect())
    }

    /// Walk dependency edges among the stuck nodes until one repeats, then
    /// report the loop in dependant order.
    fn cycle_from(&self, remaining: &[bool]) -> CycleError {
        let Some(start) = (0..self.nodes.len()).rev().find(|&i| remaining[i]) else {
            return CycleError::new(Vec::new());
        };

        let mut visited: Vec<usize> = Vec::new();
        let mut position: HashMap<usize, usize> = HashMap::new();
        let mut current = start;
        let first = loop {
            if let Some(&pos) = position.get(&current) {
                break pos;
            }
            position.insert(current, visited.len());
            visited.push(current);
            match self.nodes[current]
                .dependencies
                .iter()
                .copied()
                .find(|&d| remaining[d])
            {
                Some(next) => current = next,
                None => break 0,
            }
        };

        // visited[first..] follows dependency edges; reverse it so each arrow
        // points from a dependency to its dependant.
        let cycle = &visited[first..];
        let mut path = Vec::with_capacity(cycle.len() + 1);
        path.push(self.nodes[cycle[0]].name.clone());
        for &i in cycle[1..].iter().rev() {
            path.push(self.nodes[i].name.clone());
        }
        path.push(self.nodes[cycle[0]].name.clone());
        CycleError::new(path)
    }
}
