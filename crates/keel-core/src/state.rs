// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reading the opaque backend state blob carried by runs.
//!
//! Only two things are ever pulled out of it: the provider types that own
//! resources in the state, and the root module outputs. Anything that does
//! not parse is treated as empty.

use std::collections::BTreeSet;

use serde::Deserialize;
use serde_json::Value;

use crate::models::{Attributes, ProviderRequirement};

#[derive(Debug, Default, Deserialize)]
struct StateDoc {
    #[serde(default)]
    resources: Vec<StateResource>,
    #[serde(default)]
    outputs: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct StateResource {
    #[serde(default)]
    provider: String,
}

fn parse(state: &str) -> StateDoc {
    if state.trim().is_empty() {
        return StateDoc::default();
    }
    serde_json::from_str(state).unwrap_or_default()
}

/// Provider type names of the resources in a state.
///
/// `provider["registry.terraform.io/hashicorp/aws"]` yields `aws`.
pub fn provider_types(state: &str) -> BTreeSet<String> {
    parse(state)
        .resources
        .iter()
        .filter_map(|r| provider_type(&r.provider))
        .collect()
}

fn provider_type(provider: &str) -> Option<String> {
    let inner = provider
        .strip_prefix("provider[\"")
        .and_then(|s| s.split('"').next())
        .unwrap_or(provider);
    let name = inner.rsplit('/').next()?.trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Root module output values of a state, keyed by output name.
pub fn outputs(state: &str) -> Attributes {
    parse(state)
        .outputs
        .into_iter()
        .map(|(name, output)| {
            let value = match output {
                Value::Object(mut o) => o.remove("value").unwrap_or(Value::Null),
                other => other,
            };
            (name, value)
        })
        .collect()
}

/// Keep the requirements whose name still owns resources in the state.
pub fn required_providers_from_state(
    required: &[ProviderRequirement],
    state: &str,
) -> Vec<ProviderRequirement> {
    let types = provider_types(state);
    required
        .iter()
        .filter(|p| types.contains(&p.name))
        .cloned()
        .collect()
}
