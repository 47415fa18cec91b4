// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock operators for testing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use keel_core::models::Resource;
use keel_core::status::ConditionStatus;
use tokio::sync::Mutex;

use super::{Operator, OperatorFactory};
use crate::error::{Error, Result};

type Answer = std::result::Result<(ConditionStatus, String), String>;

/// Operator answering from a table keyed by resource name.
///
/// Resources without an entry are reported ready.
pub struct MockOperator {
    answers: Mutex<HashMap<String, Answer>>,
    queried: Mutex<Vec<String>>,
    connected: AtomicBool,
    delay_ms: AtomicUsize,
    current: AtomicUsize,
    max_seen: AtomicUsize,
}

impl Default for MockOperator {
    fn default() -> Self {
        Self::new()
    }
}

impl MockOperator {
    /// Connected operator reporting everything ready.
    pub fn new() -> Self {
        Self {
            answers: Mutex::new(HashMap::new()),
            queried: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            delay_ms: AtomicUsize::new(0),
            current: AtomicUsize::new(0),
            max_seen: AtomicUsize::new(0),
        }
    }

    /// Report `value` with `message` for the named resource.
    pub async fn set_state(&self, name: &str, value: ConditionStatus, message: &str) {
        self.answers
            .lock()
            .await
            .insert(name.to_string(), Ok((value, message.to_string())));
    }

    /// Fail queries for the named resource.
    pub async fn set_error(&self, name: &str, error: &str) {
        self.answers
            .lock()
            .await
            .insert(name.to_string(), Err(error.to_string()));
    }

    /// Toggle `is_connected`.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Hold every query for `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as usize, Ordering::SeqCst);
    }

    /// Names of the resources queried so far.
    pub async fn queried(&self) -> Vec<String> {
        self.queried.lock().await.clone()
    }

    /// Highest number of overlapping queries observed.
    pub fn max_concurrent(&self) -> usize {
        self.max_seen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Operator for MockOperator {
    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn resource_state(&self, resource: &Resource) -> Answer {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);
        self.queried.lock().await.push(resource.name.clone());

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }

        let answer = self
            .answers
            .lock()
            .await
            .get(&resource.name)
            .cloned()
            .unwrap_or_else(|| Ok((ConditionStatus::True, String::new())));
        self.current.fetch_sub(1, Ordering::SeqCst);
        answer
    }
}

/// Factory handing out registered mock operators.
#[derive(Default)]
pub struct MockOperatorFactory {
    operators: HashMap<String, Arc<MockOperator>>,
}

impl MockOperatorFactory {
    /// Factory without operators; every build fails.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operator for a connector id.
    pub fn with(mut self, connector_id: &str, operator: Arc<MockOperator>) -> Self {
        self.operators.insert(connector_id.to_string(), operator);
        self
    }
}

#[async_trait]
impl OperatorFactory for MockOperatorFactory {
    async fn build(&self, connector_id: &str) -> Result<Arc<dyn Operator>> {
        self.operators
            .get(connector_id)
            .map(|op| op.clone() as Arc<dyn Operator>)
            .ok_or_else(|| Error::Other(format!("no operator for connector '{}'", connector_id)))
    }
}
