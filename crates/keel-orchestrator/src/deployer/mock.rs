// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock deployer for testing.
//!
//! Records every call instead of running jobs. Failures and the number of
//! active drift checks are set by the test.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use keel_core::error::CoreError;
use keel_core::models::Resource;
use tokio::sync::Mutex;

use super::{DeployOptions, Deployer, DeployerError, Result};

/// One recorded deployer call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    /// `apply`, `destroy`, `stop` or `detect`.
    pub operation: &'static str,
    /// Resource name.
    pub resource: String,
}

/// Mock deployer for testing.
pub struct MockDeployer {
    deployer_type: String,
    calls: Mutex<Vec<MockCall>>,
    fail: AtomicBool,
    busy: AtomicBool,
    active: AtomicUsize,
}

impl MockDeployer {
    /// Mock registered under `deployer_type`.
    pub fn new(deployer_type: &str) -> Self {
        Self {
            deployer_type: deployer_type.to_string(),
            calls: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            active: AtomicUsize::new(0),
        }
    }

    /// Make every following call fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Reject every following call as if another run were in flight.
    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }

    /// Number reported by `active_detections`.
    pub fn set_active_detections(&self, active: usize) {
        self.active.store(active, Ordering::SeqCst);
    }

    /// Calls so far, in order.
    pub async fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().await.clone()
    }

    /// Names of the resources a given operation was called for.
    pub async fn resources_for(&self, operation: &str) -> Vec<String> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.operation == operation)
            .map(|c| c.resource.clone())
            .collect()
    }

    async fn record(&self, operation: &'static str, resource: &Resource) -> Result<()> {
        self.calls.lock().await.push(MockCall {
            operation,
            resource: resource.name.clone(),
        });
        if self.busy.load(Ordering::SeqCst) {
            return Err(CoreError::DeploymentRunning.into());
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(DeployerError::Other(format!("Mock {} failure", operation)));
        }
        Ok(())
    }
}

#[async_trait]
impl Deployer for MockDeployer {
    fn deployer_type(&self) -> &str {
        &self.deployer_type
    }

    async fn apply(&self, resource: &Resource, _options: &DeployOptions) -> Result<()> {
        self.record("apply", resource).await
    }

    async fn destroy(&self, resource: &Resource, _options: &DeployOptions) -> Result<()> {
        self.record("destroy", resource).await
    }

    async fn stop(&self, resource: &Resource, _options: &DeployOptions) -> Result<()> {
        self.record("stop", resource).await
    }

    async fn detect(&self, resource: &Resource) -> Result<()> {
        self.record("detect", resource).await
    }

    async fn active_detections(&self) -> Result<usize> {
        Ok(self.active.load(Ordering::SeqCst))
    }
}
