// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process run change notifications.
//!
//! Delivery is at-least-once and in subscription order. A failing handler is
//! logged and skipped; it never prevents delivery to the handlers after it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::models::JobType;
use crate::status::ConditionStatus;

/// A run changed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunChangedEvent {
    /// Run that changed.
    pub run_id: String,
    /// Owning resource.
    pub resource_id: String,
    /// Job kind of the run.
    pub job_type: JobType,
    /// New run state.
    pub status: ConditionStatus,
}

/// Receives run change notifications.
#[async_trait]
pub trait RunEventHandler: Send + Sync {
    /// Handle one event.
    async fn handle(&self, event: &RunChangedEvent) -> Result<(), String>;
}

/// Fan-out bus for [`RunChangedEvent`]s.
#[derive(Default, Clone)]
pub struct Bus {
    handlers: Arc<RwLock<Vec<(String, Arc<dyn RunEventHandler>)>>>,
}

impl Bus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a named handler.
    pub async fn subscribe(&self, name: impl Into<String>, handler: Arc<dyn RunEventHandler>) {
        let name = name.into();
        debug!(handler = %name, "Subscribed to run events");
        self.handlers.write().await.push((name, handler));
    }

    /// Deliver an event to every handler.
    pub async fn notify(&self, event: RunChangedEvent) {
        let handlers = self.handlers.read().await.clone();
        for (name, handler) in handlers {
            if let Err(e) = handler.handle(&event).await {
                warn!(
                    handler = %name,
                    run_id = %event.run_id,
                    error = %e,
                    "Run event handler failed"
                );
            }
        }
    }

    /// Number of registered handlers.
    pub async fn len(&self) -> usize {
        self.handlers.read().await.len()
    }

    /// Whether no handler is registered.
    pub async fn is_empty(&self) -> bool {
        self.handlers.read().await.is_empty()
    }
}
