// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for keel-orchestrator.
//!
//! [`OrchestratorRuntime`] runs the background workers inside an existing
//! tokio application:
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use keel_core::bus::Bus;
//! use keel_orchestrator::admission::RunAdmissionManager;
//! use keel_orchestrator::deployer::{TerraformConfig, TerraformDeployer};
//! use keel_orchestrator::runner::ProcessJobRunner;
//! use keel_orchestrator::runtime::OrchestratorRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::SqlitePool::connect("sqlite:keel.db").await?;
//!     keel_core::migrations::run_sqlite(&pool).await?;
//!     let store = Arc::new(keel_core::SqliteStore::new(pool));
//!     let bus = Bus::new();
//!     let admission = Arc::new(RunAdmissionManager::new(store.clone(), bus.clone()));
//!     let deployer = TerraformDeployer::new(
//!         store.clone(),
//!         admission,
//!         Arc::new(ProcessJobRunner::new()),
//!         TerraformConfig::default(),
//!     );
//!
//!     let runtime = OrchestratorRuntime::builder()
//!         .store(store)
//!         .bus(bus)
//!         .deployer(Arc::new(deployer))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let vpc = runtime.service().create("prod", new_vpc()).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! The [`Bus`] handed to the builder must be the one the deployers'
//! admission manager notifies, otherwise finished runs do not wake the
//! relationship scheduler early.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use keel_core::bus::Bus;
use keel_core::persistence::Store;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::deployer::{Deployer, DeployerRegistry};
use crate::drift_scheduler::{DriftScheduler, DriftSchedulerConfig};
use crate::relationship_scheduler::{RelationshipScheduler, RelationshipSchedulerConfig};
use crate::service::ResourceService;
use crate::status_sync::{OperatorFactory, StatusSyncer, StatusSyncerConfig};

/// Builder for creating an [`OrchestratorRuntime`].
pub struct OrchestratorRuntimeBuilder {
    store: Option<Arc<dyn Store>>,
    bus: Option<Bus>,
    deployers: DeployerRegistry,
    operator_factory: Option<Arc<dyn OperatorFactory>>,
    relationship: RelationshipSchedulerConfig,
    drift: DriftSchedulerConfig,
    status_sync: StatusSyncerConfig,
}

impl Default for OrchestratorRuntimeBuilder {
    fn default() -> Self {
        Self {
            store: None,
            bus: None,
            deployers: DeployerRegistry::new(),
            operator_factory: None,
            relationship: RelationshipSchedulerConfig::default(),
            drift: DriftSchedulerConfig::default(),
            status_sync: StatusSyncerConfig::default(),
        }
    }
}

impl OrchestratorRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the resource and run store (required).
    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    /// Share a run event bus. A fresh one is created otherwise.
    pub fn bus(mut self, bus: Bus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Register a deployer (at least one is required).
    pub fn deployer(mut self, deployer: Arc<dyn Deployer>) -> Self {
        self.deployers.register(deployer);
        self
    }

    /// Enable status sync through this operator factory.
    pub fn operator_factory(mut self, factory: Arc<dyn OperatorFactory>) -> Self {
        self.operator_factory = Some(factory);
        self
    }

    /// Set the relationship scheduler poll interval.
    pub fn relationship_poll_interval(mut self, interval: Duration) -> Self {
        self.relationship.poll_interval = interval;
        self
    }

    /// Set the drift scheduler poll interval.
    pub fn drift_poll_interval(mut self, interval: Duration) -> Self {
        self.drift.poll_interval = interval;
        self
    }

    /// Turn drift detection on or off.
    pub fn drift_detection_enabled(mut self, enabled: bool) -> Self {
        self.drift.enabled = enabled;
        self
    }

    /// Set how long a drift check result stays fresh.
    pub fn drift_ttl(mut self, ttl: Duration) -> Self {
        self.drift.ttl = ttl;
        self
    }

    /// Set the maximum number of concurrently running drift checks.
    pub fn drift_max_active_jobs(mut self, max: usize) -> Self {
        self.drift.max_active_jobs = max;
        self
    }

    /// Set the status sync poll interval.
    pub fn status_sync_interval(mut self, interval: Duration) -> Self {
        self.status_sync.poll_interval = interval;
        self
    }

    /// Set the status sync worker pool size.
    pub fn worker_pool_size(mut self, size: usize) -> Self {
        self.status_sync.pool_size = size;
        self
    }

    /// Set the number of concurrent calls per connector operator.
    pub fn operator_concurrency(mut self, permits: usize) -> Self {
        self.status_sync.operator_concurrency = permits;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<OrchestratorRuntimeConfig> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        if self.deployers.is_empty() {
            return Err(anyhow::anyhow!("at least one deployer is required"));
        }

        Ok(OrchestratorRuntimeConfig {
            store,
            bus: self.bus.unwrap_or_default(),
            deployers: Arc::new(self.deployers),
            operator_factory: self.operator_factory,
            relationship: self.relationship,
            drift: self.drift,
            status_sync: self.status_sync,
        })
    }
}

/// Configuration for an [`OrchestratorRuntime`].
pub struct OrchestratorRuntimeConfig {
    store: Arc<dyn Store>,
    bus: Bus,
    deployers: Arc<DeployerRegistry>,
    operator_factory: Option<Arc<dyn OperatorFactory>>,
    relationship: RelationshipSchedulerConfig,
    drift: DriftSchedulerConfig,
    status_sync: StatusSyncerConfig,
}

/// Shutdown signals and task handle of one spawned worker.
struct Worker {
    name: &'static str,
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
    cancel: CancellationToken,
}

impl OrchestratorRuntimeConfig {
    /// Start the runtime, spawning the scheduler tasks.
    pub async fn start(self) -> Result<OrchestratorRuntime> {
        let mut workers = Vec::with_capacity(3);

        let relationship = RelationshipScheduler::new(
            self.store.clone(),
            self.deployers.clone(),
            self.relationship,
        );
        self.bus
            .subscribe("relationship-scheduler", relationship.waker())
            .await;
        let shutdown = relationship.shutdown_handle();
        let cancel = relationship.cancel_handle();
        workers.push(Worker {
            name: "Relationship scheduler",
            handle: tokio::spawn(async move {
                relationship.run().await;
            }),
            shutdown,
            cancel,
        });

        let drift = DriftScheduler::new(self.store.clone(), self.deployers.clone(), self.drift);
        let shutdown = drift.shutdown_handle();
        let cancel = drift.cancel_handle();
        workers.push(Worker {
            name: "Drift scheduler",
            handle: tokio::spawn(async move {
                drift.run().await;
            }),
            shutdown,
            cancel,
        });

        if let Some(factory) = self.operator_factory {
            let syncer = StatusSyncer::new(self.store.clone(), factory, self.status_sync);
            let shutdown = syncer.shutdown_handle();
            let cancel = syncer.cancel_handle();
            workers.push(Worker {
                name: "Status syncer",
                handle: tokio::spawn(async move {
                    syncer.run().await;
                }),
                shutdown,
                cancel,
            });
        } else {
            debug!("No operator factory configured; status sync disabled");
        }

        info!(
            deployers = self.deployers.len(),
            workers = workers.len(),
            "OrchestratorRuntime started"
        );

        Ok(OrchestratorRuntime {
            workers,
            service: ResourceService::new(self.store.clone()),
            store: self.store,
            bus: self.bus,
            deployers: self.deployers,
        })
    }
}

/// A running orchestrator that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct OrchestratorRuntime {
    workers: Vec<Worker>,
    service: ResourceService,
    store: Arc<dyn Store>,
    bus: Bus,
    deployers: Arc<DeployerRegistry>,
}

impl OrchestratorRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> OrchestratorRuntimeBuilder {
        OrchestratorRuntimeBuilder::new()
    }

    /// Resource request operations.
    pub fn service(&self) -> &ResourceService {
        &self.service
    }

    /// The shared store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The run event bus the schedulers listen on.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Registered deployers.
    pub fn deployers(&self) -> &Arc<DeployerRegistry> {
        &self.deployers
    }

    /// Gracefully shut down the runtime.
    ///
    /// Passes in progress are cancelled, then every worker is signalled and
    /// awaited. Jobs already launched keep running; their monitors finish
    /// independently.
    pub async fn shutdown(self) -> Result<()> {
        info!("OrchestratorRuntime shutting down...");

        for worker in &self.workers {
            worker.cancel.cancel();
            worker.shutdown.notify_one();
        }

        for worker in self.workers {
            if let Err(e) = worker.handle.await {
                error!("{} task panicked: {}", worker.name, e);
            }
        }

        info!("OrchestratorRuntime shutdown complete");
        Ok(())
    }

    /// Check if every worker is still running.
    pub fn is_running(&self) -> bool {
        self.workers.iter().all(|w| !w.handle.is_finished())
    }
}
