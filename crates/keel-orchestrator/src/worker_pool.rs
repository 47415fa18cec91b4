// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded task pool and per-operator limiter.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::error;

use crate::error::{Error, MultiError, Result};

/// Runs at most `size` tasks at once.
///
/// [`submit`](Self::submit) waits for a free slot, so a producer submitting
/// faster than tasks finish is slowed down. [`wait`](Self::wait) joins
/// everything submitted so far and merges the failures.
pub struct WorkerPool {
    size: usize,
    slots: Arc<Semaphore>,
    tasks: Mutex<JoinSet<Result<()>>>,
}

impl WorkerPool {
    /// Pool running up to `size` tasks (at least one).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            slots: Arc::new(Semaphore::new(size)),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Maximum concurrent tasks.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Tasks currently holding a slot.
    pub fn in_flight(&self) -> usize {
        self.size - self.slots.available_permits()
    }

    /// Start a task once a slot is free.
    pub async fn submit<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Other("worker pool closed".to_string()))?;
        self.tasks.lock().await.spawn(async move {
            let _permit = permit;
            task.await
        });
        Ok(())
    }

    /// Wait for every submitted task; failures and panics are merged.
    pub async fn wait(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        let mut errs = MultiError::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => errs.push(e),
                Err(e) => {
                    error!("Worker pool task panicked: {}", e);
                    errs.push(Error::Other(format!("worker task failed: {}", e)));
                }
            }
        }
        errs.into_result()
    }
}

/// Per-key concurrency limit, one semaphore per operator/connector.
pub struct OperatorLimiter {
    permits: usize,
    semaphores: StdMutex<HashMap<String, Arc<Semaphore>>>,
}

impl OperatorLimiter {
    /// Allow `permits` concurrent holders per key (at least one).
    pub fn new(permits: usize) -> Self {
        Self {
            permits: permits.max(1),
            semaphores: StdMutex::new(HashMap::new()),
        }
    }

    /// Wait for a permit of `key`; it is released when dropped.
    pub async fn acquire(&self, key: &str) -> Result<OwnedSemaphorePermit> {
        let semaphore = {
            let mut map = self
                .semaphores
                .lock()
                .map_err(|_| Error::Other("operator limiter poisoned".to_string()))?;
            map.entry(key.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.permits)))
                .clone()
        };
        semaphore
            .acquire_owned()
            .await
            .map_err(|_| Error::Other(format!("operator limiter closed for {}", key)))
    }
}
