// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock job runner for testing.
//!
//! Simulates job execution without starting processes. Launched options are
//! recorded so tests can inspect what a deployer asked for.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::traits::*;

/// Mock job state.
#[derive(Debug, Clone)]
struct MockJob {
    labels: BTreeMap<String, String>,
    running: Arc<AtomicBool>,
    exit_code: Option<i32>,
    error: Option<String>,
    log: Option<String>,
}

/// Mock job runner for testing.
pub struct MockJobRunner {
    jobs: Arc<Mutex<HashMap<String, MockJob>>>,
    launched: Arc<Mutex<Vec<JobOptions>>>,
    /// Optional delay to simulate execution time (in milliseconds)
    pub execution_delay_ms: u64,
    /// Exit code jobs finish with on their own
    pub exit_code: i32,
    /// If true, jobs stay running until completed or stopped explicitly.
    pub never_complete: bool,
    /// If true, every launch fails.
    pub fail_launch: bool,
}

impl Default for MockJobRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl MockJobRunner {
    /// Create a new mock runner whose jobs succeed.
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
            launched: Arc::new(Mutex::new(Vec::new())),
            execution_delay_ms: 10,
            exit_code: 0,
            never_complete: false,
            fail_launch: false,
        }
    }

    /// Create a mock runner whose jobs exit with code 1.
    pub fn failing() -> Self {
        Self {
            exit_code: 1,
            ..Self::new()
        }
    }

    /// Create a mock runner whose jobs never finish on their own.
    pub fn never_completing() -> Self {
        Self {
            execution_delay_ms: 0,
            never_complete: true,
            ..Self::new()
        }
    }

    /// Mark a job finished with an exit code and log.
    pub async fn complete_job(&self, job_id: &str, exit_code: i32, log: &str) {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(job_id) {
            job.running.store(false, Ordering::SeqCst);
            job.exit_code = Some(exit_code);
            job.log = Some(log.to_string());
        }
    }

    /// Mark a job failed on the runner side.
    pub async fn fail_job(&self, job_id: &str, error: &str) {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(job_id) {
            job.running.store(false, Ordering::SeqCst);
            job.error = Some(error.to_string());
        }
    }

    /// Options of every launch, in order.
    pub async fn launched(&self) -> Vec<JobOptions> {
        self.launched.lock().await.clone()
    }
}

#[async_trait]
impl JobRunner for MockJobRunner {
    fn runner_type(&self) -> &'static str {
        "mock"
    }

    async fn launch_detached(&self, options: &JobOptions) -> Result<JobHandle> {
        if self.fail_launch {
            return Err(JobRunnerError::StartFailed("Mock launch failure".to_string()));
        }

        let handle = JobHandle {
            handle_id: format!("mock_{}", options.job_id),
            job_id: options.job_id.clone(),
            started_at: Utc::now(),
            spawned_pid: None,
        };

        let running = Arc::new(AtomicBool::new(true));
        self.jobs.lock().await.insert(
            options.job_id.clone(),
            MockJob {
                labels: options.labels.clone(),
                running: running.clone(),
                exit_code: None,
                error: None,
                log: None,
            },
        );
        self.launched.lock().await.push(options.clone());

        if !self.never_complete {
            let jobs = self.jobs.clone();
            let job_id = options.job_id.clone();
            let exit_code = self.exit_code;
            let delay = self.execution_delay_ms;

            tokio::spawn(async move {
                if delay > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }

                let mut jobs = jobs.lock().await;
                if let Some(job) = jobs.get_mut(&job_id)
                    && job.running.load(Ordering::SeqCst)
                {
                    job.running.store(false, Ordering::SeqCst);
                    job.exit_code = Some(exit_code);
                }
            });
        }

        Ok(handle)
    }

    async fn is_running(&self, handle: &JobHandle) -> bool {
        let jobs = self.jobs.lock().await;
        jobs.get(&handle.job_id)
            .map(|j| j.running.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    async fn stop(&self, handle: &JobHandle) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(&handle.job_id) {
            job.running.store(false, Ordering::SeqCst);
            job.error = Some("Stopped".to_string());
        }
        Ok(())
    }

    async fn collect_result(&self, handle: &JobHandle) -> JobResult {
        match self.jobs.lock().await.remove(&handle.job_id) {
            Some(job) => JobResult {
                exit_code: job.exit_code,
                error: job.error,
                log: job.log,
            },
            None => JobResult {
                error: Some("Job not found".to_string()),
                ..Default::default()
            },
        }
    }

    async fn count_active(&self, selector: &[(&str, &str)]) -> usize {
        let jobs = self.jobs.lock().await;
        jobs.values()
            .filter(|j| j.running.load(Ordering::SeqCst) && matches_selector(&j.labels, selector))
            .count()
    }
}
