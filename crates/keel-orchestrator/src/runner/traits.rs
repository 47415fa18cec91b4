// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job runner trait definitions.
//!
//! Defines the abstract interface for executing backend jobs.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from job runner operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum JobRunnerError {
    /// Program was not found.
    #[error("Program not found: {0}")]
    ProgramNotFound(String),

    /// Process failed to start.
    #[error("Job start failed: {0}")]
    StartFailed(String),

    /// Job is not tracked by this runner.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for job runner operations.
pub type Result<T> = std::result::Result<T, JobRunnerError>;

/// Options for launching a job.
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Job ID, unique among tracked jobs
    pub job_id: String,
    /// Directory the job runs in; its log lands here too
    pub work_dir: PathBuf,
    /// Executable
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: HashMap<String, String>,
    /// Labels used to select jobs, e.g. `keel.io/drift-detection=true`
    pub labels: BTreeMap<String, String>,
}

/// Handle for a launched job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    /// Runner-specific identifier (PID for processes)
    pub handle_id: String,
    /// Job ID
    pub job_id: String,
    /// When the job was started
    pub started_at: chrono::DateTime<chrono::Utc>,
    /// PID of the spawned process, when there is one
    pub spawned_pid: Option<u32>,
}

/// Terminal result of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobResult {
    /// Process exit code; None when killed or never started.
    pub exit_code: Option<i32>,
    /// Runner-side failure (stopped, lost, unreadable).
    pub error: Option<String>,
    /// Captured job log.
    pub log: Option<String>,
}

impl JobResult {
    /// Exited with status 0 and no runner-side failure.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && self.error.is_none()
    }

    /// Human-readable failure, preferring the tail of the log.
    pub fn failure_message(&self) -> String {
        if let Some(e) = &self.error {
            return e.clone();
        }
        let tail = self
            .log
            .as_deref()
            .map(|l| log_tail(l, 20))
            .unwrap_or_default();
        match (self.exit_code, tail.is_empty()) {
            (Some(code), true) => format!("job exited with code {}", code),
            (Some(code), false) => format!("job exited with code {}: {}", code, tail),
            (None, _) => "job terminated without an exit code".to_string(),
        }
    }
}

/// Last `lines` non-empty lines of a log.
pub fn log_tail(log: &str, lines: usize) -> String {
    let kept: Vec<&str> = log.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = kept.len().saturating_sub(lines);
    kept[start..].join("\n")
}

/// Whether `labels` carries every pair of `selector`.
pub fn matches_selector(labels: &BTreeMap<String, String>, selector: &[(&str, &str)]) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(*k).map(String::as_str) == Some(*v))
}

/// Trait for job runners.
///
/// Runners are PURE execution engines - they do NOT access the database.
/// Run bookkeeping is handled by the caller.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Runner type identifier (e.g., "process", "mock")
    fn runner_type(&self) -> &'static str;

    /// Launch a job without waiting for completion.
    async fn launch_detached(&self, options: &JobOptions) -> Result<JobHandle>;

    /// Check if a job is still running.
    async fn is_running(&self, handle: &JobHandle) -> bool;

    /// Stop a running job.
    async fn stop(&self, handle: &JobHandle) -> Result<()>;

    /// Collect the result and forget the job. Call after it has finished.
    async fn collect_result(&self, handle: &JobHandle) -> JobResult;

    /// Number of running jobs whose labels match the selector.
    async fn count_active(&self, selector: &[(&str, &str)]) -> usize;
}
