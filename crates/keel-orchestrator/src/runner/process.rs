// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local process job runner.
//!
//! Each job is a child process started in its work directory. Both output
//! streams go to `job.log` in that directory; a file instead of a pipe keeps
//! the child alive after the handle stops reading.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::traits::*;

/// Name of the log file written into the job's work directory.
pub const JOB_LOG: &str = "job.log";

struct ProcessJob {
    child: Child,
    labels: BTreeMap<String, String>,
    log_path: PathBuf,
    exit: Option<ExitStatus>,
    stopped: bool,
}

impl ProcessJob {
    /// Poll the child; true while it has not exited.
    fn poll(&mut self, job_id: &str) -> bool {
        if self.exit.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit = Some(status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to poll job process");
                false
            }
        }
    }
}

/// Runs jobs as local child processes.
#[derive(Default)]
pub struct ProcessJobRunner {
    jobs: Arc<Mutex<HashMap<String, ProcessJob>>>,
}

impl ProcessJobRunner {
    /// Create a new process runner.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRunner for ProcessJobRunner {
    fn runner_type(&self) -> &'static str {
        "process"
    }

    async fn launch_detached(&self, options: &JobOptions) -> Result<JobHandle> {
        if !options.work_dir.is_dir() {
            return Err(JobRunnerError::StartFailed(format!(
                "work directory {} does not exist",
                options.work_dir.display()
            )));
        }

        let log_path = options.work_dir.join(JOB_LOG);
        let log = std::fs::File::create(&log_path)?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&options.program);
        cmd.args(&options.args)
            .current_dir(&options.work_dir)
            .envs(&options.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => JobRunnerError::ProgramNotFound(options.program.clone()),
            _ => JobRunnerError::StartFailed(e.to_string()),
        })?;

        let pid = child.id();
        info!(
            job_id = %options.job_id,
            pid = ?pid,
            program = %options.program,
            work_dir = %options.work_dir.display(),
            "Job launched"
        );

        let handle = JobHandle {
            handle_id: pid.map(|p| p.to_string()).unwrap_or_else(|| options.job_id.clone()),
            job_id: options.job_id.clone(),
            started_at: Utc::now(),
            spawned_pid: pid,
        };

        self.jobs.lock().await.insert(
            options.job_id.clone(),
            ProcessJob {
                child,
                labels: options.labels.clone(),
                log_path,
                exit: None,
                stopped: false,
            },
        );

        Ok(handle)
    }

    async fn is_running(&self, handle: &JobHandle) -> bool {
        let mut jobs = self.jobs.lock().await;
        jobs.get_mut(&handle.job_id)
            .map(|j| j.poll(&handle.job_id))
            .unwrap_or(false)
    }

    async fn stop(&self, handle: &JobHandle) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&handle.job_id)
            .ok_or_else(|| JobRunnerError::JobNotFound(handle.job_id.clone()))?;
        job.stopped = true;
        if job.poll(&handle.job_id) {
            job.child.kill().await?;
            job.exit = job.child.try_wait()?;
        }
        debug!(job_id = %handle.job_id, "Job stopped");
        Ok(())
    }

    async fn collect_result(&self, handle: &JobHandle) -> JobResult {
        let job = self.jobs.lock().await.remove(&handle.job_id);
        let Some(mut job) = job else {
            return JobResult {
                error: Some("Job not found".to_string()),
                ..Default::default()
            };
        };

        if job.exit.is_none() {
            job.exit = job.child.wait().await.ok();
        }

        let log = tokio::fs::read_to_string(&job.log_path).await.ok();
        JobResult {
            exit_code: job.exit.and_then(|s| s.code()),
            error: job.stopped.then(|| "Stopped".to_string()),
            log,
        }
    }

    async fn count_active(&self, selector: &[(&str, &str)]) -> usize {
        let mut jobs = self.jobs.lock().await;
        jobs.iter_mut()
            .filter(|(_, j)| matches_selector(&j.labels, selector))
            .filter_map(|(id, j)| j.poll(id).then_some(()))
            .count()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn options(dir: &std::path::Path, job_id: &str, script: &str) -> JobOptions {
        JobOptions {
            job_id: job_id.to_string(),
            work_dir: dir.to_path_buf(),
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::from([("KEEL_TEST".to_string(), "yes".to_string())]),
            labels: BTreeMap::from([("keel.io/drift-detection".to_string(), "true".to_string())]),
        }
    }

    async fn wait_finished(runner: &ProcessJobRunner, handle: &JobHandle) {
        for _ in 0..200 {
            if !runner.is_running(handle).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("job did not finish");
    }

    #[tokio::test]
    async fn test_exit_code_and_log_are_collected() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessJobRunner::new();
        let handle = runner
            .launch_detached(&options(dir.path(), "job-1", "echo out; echo \"err $KEEL_TEST\" >&2; exit 3"))
            .await
            .unwrap();

        wait_finished(&runner, &handle).await;
        let result = runner.collect_result(&handle).await;

        assert_eq!(result.exit_code, Some(3));
        assert!(!result.success());
        let log = result.log.unwrap();
        assert!(log.contains("out"));
        assert!(log.contains("err yes"));
        assert!(dir.path().join(JOB_LOG).exists());
    }

    #[tokio::test]
    async fn test_count_active_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessJobRunner::new();
        let handle = runner
            .launch_detached(&options(dir.path(), "job-2", "sleep 30"))
            .await
            .unwrap();

        assert_eq!(runner.count_active(&[("keel.io/drift-detection", "true")]).await, 1);
        assert_eq!(runner.count_active(&[("keel.io/job-type", "apply")]).await, 0);

        runner.stop(&handle).await.unwrap();
        assert!(!runner.is_running(&handle).await);
        assert_eq!(runner.count_active(&[]).await, 0);

        let result = runner.collect_result(&handle).await;
        assert_eq!(result.error.as_deref(), Some("Stopped"));
    }

    #[tokio::test]
    async fn test_missing_work_dir_fails_to_start() {
        let runner = ProcessJobRunner::new();
        let err = runner
            .launch_detached(&options(std::path::Path::new("/nonexistent/keel"), "job-3", "true"))
            .await
            .unwrap_err();
        assert!(matches!(err, JobRunnerError::StartFailed(_)));
    }
}
