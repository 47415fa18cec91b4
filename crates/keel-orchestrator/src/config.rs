// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for keel-orchestrator.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Orchestrator configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// `postgres://` or `sqlite:` database URL
    pub database_url: String,
    /// Root for rendered job directories and job logs
    pub data_dir: PathBuf,
    /// Terraform executable
    pub terraform_bin: String,
    /// RelationshipScheduler tick
    pub relationship_interval: Duration,
    /// DriftScheduler tick
    pub drift_interval: Duration,
    /// Global drift detection switch
    pub drift_detection_enabled: bool,
    /// Maximum concurrently running drift jobs
    pub drift_max_active_jobs: usize,
    /// StatusSyncer tick
    pub status_sync_interval: Duration,
    /// Wall-clock limit of one job
    pub job_timeout: Duration,
    /// Width of the status sync worker pool
    pub worker_pool_size: usize,
    /// Concurrent calls allowed per connector operator
    pub operator_concurrency: usize,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url =
            lookup("KEEL_DATABASE_URL").ok_or(ConfigError::MissingEnvVar("KEEL_DATABASE_URL"))?;

        let data_dir = PathBuf::from(lookup("KEEL_DATA_DIR").unwrap_or_else(|| ".data".to_string()));

        let terraform_bin = lookup("KEEL_TERRAFORM_BIN").unwrap_or_else(|| "terraform".to_string());

        let drift_detection_enabled = lookup("KEEL_DRIFT_DETECTION_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);

        Ok(Self {
            database_url,
            data_dir,
            terraform_bin,
            relationship_interval: Duration::from_secs(parse(
                &lookup,
                "KEEL_RELATIONSHIP_INTERVAL_SECS",
                5,
            )?),
            drift_interval: Duration::from_secs(parse(&lookup, "KEEL_DRIFT_INTERVAL_SECS", 60)?),
            drift_detection_enabled,
            drift_max_active_jobs: parse(&lookup, "KEEL_DRIFT_MAX_ACTIVE_JOBS", 10)?,
            status_sync_interval: Duration::from_secs(parse(
                &lookup,
                "KEEL_STATUS_SYNC_INTERVAL_SECS",
                60,
            )?),
            job_timeout: Duration::from_secs(parse(&lookup, "KEEL_JOB_TIMEOUT_SECS", 3600)?),
            worker_pool_size: parse(&lookup, "KEEL_WORKER_POOL_SIZE", 8)?,
            operator_concurrency: parse(&lookup, "KEEL_OPERATOR_CONCURRENCY", 4)?,
        })
    }
}

fn parse<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key,
            value: raw.clone(),
        }),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable does not parse.
    #[error("Invalid value for {key}: {value}")]
    InvalidValue {
        /// Variable name.
        key: &'static str,
        /// Offending value.
        value: String,
    },
}
