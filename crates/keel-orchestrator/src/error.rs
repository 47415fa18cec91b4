// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for keel-orchestrator.

use std::fmt;

use keel_core::error::CoreError;
use thiserror::Error;

/// Orchestrator errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Core model or persistence operation failed.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Deployer failed to start or track a job.
    #[error("Deployer error: {0}")]
    Deployer(#[from] crate::deployer::DeployerError),

    /// Job runner failed.
    #[error("Job runner error: {0}")]
    Runner(#[from] crate::runner::JobRunnerError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Stored relationships of a resource loop back onto it.
    #[error("dependency cycle detected, resource id: {resource_id}, path: {path}")]
    CycleDetected {
        /// Resource whose relationships contain the cycle.
        resource_id: String,
        /// Offending path, `a -> b -> a`.
        path: String,
    },

    /// Drift detection waited too long for a free job slot.
    #[error("timed out waiting for a drift detection slot, {active} jobs active")]
    DriftSlotTimeout {
        /// Active jobs at the last check.
        active: usize,
    },

    /// The pass was cancelled before it finished.
    #[error("Operation cancelled")]
    Cancelled,

    /// Several independent failures of one pass.
    #[error(transparent)]
    Multi(MultiError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using the orchestrator Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Ordered collection of errors from a pass that continues past failures.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<Error>,
}

impl MultiError {
    /// Empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error; nested collections are flattened.
    pub fn push(&mut self, error: impl Into<Error>) {
        match error.into() {
            Error::Multi(inner) => self.errors.extend(inner.errors),
            other => self.errors.push(other),
        }
    }

    /// Record the error of a result, if any.
    pub fn record<T>(&mut self, result: std::result::Result<T, impl Into<Error>>) -> Option<T> {
        match result {
            Ok(v) => Some(v),
            Err(e) => {
                self.push(e);
                None
            }
        }
    }

    /// Number of recorded errors.
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Whether nothing failed.
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Recorded errors in order.
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// `Ok(())` when empty, the single error when there is one, otherwise
    /// [`Error::Multi`].
    pub fn into_result(mut self) -> Result<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(Error::Multi(self)),
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, e) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", e)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_error_joins_messages() {
        let mut errs = MultiError::new();
        errs.push(Error::Other("first".into()));
        errs.push(CoreError::NoTemplate);
        let err = errs.into_result().unwrap_err();
        assert_eq!(err.to_string(), "first; missing template or resource definition");
    }

    #[test]
    fn test_multi_error_flattens_and_unwraps_single() {
        let mut inner = MultiError::new();
        inner.push(Error::Other("a".into()));
        inner.push(Error::Other("b".into()));

        let mut outer = MultiError::new();
        outer.push(Error::Multi(inner));
        assert_eq!(outer.len(), 2);

        let mut single = MultiError::new();
        assert_eq!(single.record(Ok::<_, Error>(3)), Some(3));
        single.record(Err::<(), _>(Error::Cancelled));
        assert!(matches!(single.into_result(), Err(Error::Cancelled)));

        assert!(MultiError::new().into_result().is_ok());
    }
}
