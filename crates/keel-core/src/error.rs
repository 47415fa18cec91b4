// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for keel-core.
//!
//! Errors in the first group are surfaced to callers as-is (the API layer maps
//! them to user-facing responses); the rest wrap infrastructure failures.

use thiserror::Error;

use crate::graph::CycleError;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Resources of a batch (or their stored relationships) form a dependency cycle.
    #[error(transparent)]
    Cycle(#[from] CycleError),

    /// The resource is bound to neither a template nor a resource definition rule.
    #[error("missing template or resource definition")]
    NoTemplate,

    /// A run of the resource is still in progress.
    #[error("deployment is running")]
    DeploymentRunning,

    /// Neither the session nor the resource carries an acting subject.
    #[error("missing subject")]
    NoSubject,

    /// Resource was not found.
    #[error("Resource '{0}' not found")]
    ResourceNotFound(String),

    /// Run was not found.
    #[error("Run '{0}' not found")]
    RunNotFound(String),

    /// Resource name is already taken in the environment.
    #[error("Resource '{name}' already exists in environment '{environment_id}'")]
    DuplicateResource {
        /// Environment scope.
        environment_id: String,
        /// Conflicting resource name.
        name: String,
    },

    /// Entity is in a state that does not allow the requested operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Cycle(_) => "DEPENDENCY_CYCLE",
            Self::NoTemplate => "NO_TEMPLATE",
            Self::DeploymentRunning => "DEPLOYMENT_RUNNING",
            Self::NoSubject => "NO_SUBJECT",
            Self::ResourceNotFound(_) => "RESOURCE_NOT_FOUND",
            Self::RunNotFound(_) => "RUN_NOT_FOUND",
            Self::DuplicateResource { .. } => "DUPLICATE_RESOURCE",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::Database(_) | Self::Migrate(_) => "DATABASE_ERROR",
            Self::Json(_) => "SERIALIZATION_ERROR",
            Self::Io(_) => "IO_ERROR",
        }
    }

    /// Whether this error is reported back to the caller of a request
    /// rather than treated as an infrastructure failure.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::Cycle(_)
                | Self::NoTemplate
                | Self::DeploymentRunning
                | Self::NoSubject
                | Self::ResourceNotFound(_)
                | Self::RunNotFound(_)
                | Self::DuplicateResource { .. }
                | Self::InvalidState(_)
        )
    }
}

/// Returns true when the database error is a unique constraint violation.
///
/// Both backends report these through [`sqlx::error::DatabaseError::is_unique_violation`].
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(CoreError::NoTemplate.error_code(), "NO_TEMPLATE");
        assert_eq!(
            CoreError::DeploymentRunning.error_code(),
            "DEPLOYMENT_RUNNING"
        );
        assert_eq!(CoreError::NoSubject.error_code(), "NO_SUBJECT");
    }

    #[test]
    fn test_display_matches_reported_messages() {
        assert_eq!(CoreError::DeploymentRunning.to_string(), "deployment is running");
        assert_eq!(
            CoreError::NoTemplate.to_string(),
            "missing template or resource definition"
        );
    }

    #[test]
    fn test_cycle_error_is_transparent() {
        let err: CoreError = CycleError::new(vec!["a".into(), "b".into(), "a".into()]).into();
        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");
        assert!(err.is_user_facing());
    }

    #[test]
    fn test_database_error_is_not_user_facing() {
        let err = CoreError::Database(sqlx::Error::RowNotFound);
        assert!(!err.is_user_facing());
        assert_eq!(err.error_code(), "DATABASE_ERROR");
    }
}
