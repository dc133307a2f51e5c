// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for stagecraft-core.
//!
//! [`CoreError`] is the engine-level error with stable error codes. Substage
//! handlers report business failures as [`WorkflowError`], which the engine
//! always turns into a FAILED task.

use std::fmt;

use crate::task::{TaskFailure, TaskStage};

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while creating, transitioning or deleting tasks.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Task was not found in the store.
    TaskNotFound {
        /// The task ID that was not found.
        task_id: String,
    },

    /// A task with this ID already exists.
    TaskAlreadyExists {
        /// The task ID that already exists.
        task_id: String,
    },

    /// No task service is registered for the requested kind.
    UnknownTaskKind {
        /// The unregistered kind.
        kind: String,
    },

    /// The stored task belongs to a different task service.
    KindMismatch {
        /// The task ID.
        task_id: String,
        /// The kind the caller expected.
        expected: String,
        /// The kind stored with the task.
        actual: String,
    },

    /// The requested stage/sub-stage move is not allowed.
    InvalidTransition {
        /// The task ID.
        task_id: String,
        /// Current stage(sub-stage).
        from: String,
        /// Requested stage(sub-stage).
        to: String,
        /// Why the move was rejected.
        reason: String,
    },

    /// The task already reached a terminal stage and is read-only.
    TaskTerminal {
        /// The task ID.
        task_id: String,
        /// The terminal stage the task is in.
        stage: TaskStage,
    },

    /// Optimistic concurrency kept failing for a transition.
    Conflict {
        /// The task ID.
        task_id: String,
        /// How many commits were attempted.
        attempts: u32,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// A stored task document could not be decoded (unknown sub-stage, bad JSON).
    ///
    /// This is not retried; the task is left for operator inspection.
    CorruptDocument {
        /// The task ID.
        task_id: String,
        /// Decoder error details.
        details: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Shorthand for a [`CoreError::ValidationError`].
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::TaskNotFound { .. } => "TASK_NOT_FOUND",
            Self::TaskAlreadyExists { .. } => "TASK_ALREADY_EXISTS",
            Self::UnknownTaskKind { .. } => "UNKNOWN_TASK_KIND",
            Self::KindMismatch { .. } => "KIND_MISMATCH",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::TaskTerminal { .. } => "TASK_TERMINAL",
            Self::Conflict { .. } => "CONFLICT",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::CorruptDocument { .. } => "CORRUPT_DOCUMENT",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether this error means the engine cannot make progress on the task
    /// without an operator.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CorruptDocument { .. })
    }

    /// Whether repeating the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::DatabaseError { .. })
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TaskNotFound { task_id } => write!(f, "Task '{}' not found", task_id),
            Self::TaskAlreadyExists { task_id } => {
                write!(f, "Task '{}' already exists", task_id)
            }
            Self::UnknownTaskKind { kind } => {
                write!(f, "No task service registered for kind '{}'", kind)
            }
            Self::KindMismatch {
                task_id,
                expected,
                actual,
            } => write!(
                f,
                "Task '{}' is of kind '{}', expected '{}'",
                task_id, actual, expected
            ),
            Self::InvalidTransition {
                task_id,
                from,
                to,
                reason,
            } => write!(
                f,
                "Task '{}' can't move from {} to {}: {}",
                task_id, from, to, reason
            ),
            Self::TaskTerminal { task_id, stage } => {
                write!(f, "Task '{}' is already {}", task_id, stage)
            }
            Self::Conflict { task_id, attempts } => write!(
                f,
                "Task '{}' was modified concurrently, gave up after {} attempts",
                task_id, attempts
            ),
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::CorruptDocument { task_id, details } => {
                write!(f, "Task '{}' document is corrupt: {}", task_id, details)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

/// Business failure reported by a substage handler.
///
/// Returning this from a handler always moves the task to FAILED and notifies
/// its callback target.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// The workflow decided the task cannot succeed.
    #[error("{message}")]
    Failed {
        /// Human-readable reason.
        message: String,
        /// Originating cause, if any.
        cause: Option<String>,
    },

    /// An engine call made by the handler failed.
    #[error(transparent)]
    Engine(#[from] CoreError),
}

impl WorkflowError {
    /// A failure without an underlying cause.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            cause: None,
        }
    }

    /// A failure caused by another error.
    pub fn with_cause(message: impl Into<String>, cause: impl fmt::Display) -> Self {
        Self::Failed {
            message: message.into(),
            cause: Some(cause.to_string()),
        }
    }

    /// Structured failure recorded on the task document.
    pub fn to_failure(&self) -> TaskFailure {
        match self {
            Self::Failed { message, cause } => TaskFailure {
                message: message.clone(),
                cause: cause.clone(),
                error_code: None,
            },
            Self::Engine(err) => TaskFailure {
                message: err.to_string(),
                cause: None,
                error_code: Some(err.error_code().to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_codes() {
        let test_cases = vec![
            (
                CoreError::TaskNotFound {
                    task_id: "t".to_string(),
                },
                "TASK_NOT_FOUND",
            ),
            (
                CoreError::TaskAlreadyExists {
                    task_id: "t".to_string(),
                },
                "TASK_ALREADY_EXISTS",
            ),
            (
                CoreError::UnknownTaskKind {
                    kind: "k".to_string(),
                },
                "UNKNOWN_TASK_KIND",
            ),
            (
                CoreError::TaskTerminal {
                    task_id: "t".to_string(),
                    stage: TaskStage::Finished,
                },
                "TASK_TERMINAL",
            ),
            (
                CoreError::Conflict {
                    task_id: "t".to_string(),
                    attempts: 3,
                },
                "CONFLICT",
            ),
            (CoreError::validation("name", "required"), "VALIDATION_ERROR"),
            (
                CoreError::CorruptDocument {
                    task_id: "t".to_string(),
                    details: "unknown variant".to_string(),
                },
                "CORRUPT_DOCUMENT",
            ),
            (
                CoreError::DatabaseError {
                    operation: "insert".to_string(),
                    details: "disk full".to_string(),
                },
                "DATABASE_ERROR",
            ),
        ];

        for (error, expected_code) in test_cases {
            assert_eq!(
                error.error_code(),
                expected_code,
                "Error {:?} should have code {}",
                error,
                expected_code
            );
            assert!(!error.to_string().is_empty());
        }
    }

    #[test]
    fn test_core_error_display() {
        let err = CoreError::TaskNotFound {
            task_id: "abc-123".to_string(),
        };
        assert_eq!(err.to_string(), "Task 'abc-123' not found");

        let err = CoreError::InvalidTransition {
            task_id: "abc-123".to_string(),
            from: "STARTED(UPDATING)".to_string(),
            to: "STARTED(CREATED)".to_string(),
            reason: "sub-stage can not move backwards".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Task 'abc-123' can't move from STARTED(UPDATING) to STARTED(CREATED): sub-stage can not move backwards"
        );

        let err = CoreError::TaskTerminal {
            task_id: "abc-123".to_string(),
            stage: TaskStage::Failed,
        };
        assert_eq!(err.to_string(), "Task 'abc-123' is already FAILED");

        let err = CoreError::validation("endpoint_link", "is required");
        assert_eq!(
            err.to_string(),
            "Validation error for 'endpoint_link': is required"
        );
    }

    #[test]
    fn test_only_corrupt_documents_are_fatal() {
        assert!(
            CoreError::CorruptDocument {
                task_id: "t".to_string(),
                details: "x".to_string()
            }
            .is_fatal()
        );
        assert!(
            !CoreError::Conflict {
                task_id: "t".to_string(),
                attempts: 1
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_workflow_error_to_failure() {
        let failure = WorkflowError::with_cause("adapter rejected credentials", "401").to_failure();
        assert_eq!(failure.message, "adapter rejected credentials");
        assert_eq!(failure.cause.as_deref(), Some("401"));
        assert!(failure.error_code.is_none());

        let failure = WorkflowError::from(CoreError::TaskNotFound {
            task_id: "child".to_string(),
        })
        .to_failure();
        assert_eq!(failure.error_code.as_deref(), Some("TASK_NOT_FOUND"));
        assert!(failure.message.contains("child"));
    }
}
