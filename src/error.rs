use std::time::Duration;

use thiserror::Error;

use crate::task::{TaskId, TaskStatus};

/// Failure reported by the analysis service boundary.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ServiceError {
    message: String,
}

impl ServiceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Authentication failures only surface through the provider's message text.
    pub fn is_auth(&self) -> bool {
        let lower = self.message.to_lowercase();
        [
            "api key",
            "api_key",
            "unauthorized",
            "unauthenticated",
            "permission_denied",
            "authentication",
            "invalid x-api-key",
            "(401",
            "(403",
        ]
        .iter()
        .any(|needle| lower.contains(needle))
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{:#}", err))
    }
}

/// Errors that end a single task. None of them escape the scheduler.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("failed to read page image: {0}")]
    Read(String),
    #[error("analysis service error: {0}")]
    Service(#[from] ServiceError),
    #[error("analysis service returned no block list")]
    MalformedResponse,
    #[error("analysis timed out after {0:?}")]
    Timeout(Duration),
}

impl TaskError {
    /// The single warning line stored on a failed task.
    pub fn warning(&self) -> String {
        match self {
            TaskError::Service(err) if err.is_auth() => format!(
                "Authentication with the analysis service failed; check the API key ({})",
                err.message()
            ),
            other => other.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TaskError::Read(_) => "read",
            TaskError::Service(_) => "service",
            TaskError::MalformedResponse => "malformed_response",
            TaskError::Timeout(_) => "timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(TaskId),
    #[error("task {id}: cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
}
