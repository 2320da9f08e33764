use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Umbrella error for everything the engine can report.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("node type not found: '{0}'")]
    NotFound(String),

    #[error("node registration failed: {0}")]
    Registration(String),

    #[error("node '{id}' already registered at version {existing}, refusing {offered}")]
    VersionConflict {
        id: String,
        existing: String,
        offered: String,
    },
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("no state slot for execution {0}")]
    ExecutionNotFound(Uuid),

    #[error("state serialization failed: {0}")]
    Serialization(String),
}

/// Runtime failures raised while traversing a parsed workflow.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("workflow failed validation: {0}")]
    Validation(String),

    #[error("node type not found: '{0}'")]
    NodeNotFound(String),

    #[error("node '{node_id}' failed: {reason}")]
    NodeFailed { node_id: String, reason: String },

    #[error("node '{node_id}' timed out after {timeout_ms}ms")]
    NodeTimeout { node_id: String, timeout_ms: u64 },

    #[error("loop node '{node_id}' exceeded {limit} iterations")]
    LoopLimitExceeded { node_id: String, limit: u32 },

    #[error("edge resolution exceeded maximum nesting depth of {limit}")]
    NestingLimitExceeded { limit: usize },

    #[error("resource budget exceeded: {0}")]
    ResourceExceeded(String),

    #[error("execution cancelled")]
    Cancelled,

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),
}

/// Serializable error taxonomy carried by execution results so status
/// pollers can distinguish failure classes without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NodeNotFound,
    NodeExecution,
    NodeTimeout,
    LoopLimitExceeded,
    NestingLimitExceeded,
    ResourceExceeded,
    Cancelled,
    State,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&ExecutionError> for ErrorRecord {
    fn from(err: &ExecutionError) -> Self {
        let kind = match err {
            ExecutionError::Validation(_) => ErrorKind::Validation,
            ExecutionError::NodeNotFound(_) => ErrorKind::NodeNotFound,
            ExecutionError::NodeFailed { .. } => ErrorKind::NodeExecution,
            ExecutionError::NodeTimeout { .. } => ErrorKind::NodeTimeout,
            ExecutionError::LoopLimitExceeded { .. } => ErrorKind::LoopLimitExceeded,
            ExecutionError::NestingLimitExceeded { .. } => ErrorKind::NestingLimitExceeded,
            ExecutionError::ResourceExceeded(_) => ErrorKind::ResourceExceeded,
            ExecutionError::Cancelled => ErrorKind::Cancelled,
            ExecutionError::ExecutionNotFound(_) => ErrorKind::State,
        };
        Self::new(kind, err.to_string())
    }
}
