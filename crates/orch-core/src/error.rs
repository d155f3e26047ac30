//! ---
//! orch_section: "02-execution-engine"
//! orch_subsection: "module"
//! orch_type: "source"
//! orch_scope: "code"
//! orch_description: "Error taxonomy for the orchestration core."
//! orch_version: "v0.0.0-prealpha"
//! orch_owner: "tbd"
//! ---
use std::fmt;

use crate::models::ExecutionStatus;

/// Result alias used throughout the orchestration core.
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Kind of record a lookup failed to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Deployment,
    Operation,
    Resource,
    Provider,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RecordKind::Deployment => "Deployment",
            RecordKind::Operation => "Operation",
            RecordKind::Resource => "Resource",
            RecordKind::Provider => "Provider",
        };
        f.write_str(label)
    }
}

/// Errors surfaced by the orchestration core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestrationError {
    /// Malformed or out-of-range request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Referenced id does not exist in the corresponding store.
    #[error("{kind} with ID {id} not found")]
    NotFound { kind: RecordKind, id: String },
    /// A record with the same id is already stored.
    #[error("{kind} with ID {id} already exists")]
    AlreadyExists { kind: RecordKind, id: String },
    /// The provisioning backend reported a failure.
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// A tracking record was asked to move backwards or out of a terminal state.
    #[error("illegal transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },
}

impl OrchestrationError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn not_found(kind: RecordKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn already_exists(kind: RecordKind, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Failure raised by a provisioning backend or provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
    /// Whether repeating the call may succeed.
    pub retryable: bool,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}
