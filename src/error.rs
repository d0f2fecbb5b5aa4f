//! Error types for simlink.
//!
//! All errors are strongly typed using thiserror so callers can match on
//! specific conditions. Rejected decision answers are not errors: `answer`
//! reports them as `false` so retry loops treat every rejection alike.

use thiserror::Error;

use crate::component::ComponentId;
use crate::decision::DecisionKey;

/// Validation errors that occur during input validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Component id cannot be empty")]
    EmptyComponentId,

    #[error("Decision key cannot be empty")]
    EmptyDecisionKey,

    #[error("Attribute name cannot be empty")]
    EmptyAttribute,

    #[error("Epsilon must be finite and positive, got {value}")]
    InvalidEpsilon {
        value: f64,
    },

    #[error("Invalid range for '{attribute}': min ({min}) must not exceed max ({max})")]
    InvalidRange {
        attribute: String,
        min: f64,
        max: f64,
    },

    #[error("Invalid regex '{pattern}': {reason}")]
    InvalidRegex {
        pattern: String,
        reason: String,
    },

    #[error("Component kind '{kind}' has no attribute '{attribute}'")]
    UnknownAttribute {
        kind: String,
        attribute: String,
    },

    #[error("Component {component} has no port {index}")]
    UnknownPort {
        component: ComponentId,
        index: usize,
    },

    #[error("Invalid value: {reason}")]
    InvalidValue {
        reason: String,
    },
}

/// Execution errors that occur while running the pipeline.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Decision '{key}' is already registered")]
    DuplicateRegistration {
        key: DecisionKey,
    },

    #[error("Decision not found: {key}")]
    DecisionNotFound {
        key: DecisionKey,
    },

    #[error("Decision '{key}' is still pending")]
    DecisionPending {
        key: DecisionKey,
    },

    #[error("Component not found: {id}")]
    ComponentNotFound {
        id: ComponentId,
    },

    #[error("Project not found: {id}")]
    ProjectNotFound {
        id: String,
    },

    #[error("Attribute '{attribute}' of {component} has an open decision")]
    AttributeLocked {
        component: ComponentId,
        attribute: String,
    },

    #[error("Decision '{key}' was not accepted after {attempts} attempts")]
    RetriesExhausted {
        key: DecisionKey,
        attempts: u32,
    },

    #[error("No candidate answer left for decision '{key}'")]
    NoCandidate {
        key: DecisionKey,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Storage error: {message}")]
    Storage {
        message: String,
    },

    #[error("Channel disconnected: {path}")]
    Disconnected {
        path: String,
    },
}

/// Transport errors for client-server communication.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {message}")]
    ConnectionFailed {
        message: String,
    },

    #[error("Failed to serialize request: {message}")]
    SerializationFailed {
        message: String,
    },

    #[error("Failed to deserialize response: {message}")]
    DeserializationFailed {
        message: String,
    },

    #[error("Server error ({code}): {message}")]
    ServerError {
        code: String,
        message: String,
    },

    #[error("Decision stream closed by server: {message}")]
    StreamClosed {
        message: String,
    },

    #[error("No project selected; call set_project first")]
    NoProject,
}

/// Top-level error type for simlink.
#[derive(Debug, Error)]
pub enum SimlinkError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl SimlinkError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is a transport error.
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if the failed call may succeed when repeated.
    ///
    /// A lost channel leaves in-flight decisions pending server side, so the
    /// caller can reconnect and fetch bunches again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) => false,
            Self::Execution(e) => matches!(
                e,
                ExecutionError::Timeout { .. } | ExecutionError::Disconnected { .. }
            ),
            Self::Transport(e) => matches!(
                e,
                TransportError::ConnectionFailed { .. } | TransportError::StreamClosed { .. }
            ),
            Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for simlink operations.
pub type SimlinkResult<T> = Result<T, SimlinkError>;
