//! Error types for the signal composer.
//!
//! Errors are strongly typed using thiserror and layered the same way the
//! runtime handles them: configuration errors reject one entry, graph errors
//! keep one signal out of the active set, execution errors are reported to the
//! caller of the failing action.

use thiserror::Error;

/// Errors raised while turning declarations into sources and signals.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Malformed {kind} entry: {reason}")]
    Malformed {
        kind: &'static str,
        reason: String,
    },

    #[error("Signal '{id}' must declare exactly one of 'event' or 'depends'")]
    AmbiguousSignal {
        id: String,
    },

    #[error("Invalid event '{event}': expected '<api>/<event>'")]
    InvalidEvent {
        event: String,
    },

    #[error("Signal '{id}' depends on '{dependency}': compose with signal ids, not low level names")]
    QualifiedDependency {
        id: String,
        dependency: String,
    },

    #[error("Invalid action uri '{uri}': {reason}")]
    InvalidActionUri {
        uri: String,
        reason: String,
    },

    #[error("Duplicate signal id: {id}")]
    DuplicateSignal {
        id: String,
    },

    #[error("Duplicate source uid: {uid}")]
    DuplicateSource {
        uid: String,
    },

    #[error("No source registered for api '{api}'")]
    UnknownSource {
        api: String,
    },
}

/// Errors detected while wiring the dependency graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Infinite recursion loop rooted at signal '{origin}' (reached again through '{through}')")]
    Cycle {
        origin: String,
        through: String,
    },

    #[error("Signal '{signal}' depends on unknown signal '{dependency}'")]
    UnknownDependency {
        signal: String,
        dependency: String,
    },
}

/// Errors that occur while executing actions or delivering notifications.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("No executor available for {kind} action '{action}'")]
    Unsupported {
        kind: &'static str,
        action: String,
    },

    #[error("Plugin not found: {plugin}")]
    UnknownPlugin {
        plugin: String,
    },

    #[error("Plugin '{plugin}' has no function '{function}'")]
    UnknownFunction {
        plugin: String,
        function: String,
    },

    #[error("Action '{action}' failed: {reason}")]
    ActionFailed {
        action: String,
        reason: String,
    },

    #[error("No data found to set signal '{signal}'")]
    NoData {
        signal: String,
    },

    #[error("Client session not found: {id}")]
    SessionNotFound {
        id: String,
    },

    #[error("Channel disconnected: {path}")]
    Disconnected {
        path: String,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },
}

impl ExecutionError {
    /// Creates an action failure for the given action uid.
    #[must_use]
    pub fn failed(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ActionFailed {
            action: action.into(),
            reason: reason.into(),
        }
    }
}

/// Top-level error type for the composer.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ComposerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl ComposerError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if this is a graph error.
    #[must_use]
    pub const fn is_graph(&self) -> bool {
        matches!(self, Self::Graph(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }
}

/// Result type alias for composer operations.
pub type ComposerResult<T> = Result<T, ComposerError>;

pub(crate) fn lock_err(context: &'static str) -> ComposerError {
    ComposerError::internal(format!("poisoned lock: {context}"))
}
