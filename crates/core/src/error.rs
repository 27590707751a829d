//! Error types for the parley domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum:
//!
//! - [`FlowError`]: local to one flow instance; it aborts that instance (and
//!   its descendants) and never reaches siblings or the session.
//! - [`ActionError`]: an external action failed; it is delivered to the
//!   waiting flow as an `ActionFailed` event.
//! - [`RuntimeError`]: session-level failures. Only
//!   [`RuntimeError::UnreachableState`] is fatal to a session.

use crate::value::Value;
use thiserror::Error;

/// The top-level error type for all parley operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Flow instance errors ---
    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    // --- Session / runtime errors ---
    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    // --- Action bridge errors ---
    #[error("Action error: {0}")]
    Action(#[from] ActionError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures confined to a single flow instance.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FlowError {
    /// Malformed or unresolvable match pattern / expression, e.g. a
    /// reference to a variable that was never bound.
    #[error("Pattern error: {0}")]
    Pattern(String),

    #[error("Binding conflict on ${name}: bound to {existing}, got {incoming}")]
    BindingConflict {
        name: String,
        existing: Value,
        incoming: Value,
    },

    /// An awaited action or child flow failed and the flow has no handler.
    #[error("Unhandled failure of {action}: {reason}")]
    ActionFailed { action: String, reason: String },

    /// An activation ran too many instructions without blocking.
    #[error("Activation exceeded {limit} steps without blocking")]
    StepLimit { limit: usize },

    #[error("Unknown flow: {0}")]
    UnknownFlow(String),

    /// Explicit `abort` statement or external stop request.
    #[error("Stopped: {0}")]
    Stopped(String),

    /// The parent instance terminated.
    #[error("Parent {0} terminated")]
    ParentTerminated(String),
}

/// Failures of an external action invoked through the bridge.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ActionError {
    #[error("Action not found: {0}")]
    NotFound(String),

    #[error("Action execution failed: {action}: {reason}")]
    ExecutionFailed { action: String, reason: String },

    #[error("Action timed out: {action} after {timeout_secs}s")]
    Timeout { action: String, timeout_secs: u64 },

    #[error("Invalid action arguments: {0}")]
    InvalidArguments(String),
}

/// Session-level failures.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    /// Internal invariant violation, e.g. the cascade did not reach a fixed
    /// point. The session must be discarded.
    #[error("Unreachable state: {0}")]
    UnreachableState(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session closed: {0}")]
    SessionClosed(String),

    #[error("Unknown flow: {0}")]
    UnknownFlow(String),

    #[error("Invalid flow definitions: {0}")]
    Definition(String),
}

impl RuntimeError {
    /// Whether the session that produced this error must be discarded.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RuntimeError::UnreachableState(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_conflict_displays_both_values() {
        let err = Error::Flow(FlowError::BindingConflict {
            name: "user".into(),
            existing: Value::from("ann"),
            incoming: Value::from("bob"),
        });
        let text = err.to_string();
        assert!(text.contains("$user"));
        assert!(text.contains("ann"));
        assert!(text.contains("bob"));
    }

    #[test]
    fn only_unreachable_state_is_fatal() {
        assert!(RuntimeError::UnreachableState("loop".into()).is_fatal());
        assert!(!RuntimeError::SessionNotFound("x".into()).is_fatal());
        assert!(!RuntimeError::UnknownFlow("x".into()).is_fatal());
    }

    #[test]
    fn action_error_displays_correctly() {
        let err = Error::Action(ActionError::Timeout {
            action: "generate".into(),
            timeout_secs: 30,
        });
        assert!(err.to_string().contains("generate"));
        assert!(err.to_string().contains("30s"));
    }
}
