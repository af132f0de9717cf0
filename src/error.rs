//! Error types for warden operations.
//!
//! This module provides a unified error type [`WardenError`] for everything
//! the warden does, along with a convenient [`Result`] type alias.
//!
//! The taxonomy separates the three outcomes callers must distinguish by
//! policy rather than by inspecting engine error codes:
//!
//! - **Not present**: an expected "does not exist yet" answer from the
//!   administrative endpoint. Control flow, not a fault.
//! - **Transient faults**: retried by the bounded retry helper
//!   ([`crate::admin::retry`]) or by agent failover.
//! - **Fatal faults**: fail the current lifecycle phase and feed the
//!   escalation counter; structural failures escalate immediately.

use std::io;
use thiserror::Error;

/// Main error type for warden operations.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Expected absence: the queried domain or database does not exist yet.
    #[error("Not present: {0}")]
    NotPresent(String),

    /// The connection to an administrative agent was lost mid-call.
    /// Triggers agent failover, not counted against the retry budget.
    #[error("Lost connection to agent: {0}")]
    LostConnection(String),

    /// Transient engine error from the retryable whitelist.
    #[error("Transient engine error: {0}")]
    Transient(String),

    /// A lifecycle phase exceeded its deadline.
    #[error("Phase '{phase}' timed out after {elapsed_ms}ms")]
    PhaseTimeout { phase: String, elapsed_ms: u64 },

    /// A single remote call exceeded its timeout.
    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    /// A long-running operation was reported obsolete: a conflicting
    /// operation is already in flight elsewhere. Fatal to this attempt.
    #[error("Operation obsolete: {0}")]
    Obsolete(String),

    /// A long-running operation ended in the failed state.
    #[error("Operation failed: {0}")]
    OperationFailed(String),

    /// More than half of the agents deny that the domain or database exists.
    #[error("Majority disagreement: {negative} of {total} agents answered negative")]
    MajorityDisagree { negative: usize, total: usize },

    /// Non-retryable structural failure (domain/database creation, start,
    /// upgrade). Escalates to a full wipe without the quiet-retry grace.
    #[error("Structural failure: {0}")]
    Structural(String),

    /// A blocking wait was interrupted by `health_check` or shutdown.
    /// Not a fault: the current wait re-checks its loop conditions.
    #[error("Interrupted while waiting")]
    Interrupted,

    /// The lifecycle control task exited unexpectedly. Fatal to the
    /// hosting process.
    #[error("Lifecycle control task died unexpectedly")]
    ControlTaskDead,

    /// Waiting for the machine to reach a phase exceeded the caller's budget.
    #[error("Timed out waiting for phase {0}")]
    PhaseWaitTimeout(String),

    #[error("Schema migration error: {0}")]
    Migration(String),

    #[error("Node not found: {0}")]
    NodeNotFound(u64),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WardenError {
    /// Whether the bounded retry helper should retry this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, WardenError::Transient(_) | WardenError::Timeout(_))
    }

    /// Whether this error should trigger failover to another agent
    /// instead of consuming the phase's retry budget.
    pub fn triggers_failover(&self) -> bool {
        matches!(self, WardenError::LostConnection(_))
    }

    /// Whether this failure pre-sets the escalation counter to its
    /// threshold, forcing an immediate full wipe.
    pub fn is_structural(&self) -> bool {
        matches!(self, WardenError::Structural(_) | WardenError::Obsolete(_))
    }

    /// Whether this is the expected "does not exist yet" answer.
    pub fn is_not_present(&self) -> bool {
        matches!(self, WardenError::NotPresent(_))
    }
}

impl From<serde_json::Error> for WardenError {
    fn from(e: serde_json::Error) -> Self {
        WardenError::Serialization(e.to_string())
    }
}

/// Result type alias for warden operations.
pub type Result<T> = std::result::Result<T, WardenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(WardenError::Transient("temporary".into()).is_retryable());
        assert!(WardenError::Timeout(100).is_retryable());
        assert!(!WardenError::Structural("create failed".into()).is_retryable());
        assert!(!WardenError::NotPresent("domain".into()).is_retryable());
    }

    #[test]
    fn test_failover_classification() {
        assert!(WardenError::LostConnection("agent 2".into()).triggers_failover());
        assert!(!WardenError::Transient("temporary".into()).triggers_failover());
    }

    #[test]
    fn test_structural_classification() {
        assert!(WardenError::Structural("create failed".into()).is_structural());
        assert!(WardenError::Obsolete("conflicting op".into()).is_structural());
        assert!(!WardenError::Timeout(100).is_structural());
    }
}
