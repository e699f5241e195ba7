//! Error types shared across the engine.
//!
//! Collaborator failures are kept distinct from "no data yet": a contract
//! that has nothing to report returns an empty map, never an error.

use std::time::Duration;

use thiserror::Error;

/// Failure reported by a Cluster Executor contract.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    /// The collaborator could not be reached.
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
    /// The call did not return within the configured bound.
    #[error("collaborator call timed out after {0:?}")]
    Timeout(Duration),
    /// The collaborator answered but refused the request.
    #[error("collaborator rejected request: {0}")]
    Rejected(String),
    /// The collaborator answered with something we could not interpret.
    #[error("malformed collaborator response: {0}")]
    Malformed(String),
}

/// Failure reading or writing persisted monitor state.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("state (de)serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("unsupported state version {found} (supported: {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },
}

/// Failure delivering a notification.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NotifyError {
    #[error("notification channel closed")]
    ChannelClosed,
    #[error("notification rejected: {0}")]
    Rejected(String),
}

/// Failure loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failure of the orchestration workflow itself, as opposed to a failed
/// evaluation (which is reported through `WorkflowOutcome`).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("no handler registered for stage `{0}`")]
    MissingStage(String),
}
