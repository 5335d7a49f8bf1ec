//! Error types for irintai-engine

use std::time::Duration;

use thiserror::Error;

use crate::registry::ModelStatus;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the supervisor, installer and exchange channel.
///
/// The `Display` form of each variant is the human-readable message handed
/// back to callers alongside the failure.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine executable not found. Is it installed and in PATH?")]
    ExecutableNotFound,

    #[error("Failed to spawn engine process: {0}")]
    SpawnFailure(#[source] std::io::Error),

    #[error("A model is already running: {0}. Stop it first.")]
    AlreadyRunning(String),

    #[error("Model is not running. Please start a model first.")]
    NotRunning,

    #[error("Model {0} needs to be installed first")]
    ModelNotInstalled(String),

    #[error("Engine process exited unexpectedly: code {code:?}")]
    ProcessExitedUnexpectedly { code: Option<i32> },

    #[error("Connection to model process lost: {0}")]
    BrokenConnection(#[source] std::io::Error),

    #[error("Timed out after {elapsed:?} waiting for a response")]
    Timeout { elapsed: Duration, partial: String },

    #[error("Failed to {action} {model}: {reason}")]
    InstallFailure {
        action: &'static str,
        model: String,
        reason: String,
    },

    #[error("Failed to list models after {attempts} attempts: {reason}")]
    ListFailure { attempts: u32, reason: String },

    #[error("Invalid status transition for {model} from {from} to {to}")]
    InvalidTransition {
        model: String,
        from: ModelStatus,
        to: ModelStatus,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Map a spawn error, separating a missing binary from other OS failures.
    pub(crate) fn from_spawn(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            EngineError::ExecutableNotFound
        } else {
            EngineError::SpawnFailure(err)
        }
    }

    /// Partial response accumulated before a timeout, if any.
    pub fn partial_response(&self) -> Option<&str> {
        match self {
            EngineError::Timeout { partial, .. } => Some(partial),
            _ => None,
        }
    }
}
