//! Error types for the fleet-script crate.

use fleet_core::{ErrorKind, FleetError};
use fleet_scheduler::SchedulerError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ScriptError {
    /// Bad input rejected before any state changed.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Script not found: {id}")]
    ScriptNotFound { id: Uuid },

    #[error("Host not found: {id}")]
    HostNotFound { id: Uuid },

    #[error("Script record not found: {id}")]
    RecordNotFound { id: Uuid },

    /// `stop` was called for a run that is not (or no longer) in flight.
    #[error("No running script with record id {id}")]
    RunNotFound { id: Uuid },

    /// Could not open a connection to the target.
    #[error("Connection to {target} failed: {reason}")]
    Connect { target: String, reason: String },

    /// The script ran but failed on the target, or the transport broke mid-run.
    #[error("Execution on {target} failed: {reason}")]
    Execution { target: String, reason: String },

    #[error("Run cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] FleetError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl ScriptError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScriptError::Validation(_) => ErrorKind::Validation,
            ScriptError::ScriptNotFound { .. }
            | ScriptError::HostNotFound { .. }
            | ScriptError::RecordNotFound { .. }
            | ScriptError::RunNotFound { .. } => ErrorKind::NotFound,
            ScriptError::Connect { .. } | ScriptError::Execution { .. } | ScriptError::Io(_) => {
                ErrorKind::TransientIo
            }
            ScriptError::Core(e) => e.kind(),
            ScriptError::Scheduler(e) => e.kind(),
            ScriptError::Cancelled
            | ScriptError::Database(_)
            | ScriptError::Serialization(_) => ErrorKind::Internal,
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind().code()
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, ScriptError>;
