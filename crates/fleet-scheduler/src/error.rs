use fleet_core::{ErrorKind, FleetError};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Input rejected before any state changed.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    /// A fresh task from the executor refused the schedule's parameters.
    #[error("Invalid parameters for executor '{executor}': {reason}")]
    InvalidParams { executor: String, reason: String },

    #[error("Executor not found: {name}")]
    ExecutorNotFound { name: String },

    #[error("Executor already registered: {name}")]
    ExecutorExists { name: String },

    #[error("Schedule not found: {id}")]
    ScheduleNotFound { id: Uuid },

    #[error("Record not found: {id}")]
    RecordNotFound { id: Uuid },

    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] FleetError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::Validation(_)
            | SchedulerError::InvalidCron { .. }
            | SchedulerError::InvalidParams { .. } => ErrorKind::Validation,
            SchedulerError::ExecutorNotFound { .. }
            | SchedulerError::ScheduleNotFound { .. }
            | SchedulerError::RecordNotFound { .. } => ErrorKind::NotFound,
            SchedulerError::ExecutorExists { .. } => ErrorKind::AlreadyExists,
            SchedulerError::Core(e) => e.kind(),
            SchedulerError::Database(_)
            | SchedulerError::Serialization(_)
            | SchedulerError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind().code()
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
