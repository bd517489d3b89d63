use fleet_core::ErrorKind;
use fleet_scheduler::SchedulerError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HealthError {
    /// The target answered, but not the way the probe expects.
    #[error("{target} is unhealthy: {reason}")]
    Unhealthy { target: String, reason: String },

    #[error("{target} did not answer within {secs}s")]
    Timeout { target: String, secs: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl HealthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HealthError::Unhealthy { .. }
            | HealthError::Timeout { .. }
            | HealthError::Http(_)
            | HealthError::Io(_) => ErrorKind::TransientIo,
            HealthError::Scheduler(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HealthError>;
