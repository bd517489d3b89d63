use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Coarse error category shared by every crate.
///
/// Crate-local error enums expose `kind()` so callers (and the API layer that
/// sits on top of this workspace) can decide how to surface a failure without
/// matching on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input rejected before any state changed.
    Validation,
    /// Unknown schedule, record, host, script or executor.
    NotFound,
    /// Duplicate registration (e.g. an executor name).
    AlreadyExists,
    /// A trigger was dropped because the previous run still holds the lock.
    LockContention,
    /// Remote side unreachable or failed mid-flight.
    TransientIo,
    /// Storage, serialization or anything else unexpected.
    Internal,
}

impl ErrorKind {
    /// Stable code string for clients.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::AlreadyExists => "ALREADY_EXISTS",
            ErrorKind::LockContention => "LOCK_CONTENTION",
            ErrorKind::TransientIo => "TRANSIENT_IO_ERROR",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FleetError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FleetError::Config(_) => ErrorKind::Validation,
            FleetError::Database(_)
            | FleetError::Serialization(_)
            | FleetError::Io(_)
            | FleetError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Short error code string, see [`ErrorKind::code`].
    pub fn code(&self) -> &'static str {
        self.kind().code()
    }
}

pub type Result<T> = std::result::Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ErrorKind::Validation.code(), "VALIDATION_ERROR");
        assert_eq!(ErrorKind::LockContention.to_string(), "LOCK_CONTENTION");
        assert_eq!(
            FleetError::Config("missing".into()).code(),
            "VALIDATION_ERROR"
        );
    }
}
