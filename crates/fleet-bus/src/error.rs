use fleet_core::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    /// `unsubscribe` was called with an id that is not registered on the topic.
    #[error("Subscription {id} not found on topic {topic}")]
    NotSubscribed { topic: String, id: u64 },

    /// The named lock is currently held by someone else.
    #[error("Lock already held: {key}")]
    AlreadyLocked { key: String },
}

impl BusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BusError::NotSubscribed { .. } => ErrorKind::NotFound,
            BusError::AlreadyLocked { .. } => ErrorKind::LockContention,
        }
    }
}

pub type Result<T> = std::result::Result<T, BusError>;
