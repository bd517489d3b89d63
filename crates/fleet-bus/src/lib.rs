//! `fleet-bus`: in-process publish/subscribe with typed topics, plus the
//! process-wide named locks used to keep one run per schedule.
//!
//! The bus is generic over an [`Event`] type. Each event names its own topic,
//! and subscribers are kept in one list per topic, so there is no runtime
//! dispatch on handler shape.

pub mod bus;
pub mod error;
pub mod locks;
pub mod types;

pub use bus::EventBus;
pub use error::{BusError, Result};
pub use locks::{LockGuard, NamedLocks};
pub use types::{Event, HandlerFailure, HandlerResult, PublishReport, Subscriber, SubscriptionId};
