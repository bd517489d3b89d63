use std::fmt;
use std::hash::Hash;

/// A value that can travel over an [`EventBus`](crate::EventBus).
///
/// The topic is derived from the event itself, so publishing an event to the
/// wrong topic is impossible.
pub trait Event: Clone + Send + Sync + 'static {
    type Topic: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    fn topic(&self) -> Self::Topic;
}

/// What a subscriber returns. An `Err` is logged and reported, never re-raised.
pub type HandlerResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Synchronous subscriber.
///
/// Handlers run on the publisher's task, in subscription order. Anything slow
/// should be spawned by the handler itself.
pub trait Subscriber<E>: Send + Sync {
    fn handle(&self, event: &E) -> HandlerResult;
}

impl<E, F> Subscriber<E> for F
where
    F: Fn(&E) -> HandlerResult + Send + Sync,
{
    fn handle(&self, event: &E) -> HandlerResult {
        self(event)
    }
}

/// Returned by `subscribe`; needed to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A failed or panicked delivery, sent to the bus's failure sink if one is set.
#[derive(Debug, Clone)]
pub struct HandlerFailure<T> {
    pub topic: T,
    pub subscription: SubscriptionId,
    /// Name the subscriber was registered with.
    pub subscriber: String,
    pub reason: String,
}

/// Outcome of a single `publish` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Subscribers that returned `Ok`.
    pub delivered: usize,
    /// Subscribers that returned `Err` or panicked.
    pub failed: usize,
}

impl PublishReport {
    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}
