use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::error::{BusError, Result};
use crate::locks::NamedLocks;
use crate::types::{Event, HandlerFailure, PublishReport, Subscriber, SubscriptionId};

struct Subscription<E> {
    id: SubscriptionId,
    name: String,
    handler: Arc<dyn Subscriber<E>>,
}

impl<E> Clone for Subscription<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: self.name.clone(),
            handler: Arc::clone(&self.handler),
        }
    }
}

/// Topic-based publish/subscribe for one event type.
///
/// Share it as `Arc<EventBus<E>>`. A handler that errors or panics is logged
/// and reported through the optional failure sink; it never takes down the
/// publisher or the other handlers.
pub struct EventBus<E: Event> {
    topics: RwLock<HashMap<E::Topic, Vec<Subscription<E>>>>,
    next_id: AtomicU64,
    locks: Arc<NamedLocks>,
    failures: Option<mpsc::UnboundedSender<HandlerFailure<E::Topic>>>,
}

impl<E: Event> EventBus<E> {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            locks: Arc::new(NamedLocks::new()),
            failures: None,
        }
    }

    /// Use an existing lock set instead of a private one.
    pub fn with_locks(mut self, locks: Arc<NamedLocks>) -> Self {
        self.locks = locks;
        self
    }

    /// Forward every handler failure to `sink` in addition to logging it.
    pub fn with_failure_sink(mut self, sink: mpsc::UnboundedSender<HandlerFailure<E::Topic>>) -> Self {
        self.failures = Some(sink);
        self
    }

    pub fn subscribe<H>(&self, topic: E::Topic, name: impl Into<String>, handler: H) -> SubscriptionId
    where
        H: Subscriber<E> + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let name = name.into();
        debug!(?topic, subscriber = %name, %id, "subscribed");

        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        topics.entry(topic).or_default().push(Subscription {
            id,
            name,
            handler: Arc::new(handler),
        });
        id
    }

    pub fn unsubscribe(&self, topic: E::Topic, id: SubscriptionId) -> Result<()> {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        let subs = topics.get_mut(&topic);
        let Some(subs) = subs else {
            return Err(BusError::NotSubscribed {
                topic: format!("{topic:?}"),
                id: id.0,
            });
        };

        let before = subs.len();
        subs.retain(|s| s.id != id);
        if subs.len() == before {
            return Err(BusError::NotSubscribed {
                topic: format!("{topic:?}"),
                id: id.0,
            });
        }
        if subs.is_empty() {
            topics.remove(&topic);
        }
        debug!(?topic, %id, "unsubscribed");
        Ok(())
    }

    /// Deliver `event` to every handler subscribed to its topic at the time of
    /// the call.
    ///
    /// The subscriber list is snapshotted first, so a handler may subscribe or
    /// unsubscribe without deadlocking the bus.
    pub fn publish(&self, event: &E) -> PublishReport {
        let topic = event.topic();
        let subs: Vec<Subscription<E>> = {
            let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
            topics.get(&topic).cloned().unwrap_or_default()
        };

        let mut report = PublishReport::default();
        for sub in subs {
            let t = Instant::now();
            let outcome = catch_unwind(AssertUnwindSafe(|| sub.handler.handle(event)));
            let elapsed_ms = t.elapsed().as_millis() as u64;

            let reason = match outcome {
                Ok(Ok(())) => {
                    report.delivered += 1;
                    debug!(?topic, subscriber = %sub.name, duration_ms = elapsed_ms, "event delivered");
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(panic) => format!("handler panicked: {}", panic_message(panic.as_ref())),
            };

            report.failed += 1;
            error!(?topic, subscriber = %sub.name, %reason, "event handler failed");
            if let Some(sink) = &self.failures {
                // A closed sink only means nobody is watching anymore.
                let _ = sink.send(HandlerFailure {
                    topic,
                    subscription: sub.id,
                    subscriber: sub.name.clone(),
                    reason,
                });
            }
        }
        report
    }

    pub fn subscriber_count(&self, topic: E::Topic) -> usize {
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        topics.get(&topic).map_or(0, Vec::len)
    }

    pub fn try_lock(&self, key: &str) -> Result<()> {
        self.locks.try_lock(key)
    }

    pub fn unlock(&self, key: &str) {
        self.locks.unlock(key)
    }

    /// The lock set, for components that need RAII guards.
    pub fn locks(&self) -> &Arc<NamedLocks> {
        &self.locks
    }
}

impl<E: Event> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HandlerResult;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Topic {
        Ping,
        Pong,
    }

    #[derive(Debug, Clone)]
    enum Msg {
        Ping(u32),
        Pong,
    }

    impl Event for Msg {
        type Topic = Topic;
        fn topic(&self) -> Topic {
            match self {
                Msg::Ping(_) => Topic::Ping,
                Msg::Pong => Topic::Pong,
            }
        }
    }

    fn counter(hits: &Arc<AtomicUsize>) -> impl Fn(&Msg) -> HandlerResult + Send + Sync + 'static {
        let hits = Arc::clone(hits);
        move |_msg: &Msg| -> HandlerResult {
            hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn publish_reaches_only_its_topic() {
        let bus = EventBus::<Msg>::new();
        let pings = Arc::new(AtomicUsize::new(0));
        let pongs = Arc::new(AtomicUsize::new(0));
        bus.subscribe(Topic::Ping, "ping-a", counter(&pings));
        bus.subscribe(Topic::Ping, "ping-b", counter(&pings));
        bus.subscribe(Topic::Pong, "pong", counter(&pongs));

        let report = bus.publish(&Msg::Ping(1));
        assert_eq!(report, PublishReport { delivered: 2, failed: 0 });
        assert_eq!(pings.load(Ordering::SeqCst), 2);
        assert_eq!(pongs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsubscribe_unknown_id_fails() {
        let bus = EventBus::<Msg>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let id = bus.subscribe(Topic::Ping, "ping", counter(&hits));

        bus.unsubscribe(Topic::Ping, id).unwrap();
        assert_eq!(bus.subscriber_count(Topic::Ping), 0);
        assert!(matches!(
            bus.unsubscribe(Topic::Ping, id),
            Err(BusError::NotSubscribed { .. })
        ));
        assert!(matches!(
            bus.unsubscribe(Topic::Pong, SubscriptionId(99)),
            Err(BusError::NotSubscribed { .. })
        ));

        bus.publish(&Msg::Ping(2));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failing_and_panicking_handlers_are_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let bus = EventBus::<Msg>::new().with_failure_sink(tx);
        let hits = Arc::new(AtomicUsize::new(0));

        bus.subscribe(Topic::Ping, "erroring", |_m: &Msg| -> HandlerResult {
            Err("bad payload".into())
        });
        bus.subscribe(Topic::Ping, "panicking", |m: &Msg| -> HandlerResult {
            if let Msg::Ping(n) = m {
                panic!("cannot handle {n}");
            }
            Ok(())
        });
        bus.subscribe(Topic::Ping, "healthy", counter(&hits));

        let report = bus.publish(&Msg::Ping(7));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 2);
        assert!(!report.is_clean());
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.subscriber, "erroring");
        assert_eq!(first.reason, "bad payload");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.topic, Topic::Ping);
        assert!(second.reason.contains("cannot handle 7"));
    }

    #[test]
    fn handler_may_unsubscribe_itself() {
        let bus = Arc::new(EventBus::<Msg>::new());
        let slot: Arc<std::sync::Mutex<Option<SubscriptionId>>> = Arc::default();

        let bus2 = Arc::clone(&bus);
        let slot2 = Arc::clone(&slot);
        let id = bus.subscribe(Topic::Pong, "once", move |_m: &Msg| -> HandlerResult {
            if let Some(id) = slot2.lock().unwrap().take() {
                bus2.unsubscribe(Topic::Pong, id)?;
            }
            Ok(())
        });
        *slot.lock().unwrap() = Some(id);

        assert_eq!(bus.publish(&Msg::Pong).delivered, 1);
        assert_eq!(bus.publish(&Msg::Pong).delivered, 0);
    }

    #[test]
    fn bus_locks_share_the_injected_set() {
        let locks = Arc::new(NamedLocks::new());
        let bus = EventBus::<Msg>::new().with_locks(Arc::clone(&locks));
        bus.try_lock("k").unwrap();
        assert!(locks.is_locked("k"));
        assert!(bus.try_lock("k").is_err());
        bus.unlock("k");
        bus.unlock("k");
        assert!(!locks.is_locked("k"));
    }
}
