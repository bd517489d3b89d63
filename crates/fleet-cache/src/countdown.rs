use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

struct CacheItem<V> {
    value: V,
    /// Bumped on every set/get; a timer only evicts the generation it was armed for.
    generation: u64,
    expiration: JoinHandle<()>,
}

struct Inner<V> {
    items: Mutex<HashMap<String, CacheItem<V>>>,
    ttl: Duration,
    generation: AtomicU64,
}

impl<V> Inner<V> {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, CacheItem<V>>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed)
    }

    fn expire(&self, key: &str, generation: u64) {
        let mut items = self.lock();
        if items.get(key).is_some_and(|item| item.generation == generation) {
            items.remove(key);
            debug!(key, "cache entry expired");
        }
    }
}

impl<V> Drop for Inner<V> {
    fn drop(&mut self) {
        let items = self.items.get_mut().unwrap_or_else(PoisonError::into_inner);
        for item in items.values() {
            item.expiration.abort();
        }
    }
}

/// Keyed cache whose entries expire `ttl` after they were last written or read.
///
/// Cloning is cheap and every clone sees the same entries. Each entry owns one
/// Tokio timer task, so the cache must be used from inside a Tokio runtime.
/// Timers keep only a weak reference, so dropping the last clone cancels them.
pub struct CountdownCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for CountdownCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> CountdownCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                items: Mutex::new(HashMap::new()),
                ttl,
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    fn arm(&self, key: &str, generation: u64) -> JoinHandle<()> {
        let weak: Weak<Inner<V>> = Arc::downgrade(&self.inner);
        let ttl = self.inner.ttl;
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire(&key, generation);
            }
        })
    }

    /// Insert or replace `key`, restarting its countdown.
    pub fn set(&self, key: &str, value: V) {
        let generation = self.inner.next_generation();
        let mut items = self.inner.lock();
        let expiration = self.arm(key, generation);
        let old = items.insert(
            key.to_string(),
            CacheItem {
                value,
                generation,
                expiration,
            },
        );
        if let Some(old) = old {
            old.expiration.abort();
        }
    }

    /// Return a clone of the value and restart its countdown.
    pub fn get(&self, key: &str) -> Option<V> {
        let generation = self.inner.next_generation();
        let mut items = self.inner.lock();
        let item = items.get_mut(key)?;
        item.expiration.abort();
        item.generation = generation;
        item.expiration = self.arm(key, generation);
        Some(item.value.clone())
    }

    /// Remove `key`, returning its value if it was present.
    pub fn delete(&self, key: &str) -> Option<V> {
        let item = self.inner.lock().remove(key)?;
        item.expiration.abort();
        Some(item.value)
    }

    /// Presence check that leaves the countdown untouched.
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Return the cached value for `key`, or build it with `init` and cache it.
    ///
    /// The lock is not held while `init` runs. Two concurrent misses on the same
    /// key may both run `init`; the later `set` wins.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: &str, init: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let value = init().await?;
        self.set(key, value.clone());
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    const TTL: Duration = Duration::from_millis(100);

    #[tokio::test(start_paused = true)]
    async fn set_then_get_hits() {
        let cache = CountdownCache::new(TTL);
        cache.set("a", 1);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn read_slides_the_deadline() {
        let cache = CountdownCache::new(TTL);
        cache.set("conn", "handle");

        sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get("conn"), Some("handle"));

        // 120ms after set, 60ms after the read.
        sleep(Duration::from_millis(60)).await;
        assert!(cache.contains_key("conn"));

        // Past the restarted deadline (60 + 100).
        sleep(Duration::from_millis(50)).await;
        assert!(!cache.contains_key("conn"));
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn untouched_entry_expires_after_ttl() {
        let cache = CountdownCache::new(TTL);
        cache.set("a", 1);
        sleep(TTL + Duration::from_millis(10)).await;
        assert_eq!(cache.get("a"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn replace_cancels_previous_timer() {
        let cache = CountdownCache::new(TTL);
        cache.set("a", 1);
        sleep(Duration::from_millis(80)).await;
        cache.set("a", 2);

        // The first timer would have fired at 100ms.
        sleep(Duration::from_millis(40)).await;
        assert!(cache.contains_key("a"));

        sleep(Duration::from_millis(50)).await;
        assert!(!cache.contains_key("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn delete_removes_entry() {
        let cache = CountdownCache::new(TTL);
        cache.set("a", 1);
        assert_eq!(cache.delete("a"), Some(1));
        assert_eq!(cache.delete("a"), None);
        assert!(!cache.contains_key("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn get_or_try_insert_with_reuses_cached_value() {
        let cache = CountdownCache::new(TTL);
        let built = Arc::new(AtomicU64::new(0));

        for _ in 0..3 {
            let built = Arc::clone(&built);
            let v: Result<u64, String> = cache
                .get_or_try_insert_with("k", || async move {
                    Ok(built.fetch_add(1, Ordering::SeqCst) + 10)
                })
                .await;
            assert_eq!(v.unwrap(), 10);
        }
        assert_eq!(built.load(Ordering::SeqCst), 1);

        let err: Result<u64, String> = cache
            .get_or_try_insert_with("other", || async { Err("unreachable host".to_string()) })
            .await;
        assert!(err.is_err());
        assert!(!cache.contains_key("other"));
    }

    #[tokio::test(start_paused = true)]
    async fn timers_do_not_keep_cache_alive() {
        let probe = Arc::new(());
        let cache = CountdownCache::new(TTL);
        cache.set("a", Arc::clone(&probe));
        drop(cache);
        assert_eq!(Arc::strong_count(&probe), 1);
    }
}
