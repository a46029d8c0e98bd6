use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;

struct Cached<T> {
    value: Arc<T>,
    loaded_at: Instant,
}

/// A single expiring value shared between readers.
///
/// The stored value is never mutated; `replace` swaps in a new `Arc` so a
/// reader holding the previous one keeps a consistent view.
pub struct ResourceCache<T> {
    ttl: Duration,
    current: RwLock<Option<Cached<T>>>,
}

impl<T> ResourceCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            current: RwLock::new(None),
        }
    }

    /// The cached value regardless of age.
    pub fn get(&self) -> Option<Arc<T>> {
        let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
        current.as_ref().map(|cached| Arc::clone(&cached.value))
    }

    /// The cached value if it is younger than the TTL.
    pub fn fresh(&self) -> Option<Arc<T>> {
        let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
        current
            .as_ref()
            .filter(|cached| cached.loaded_at.elapsed() < self.ttl)
            .map(|cached| Arc::clone(&cached.value))
    }

    /// True when empty or older than the TTL.
    pub fn is_stale(&self) -> bool {
        self.fresh().is_none()
    }

    pub fn replace(&self, value: T) -> Arc<T> {
        let value = Arc::new(value);
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *current = Some(Cached {
            value: Arc::clone(&value),
            loaded_at: Instant::now(),
        });
        value
    }
}
