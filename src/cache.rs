use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::Instant;

/// Set of keys with per-entry absolute expiry.
///
/// Every entry arms a timer task on the runtime that reaps it at its
/// deadline. `exists` additionally checks the stored deadline, so an expired
/// entry is never reported present even if its timer has not fired yet.
pub struct TimedCache<K> {
    inner: Arc<Inner<K>>,
}

struct Inner<K> {
    entries: Mutex<HashMap<K, Entry>>,
}

struct Entry {
    deadline: Instant,
    timer: AbortHandle,
}

impl<K> TimedCache<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Record `key` for `ttl` from now.
    ///
    /// Re-adding an existing key extends its deadline to the later of the
    /// old and new ones and re-arms the timer.
    pub fn add(&self, key: K, ttl: Duration) {
        let deadline = Instant::now() + ttl;
        let mut entries = self.entries();

        if let Some(entry) = entries.get_mut(&key) {
            if deadline <= entry.deadline {
                return;
            }
            entry.timer.abort();
            entry.deadline = deadline;
            entry.timer = self.arm(key, deadline);
            return;
        }

        let timer = self.arm(key.clone(), deadline);
        entries.insert(key, Entry { deadline, timer });
    }

    /// Whether `key` is present and not expired.
    pub fn exists<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries()
            .get(key)
            .is_some_and(|entry| entry.deadline > Instant::now())
    }

    /// Delete `key` immediately, cancelling its pending timer.
    pub fn remove<Q>(&self, key: &Q)
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        if let Some(entry) = self.entries().remove(key) {
            entry.timer.abort();
        }
    }

    /// Drop all entries and cancel every pending timer.
    pub fn stop(&self) {
        for (_, entry) in self.entries().drain() {
            entry.timer.abort();
        }
    }

    fn arm(&self, key: K, deadline: Instant) -> AbortHandle {
        let inner: Weak<Inner<K>> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut entries = lock(&inner.entries);
            // A later `add` may have replaced the timer; only reap the entry
            // this timer was armed for.
            if entries
                .get(&key)
                .is_some_and(|entry| entry.deadline == deadline)
            {
                entries.remove(&key);
            }
        });
        task.abort_handle()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<K, Entry>> {
        lock(&self.inner.entries)
    }
}

impl<K> Drop for TimedCache<K> {
    fn drop(&mut self) {
        for (_, entry) in lock(&self.inner.entries).drain() {
            entry.timer.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("cache mutex poisoned")
}
