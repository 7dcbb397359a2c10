//! Coalescing work queue keyed by object identity.
//!
//! A key is queued at most once. A key re-added while a worker holds it is
//! marked dirty and requeued on `done`, so one key is never reconciled by two
//! workers at once and a burst of events collapses into one reconcile.

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tracing::warn;

struct State<K> {
    order: VecDeque<K>,
    queued: FxHashSet<K>,
    processing: FxHashSet<K>,
    dirty: FxHashSet<K>,
    failures: FxHashMap<K, u32>,
    dropped: u64,
    shutdown: bool,
}

pub struct WorkQueue<K> {
    name: &'static str,
    state: Mutex<State<K>>,
    notify: Notify,
    cap: usize,
    base: Duration,
    max: Duration,
}

impl<K: Clone + Eq + Hash + std::fmt::Debug + Send + Sync + 'static> WorkQueue<K> {
    pub fn new(name: &'static str, cap: usize, base: Duration, max: Duration) -> Self {
        Self {
            name,
            state: Mutex::new(State {
                order: VecDeque::new(),
                queued: FxHashSet::default(),
                processing: FxHashSet::default(),
                dirty: FxHashSet::default(),
                failures: FxHashMap::default(),
                dropped: 0,
                shutdown: false,
            }),
            notify: Notify::new(),
            cap: cap.max(1),
            base,
            max,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        match self.state.lock() {
            Ok(g) => g,
            Err(p) => p.into_inner(),
        }
    }

    pub fn add(&self, key: K) {
        let mut st = self.lock();
        if st.shutdown || st.queued.contains(&key) {
            return;
        }
        if st.processing.contains(&key) {
            st.dirty.insert(key);
            return;
        }
        if st.order.len() >= self.cap {
            if let Some(old) = st.order.pop_front() {
                st.queued.remove(&old);
                st.dropped += 1;
                counter!("porch_queue_dropped_total", 1u64, "queue" => self.name);
                warn!(queue = self.name, key = ?old, "work queue full; dropped oldest key");
            }
        }
        st.queued.insert(key.clone());
        st.order.push_back(key);
        drop(st);
        self.notify.notify_one();
    }

    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let me = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            me.add(key);
        });
    }

    /// Requeue with per-key exponential backoff. Returns the delay used.
    pub fn add_rate_limited(self: &Arc<Self>, key: K) -> Duration {
        let attempts = {
            let mut st = self.lock();
            let n = st.failures.entry(key.clone()).or_insert(0);
            *n = n.saturating_add(1);
            *n
        };
        let factor = 1u32.checked_shl(attempts.saturating_sub(1).min(20)).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.add_after(key, delay);
        delay
    }

    /// Clear the backoff history of `key`.
    pub fn forget(&self, key: &K) { self.lock().failures.remove(key); }

    pub fn failures(&self, key: &K) -> u32 { self.lock().failures.get(key).copied().unwrap_or(0) }

    /// Next key to process; `None` once shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            {
                let mut st = self.lock();
                if st.shutdown {
                    return None;
                }
                if let Some(key) = st.order.pop_front() {
                    st.queued.remove(&key);
                    st.processing.insert(key.clone());
                    let more = !st.order.is_empty();
                    drop(st);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Non-blocking `get`.
    pub fn try_get(&self) -> Option<K> {
        let mut st = self.lock();
        if st.shutdown {
            return None;
        }
        let key = st.order.pop_front()?;
        st.queued.remove(&key);
        st.processing.insert(key.clone());
        Some(key)
    }

    /// Release a key taken with `get`; a dirty key goes back on the queue.
    pub fn done(&self, key: &K) {
        let requeue = {
            let mut st = self.lock();
            st.processing.remove(key);
            st.dirty.remove(key)
        };
        if requeue {
            self.add(key.clone());
        }
    }

    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool { self.lock().shutdown }

    pub fn len(&self) -> usize { self.lock().order.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Nothing queued and nothing in flight.
    pub fn is_idle(&self) -> bool {
        let st = self.lock();
        st.order.is_empty() && st.processing.is_empty()
    }

    pub fn dropped(&self) -> u64 { self.lock().dropped }
}
