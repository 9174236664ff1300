//! Labeler work queue.
//!
//! A deduplicating queue of keys with the single-flight guarantee: a key handed
//! out by [`WorkQueue::get`] is never handed out again until [`WorkQueue::done`]
//! is called for it. Adds that arrive while the key is being processed are
//! coalesced into one re-add on `done`.
//!
//! Delayed keys sit in a min-heap; due keys are promoted by `get` itself, so the
//! queue needs no timer task of its own.

#![forbid(unsafe_code)]

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use metrics::{counter, gauge};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

mod backoff;

pub use backoff::ExponentialBackoff;

/// Bounds shared by every work queue key.
pub trait QueueKey: Clone + Eq + Hash + Ord + Debug + Send + 'static {}
impl<T: Clone + Eq + Hash + Ord + Debug + Send + 'static> QueueKey for T {}

struct State<K> {
    pending: VecDeque<K>,
    queued: FxHashSet<K>,
    processing: FxHashSet<K>,
    dirty: FxHashSet<K>,
    delayed: FxHashMap<K, Instant>,
    timers: BinaryHeap<Reverse<(Instant, u64, K)>>,
    seq: u64,
    backoff: ExponentialBackoff<K>,
    shutting_down: bool,
}

impl<K: QueueKey> State<K> {
    /// Returns true when the key landed in `pending`.
    fn push(&mut self, key: K) -> bool {
        if self.shutting_down || self.queued.contains(&key) || self.dirty.contains(&key) {
            return false;
        }
        if self.processing.contains(&key) {
            trace!(?key, "add while processing; marked dirty");
            self.dirty.insert(key);
            return false;
        }
        if self.delayed.contains_key(&key) {
            return false;
        }
        self.queued.insert(key.clone());
        self.pending.push_back(key);
        counter!("labeler_workqueue_adds_total", 1u64);
        gauge!("labeler_workqueue_depth", self.pending.len() as f64);
        true
    }

    fn promote_due(&mut self, now: Instant) -> usize {
        let mut promoted = 0;
        while let Some(Reverse((deadline, _, _))) = self.timers.peek() {
            if *deadline > now {
                break;
            }
            let Some(Reverse((deadline, _, key))) = self.timers.pop() else { break };
            // stale heap entries are skipped
            if self.delayed.get(&key) != Some(&deadline) {
                continue;
            }
            self.delayed.remove(&key);
            if self.push(key) {
                promoted += 1;
            }
        }
        promoted
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|Reverse((deadline, _, _))| *deadline)
    }
}

/// Deduplicating, rate-limiting work queue.
pub struct WorkQueue<K: QueueKey> {
    state: Mutex<State<K>>,
    notify: Notify,
}

impl<K: QueueKey> WorkQueue<K> {
    /// Queue whose rate-limited requeues back off from `base` doubling up to `max`.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                pending: VecDeque::new(),
                queued: FxHashSet::default(),
                processing: FxHashSet::default(),
                dirty: FxHashSet::default(),
                delayed: FxHashMap::default(),
                timers: BinaryHeap::new(),
                seq: 0,
                backoff: ExponentialBackoff::new(base, max),
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mark `key` as needing work. No-op if already pending or delayed; marks a
    /// key that is being processed dirty instead.
    pub fn add(&self, key: K) {
        let woke = self.lock().push(key);
        if woke {
            self.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has elapsed. A key already waiting keeps the
    /// earlier of the two deadlines.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }
        let deadline = Instant::now() + delay;
        {
            let mut st = self.lock();
            if st.shutting_down || st.queued.contains(&key) {
                return;
            }
            if let Some(existing) = st.delayed.get(&key) {
                if *existing <= deadline {
                    return;
                }
            }
            st.seq = st.seq.wrapping_add(1);
            let seq = st.seq;
            st.delayed.insert(key.clone(), deadline);
            st.timers.push(Reverse((deadline, seq, key.clone())));
            debug!(?key, delay_ms = delay.as_millis() as u64, "scheduled delayed add");
        }
        // waiters recompute their sleep deadline
        self.notify.notify_waiters();
    }

    /// Requeue `key` after its next backoff delay. Returns the delay used.
    pub fn add_rate_limited(&self, key: K) -> Duration {
        let delay = self.lock().backoff.next_delay(&key);
        counter!("labeler_workqueue_retries_total", 1u64);
        self.add_after(key, delay);
        delay
    }

    /// Reset the backoff of `key`.
    pub fn forget(&self, key: &K) {
        self.lock().backoff.forget(key);
    }

    /// Rate-limited requeues since the last `forget`.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().backoff.failures(key)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    ///
    /// The returned key is owned by the caller until it calls [`done`](Self::done).
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_deadline = {
                let mut st = self.lock();
                if st.shutting_down {
                    return None;
                }
                st.promote_due(Instant::now());
                if let Some(key) = st.pending.pop_front() {
                    st.queued.remove(&key);
                    st.processing.insert(key.clone());
                    gauge!("labeler_workqueue_depth", st.pending.len() as f64);
                    if !st.pending.is_empty() {
                        // pass the baton in case adds raced with this pop
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                st.next_deadline()
            };

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release `key` after processing. A dirty key goes straight back to pending,
    /// even when a requeue delay was scheduled for it during processing.
    pub fn done(&self, key: &K) {
        let woke = {
            let mut st = self.lock();
            st.processing.remove(key);
            if st.dirty.remove(key) {
                // the heap entry goes stale and is skipped on promotion
                st.delayed.remove(key);
                st.push(key.clone())
            } else {
                false
            }
        };
        if woke {
            self.notify.notify_one();
        }
    }

    /// Stop handing out keys. Every blocked and future `get` returns `None`.
    pub fn shutdown(&self) {
        self.lock().shutting_down = true;
        debug!("work queue shutting down");
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    /// Keys ready for dispatch (due delayed keys included).
    pub fn len(&self) -> usize {
        let mut st = self.lock();
        st.promote_due(Instant::now());
        st.pending.len()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn processing_len(&self) -> usize { self.lock().processing.len() }

    pub fn delayed_len(&self) -> usize { self.lock().delayed.len() }

    /// When `key` is due if it is waiting on a delay.
    pub fn delayed_until(&self, key: &K) -> Option<Instant> {
        self.lock().delayed.get(key).copied()
    }
}
