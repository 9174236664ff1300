//! Wraps the external reconcile function: fetch, count, call, status policy,
//! result classification.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use labeler_core::{generation, ObjectKey, ObjectStore, ReconcileError, Reconciler};
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tracing::{debug, error, warn};

/// What the scheduler should do with a key after a reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Converged or permanently failed; backoff is cleared.
    Done,
    /// Retry with rate-limited backoff.
    Requeue,
    /// Retry after a fixed delay asked for by the reconcile function.
    RequeueAfter(Duration),
}

/// Counter label for one reconcile attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    NotFound,
    TransientError,
    PermanentError,
    FetchError,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::NotFound => "not_found",
            Outcome::TransientError => "transient_error",
            Outcome::PermanentError => "permanent_error",
            Outcome::FetchError => "fetch_error",
        }
    }
}

/// In-process mirror of `labeler_cr_reconcile_total`, keyed by kind and outcome.
#[derive(Debug, Default)]
pub struct ReconcileCounters {
    counts: Mutex<FxHashMap<(String, Outcome), u64>>,
}

impl ReconcileCounters {
    pub fn new() -> Self { Self::default() }

    pub fn incr(&self, kind: &str, outcome: Outcome) {
        counter!("labeler_cr_reconcile_total", 1u64, "kind" => kind.to_string(), "outcome" => outcome.as_str());
        let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        *counts.entry((kind.to_string(), outcome)).or_insert(0) += 1;
    }

    pub fn get(&self, kind: &str, outcome: Outcome) -> u64 {
        let counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
        counts.get(&(kind.to_string(), outcome)).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.lock().unwrap_or_else(|e| e.into_inner()).values().sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    /// Skip the status sub-resource write after a successful reconcile.
    pub skip_status_updates: bool,
}

impl Default for AdapterConfig {
    fn default() -> Self { Self { skip_status_updates: true } }
}

pub struct ReconcileAdapter {
    store: Arc<dyn ObjectStore>,
    reconciler: Arc<dyn Reconciler>,
    config: AdapterConfig,
    counters: Arc<ReconcileCounters>,
}

impl ReconcileAdapter {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        reconciler: Arc<dyn Reconciler>,
        config: AdapterConfig,
        counters: Arc<ReconcileCounters>,
    ) -> Self {
        Self { store, reconciler, config, counters }
    }

    pub fn counters(&self) -> &Arc<ReconcileCounters> { &self.counters }

    /// Reconcile `key` once. Never panics on reconcile errors; every failure
    /// becomes an outcome.
    pub async fn invoke(&self, key: &ObjectKey) -> ReconcileOutcome {
        let obj = match self.store.get(key).await {
            Ok(Some(obj)) => obj,
            Ok(None) => {
                debug!(key = %key, "object gone; nothing to reconcile");
                self.counters.incr(&key.kind, Outcome::NotFound);
                return ReconcileOutcome::Done;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "fetch failed; will retry");
                self.counters.incr(&key.kind, Outcome::FetchError);
                return ReconcileOutcome::Requeue;
            }
        };

        let started = Instant::now();
        let result = self.reconciler.reconcile(Arc::clone(&obj)).await;
        histogram!("labeler_reconcile_duration_ms", started.elapsed().as_secs_f64() * 1000.0, "kind" => key.kind.clone());

        match result {
            Ok(action) => {
                if let Some(status) = action.status {
                    if self.config.skip_status_updates {
                        debug!(key = %key, "status updates disabled; skipping write");
                    } else if let Err(e) = self.store.patch_status(key, status).await {
                        warn!(key = %key, error = %e, "status write failed; will retry");
                        self.counters.incr(&key.kind, Outcome::TransientError);
                        return ReconcileOutcome::Requeue;
                    }
                }
                self.counters.incr(&key.kind, Outcome::Success);
                match action.requeue_after {
                    Some(delay) => ReconcileOutcome::RequeueAfter(delay),
                    None => ReconcileOutcome::Done,
                }
            }
            Err(ReconcileError::Transient(msg)) => {
                warn!(key = %key, error = %msg, "reconcile failed; will retry");
                self.counters.incr(&key.kind, Outcome::TransientError);
                ReconcileOutcome::Requeue
            }
            Err(ReconcileError::Permanent(msg)) => {
                error!(key = %key, generation = ?generation(&obj), error = %msg, "reconcile failed permanently");
                self.counters.incr(&key.kind, Outcome::PermanentError);
                ReconcileOutcome::Done
            }
        }
    }
}
