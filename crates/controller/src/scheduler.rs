//! Fixed pool of workers draining the work queue.

use std::sync::Arc;

use labeler_core::ObjectKey;
use labeler_queue::WorkQueue;
use tracing::{debug, error, info};

use crate::adapter::{ReconcileAdapter, ReconcileOutcome};

pub struct Scheduler {
    queue: Arc<WorkQueue<ObjectKey>>,
    adapter: Arc<ReconcileAdapter>,
    workers: usize,
}

impl Scheduler {
    pub fn new(queue: Arc<WorkQueue<ObjectKey>>, adapter: Arc<ReconcileAdapter>, workers: usize) -> Self {
        Self { queue, adapter, workers: workers.max(1) }
    }

    /// Run every worker until the queue shuts down. In-flight reconciles finish
    /// before this returns.
    pub async fn run(self) {
        info!(workers = self.workers, "scheduler started");
        let handles: Vec<_> = (0..self.workers)
            .map(|id| tokio::spawn(worker(id, Arc::clone(&self.queue), Arc::clone(&self.adapter))))
            .collect();
        for h in handles {
            if let Err(e) = h.await {
                error!(error = %e, "worker task failed");
            }
        }
        info!("scheduler stopped");
    }
}

async fn worker(id: usize, queue: Arc<WorkQueue<ObjectKey>>, adapter: Arc<ReconcileAdapter>) {
    while let Some(key) = queue.get().await {
        debug!(worker = id, key = %key, "reconcile start");
        // a panicking reconcile must not take the worker or the key down with it
        let invocation = {
            let adapter = Arc::clone(&adapter);
            let key = key.clone();
            tokio::spawn(async move { adapter.invoke(&key).await })
        };
        let outcome = match invocation.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(worker = id, key = %key, error = %e, "reconcile task aborted; will retry");
                ReconcileOutcome::Requeue
            }
        };
        apply_outcome(&queue, &key, outcome);
        queue.done(&key);
    }
    debug!(worker = id, "worker exiting");
}

/// Translate an outcome into queue operations. Must run before `done`.
pub fn apply_outcome(queue: &WorkQueue<ObjectKey>, key: &ObjectKey, outcome: ReconcileOutcome) {
    match outcome {
        ReconcileOutcome::Done => queue.forget(key),
        ReconcileOutcome::Requeue => {
            let delay = queue.add_rate_limited(key.clone());
            debug!(key = %key, delay_ms = delay.as_millis() as u64, attempts = queue.num_requeues(key), "requeued with backoff");
        }
        ReconcileOutcome::RequeueAfter(delay) => {
            queue.forget(key);
            queue.add_after(key.clone(), delay);
        }
    }
}
