//! Labeler controller engine.
//!
//! Two bounded event feeds (primary and secondary kind) are merged ahead of the
//! key resolver; resolved keys go through the work queue to a fixed worker pool
//! that drives the reconcile adapter. Everything is wired explicitly through
//! [`Controller::new`]: no process-global informer or client registries.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use labeler_core::{ChangeEvent, ObjectKey, ObjectStore, Reconciler, Role};
use labeler_queue::WorkQueue;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub mod adapter;
pub mod config;
pub mod resolver;
pub mod scheduler;

pub use adapter::{AdapterConfig, Outcome, ReconcileAdapter, ReconcileCounters, ReconcileOutcome};
pub use config::{ConfigError, ControllerConfig, Relationship};
pub use resolver::KeyResolver;
pub use scheduler::Scheduler;

pub struct Controller {
    config: ControllerConfig,
    queue: Arc<WorkQueue<ObjectKey>>,
    adapter: Arc<ReconcileAdapter>,
    counters: Arc<ReconcileCounters>,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        store: Arc<dyn ObjectStore>,
        reconciler: Arc<dyn Reconciler>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let queue = Arc::new(WorkQueue::new(config.backoff_base, config.backoff_max));
        let counters = Arc::new(ReconcileCounters::new());
        let adapter = Arc::new(ReconcileAdapter::new(
            store,
            reconciler,
            AdapterConfig { skip_status_updates: config.skip_status_updates },
            Arc::clone(&counters),
        ));
        Ok(Self { config, queue, adapter, counters })
    }

    /// Bounded channel sized for one event feed.
    pub fn event_channel(&self) -> (mpsc::Sender<ChangeEvent>, mpsc::Receiver<ChangeEvent>) {
        mpsc::channel(self.config.channel_capacity)
    }

    pub fn queue(&self) -> Arc<WorkQueue<ObjectKey>> { Arc::clone(&self.queue) }

    pub fn counters(&self) -> Arc<ReconcileCounters> { Arc::clone(&self.counters) }

    pub fn config(&self) -> &ControllerConfig { &self.config }

    /// Run until `shutdown` is cancelled. Then the queue stops handing out keys,
    /// in-flight reconciles complete, and this returns.
    pub async fn run(
        self,
        primary: mpsc::Receiver<ChangeEvent>,
        secondary: mpsc::Receiver<ChangeEvent>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!(
            primary = %self.config.primary_kind,
            workers = self.config.workers,
            relationship = %self.config.relationship,
            skip_status_updates = self.config.skip_status_updates,
            "controller starting"
        );
        let scheduler = tokio::spawn(Scheduler::new(self.queue(), Arc::clone(&self.adapter), self.config.workers).run());

        let mut resolver = KeyResolver::new(&self.config.primary_kind, self.config.relationship.clone());
        merge_events(&mut resolver, &self.queue, primary, secondary, &shutdown).await;

        shutdown.cancelled().await;
        self.queue.shutdown();
        scheduler.await.context("joining scheduler")?;
        info!(dropped_events = resolver.dropped(), reconciles = self.counters.total(), "controller stopped");
        Ok(())
    }
}

/// Merge point ahead of the resolver. Returns on cancellation or once both
/// feeds are closed.
pub async fn merge_events(
    resolver: &mut KeyResolver,
    queue: &WorkQueue<ObjectKey>,
    mut primary: mpsc::Receiver<ChangeEvent>,
    mut secondary: mpsc::Receiver<ChangeEvent>,
    shutdown: &CancellationToken,
) {
    let (mut primary_open, mut secondary_open) = (true, true);
    while primary_open || secondary_open {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            ev = primary.recv(), if primary_open => ev.ok_or(Role::Primary),
            ev = secondary.recv(), if secondary_open => ev.ok_or(Role::Secondary),
        };
        match next {
            Ok(ev) => {
                for key in resolver.resolve(&ev) {
                    debug!(key = %key, trigger = %ev.key, event = ?ev.event_type, "enqueue");
                    queue.add(key);
                }
            }
            Err(Role::Primary) => {
                debug!("primary event feed closed");
                primary_open = false;
            }
            Err(Role::Secondary) => {
                debug!("secondary event feed closed");
                secondary_open = false;
            }
        }
    }
}
