use anyhow::Result;
use futures::StreamExt;
use kube::{
    core::DynamicObject,
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use labeler_core::{ChangeEvent, EventType, ObjectKey, Role};
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::resolve_resource;

/// One watched feed.
#[derive(Debug, Clone)]
pub struct WatchTarget {
    /// `group/version/Kind` or `version/Kind`
    pub gvk_key: String,
    /// Restrict the watch to one namespace; `None` watches all.
    pub namespace: Option<String>,
    pub role: Role,
}

/// Turns kube's applied/deleted/restarted events into Added/Updated/Deleted.
///
/// Remembers the last event per key so a relist can report objects that
/// vanished while the watch was down.
pub struct EventTyper {
    role: Role,
    kind: String,
    known: FxHashMap<ObjectKey, ChangeEvent>,
}

impl EventTyper {
    pub fn new(role: Role, kind: &str) -> Self {
        Self { role, kind: kind.to_string(), known: FxHashMap::default() }
    }

    pub fn applied(&mut self, raw: &serde_json::Value) -> ChangeEvent {
        let mut ev = ChangeEvent::from_raw(self.role, &self.kind, EventType::Added, raw);
        if self.known.contains_key(&ev.key) {
            ev.event_type = EventType::Updated;
        }
        self.known.insert(ev.key.clone(), ev.clone());
        ev
    }

    pub fn deleted(&mut self, raw: &serde_json::Value) -> ChangeEvent {
        let ev = ChangeEvent::from_raw(self.role, &self.kind, EventType::Deleted, raw);
        self.known.remove(&ev.key);
        ev
    }

    /// Full relist. Emits an event per listed object plus a Deleted for every
    /// known key that is no longer present.
    pub fn restarted<'a>(&mut self, objects: impl IntoIterator<Item = &'a serde_json::Value>) -> Vec<ChangeEvent> {
        let mut out = Vec::new();
        let mut listed = FxHashSet::default();
        for raw in objects {
            let ev = self.applied(raw);
            listed.insert(ev.key.clone());
            out.push(ev);
        }
        let gone: Vec<ObjectKey> = self.known.keys().filter(|k| !listed.contains(*k)).cloned().collect();
        for key in gone {
            if let Some(mut last) = self.known.remove(&key) {
                last.event_type = EventType::Deleted;
                out.push(last);
            }
        }
        out
    }

    pub fn known_len(&self) -> usize { self.known.len() }
}

fn to_raw(obj: &DynamicObject) -> serde_json::Value {
    serde_json::to_value(obj).unwrap_or_default()
}

/// List+watch one kind and forward every change into `tx`.
///
/// Sends are awaited, so a slow consumer backs up into the watch transport
/// rather than losing events. Returns when the stream ends or `tx` is closed.
pub async fn watch_kind(client: Client, target: WatchTarget, tx: mpsc::Sender<ChangeEvent>) -> Result<()> {
    let resolved = resolve_resource(client.clone(), &target.gvk_key).await?;
    let api = resolved.api(client, target.namespace.as_deref());
    let mut typer = EventTyper::new(target.role, &resolved.api_resource.kind);
    let role_tag = match target.role {
        Role::Primary => "primary",
        Role::Secondary => "secondary",
    };

    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(gvk = %target.gvk_key, ns = ?target.namespace, role = role_tag, "watcher started");

    while let Some(next) = stream.next().await {
        let events = match next {
            Ok(Event::Applied(o)) => vec![typer.applied(&to_raw(&o))],
            Ok(Event::Deleted(o)) => vec![typer.deleted(&to_raw(&o))],
            Ok(Event::Restarted(list)) => {
                debug!(gvk = %target.gvk_key, count = list.len(), "watch restart");
                let raws: Vec<_> = list.iter().map(to_raw).collect();
                typer.restarted(raws.iter())
            }
            Err(e) => {
                warn!(gvk = %target.gvk_key, error = %e, "watch error; backing off");
                counter!("labeler_watch_errors_total", 1u64, "role" => role_tag);
                continue;
            }
        };
        for ev in events {
            counter!("labeler_watch_events_total", 1u64, "role" => role_tag);
            if tx.send(ev).await.is_err() {
                debug!(gvk = %target.gvk_key, "event receiver dropped; stopping watcher");
                return Ok(());
            }
        }
    }
    warn!(gvk = %target.gvk_key, "watcher stream ended");
    Ok(())
}
