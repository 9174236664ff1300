//! Maps change events of either watched kind to the primary keys to reconcile.

use std::collections::BTreeSet;

use labeler_core::{ChangeEvent, EventType, ObjectKey, Role};
use metrics::counter;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::debug;

use crate::config::Relationship;

pub type Keys = SmallVec<[ObjectKey; 4]>;

/// Owned by the merge loop; not shared between tasks.
pub struct KeyResolver {
    primary_kind: String,
    relationship: Relationship,
    /// Known primary object names per namespace, for the namespace relationship.
    index: FxHashMap<Option<String>, BTreeSet<String>>,
    dropped: u64,
}

impl KeyResolver {
    pub fn new(primary_kind: &str, relationship: Relationship) -> Self {
        Self { primary_kind: primary_kind.to_ascii_lowercase(), relationship, index: FxHashMap::default(), dropped: 0 }
    }

    /// Primary keys affected by `ev`, without duplicates.
    pub fn resolve(&mut self, ev: &ChangeEvent) -> Keys {
        match ev.role {
            Role::Primary => {
                self.track_primary(ev);
                let mut out = Keys::new();
                out.push(ev.key.with_kind(&self.primary_kind));
                out
            }
            Role::Secondary => {
                let out = self.lookup(ev);
                if out.is_empty() {
                    self.dropped += 1;
                    counter!("labeler_events_dropped_total", 1u64);
                    debug!(key = %ev.key, relationship = %self.relationship, "no primary owner; event dropped");
                }
                out
            }
        }
    }

    /// Secondary events dropped for lack of an owner.
    pub fn dropped(&self) -> u64 { self.dropped }

    fn track_primary(&mut self, ev: &ChangeEvent) {
        let ns = ev.key.namespace.clone();
        match ev.event_type {
            EventType::Added | EventType::Updated => {
                self.index.entry(ns).or_default().insert(ev.key.name.clone());
            }
            EventType::Deleted => {
                if let Some(names) = self.index.get_mut(&ns) {
                    names.remove(&ev.key.name);
                    if names.is_empty() {
                        self.index.remove(&ns);
                    }
                }
            }
        }
    }

    fn lookup(&self, ev: &ChangeEvent) -> Keys {
        let ns = ev.key.namespace.as_deref();
        let mut out = Keys::new();
        let mut push = |name: &str| {
            if name.is_empty() {
                return;
            }
            let key = ObjectKey::new(&self.primary_kind, ns, name);
            if !out.contains(&key) {
                out.push(key);
            }
        };
        match &self.relationship {
            Relationship::OwnerReference => {
                for owner in ev.owners.iter().filter(|o| o.kind.eq_ignore_ascii_case(&self.primary_kind)) {
                    push(&owner.name);
                }
            }
            Relationship::Label(label) => {
                if let Some(name) = ev.label(label) {
                    push(name);
                }
            }
            Relationship::Namespace => {
                if let Some(names) = self.index.get(&ev.key.namespace) {
                    for name in names {
                        push(name);
                    }
                }
            }
        }
        out
    }
}
