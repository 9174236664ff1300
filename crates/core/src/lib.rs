//! Labeler core types: object identity, change events and the reconcile contract.
//!
//! Everything here is transport-agnostic. Objects travel as raw JSON the way the
//! watch layer hands them over; the kube glue lives in `labeler-kubehub`.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod reconcile;
pub mod store;

pub use reconcile::{Action, ReconcileError, Reconciler};
pub use store::{MemoryStore, ObjectStore, StoreError};

/// Identity of a watched object. The queue deduplicates on this.
///
/// `kind` is stored lowercased so `Labeler` and `labeler` address the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: &str, namespace: Option<&str>, name: &str) -> Self {
        Self {
            kind: kind.to_ascii_lowercase(),
            namespace: namespace.filter(|ns| !ns.is_empty()).map(|ns| ns.to_string()),
            name: name.to_string(),
        }
    }

    /// Same namespace and name, different kind.
    pub fn with_kind(&self, kind: &str) -> Self {
        Self::new(kind, self.namespace.as_deref(), &self.name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Which of the two watched feeds an event came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Role {
    /// The custom resource the controller reconciles.
    Primary,
    /// A related resource whose changes trigger primary reconciles.
    Secondary,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    Added,
    Updated,
    Deleted,
}

/// Owner reference as recorded in `metadata.ownerReferences`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
    pub controller: bool,
}

/// Normalized watch notification.
///
/// Owners and labels ride along so relationship lookups never need a second read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub role: Role,
    pub key: ObjectKey,
    pub event_type: EventType,
    pub owners: SmallVec<[OwnerRef; 2]>,
    pub labels: SmallVec<[(String, String); 8]>,
}

impl ChangeEvent {
    /// Build an event from a raw object. Never fails: a malformed object yields
    /// whatever identity can be read (an empty name at worst).
    pub fn from_raw(role: Role, kind: &str, event_type: EventType, raw: &serde_json::Value) -> Self {
        let meta = raw.get("metadata");
        let name = meta.and_then(|m| m.get("name")).and_then(|v| v.as_str()).unwrap_or("");
        let namespace = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str());

        let owners = meta
            .and_then(|m| m.get("ownerReferences"))
            .and_then(|v| v.as_array())
            .map(|refs| {
                refs.iter()
                    .filter_map(|r| {
                        let kind = r.get("kind")?.as_str()?;
                        let name = r.get("name")?.as_str()?;
                        let controller = r.get("controller").and_then(|c| c.as_bool()).unwrap_or(false);
                        Some(OwnerRef { kind: kind.to_string(), name: name.to_string(), controller })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let labels = meta
            .and_then(|m| m.get("labels"))
            .and_then(|v| v.as_object())
            .map(|m| {
                m.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();

        Self { role, key: ObjectKey::new(kind, namespace, name), event_type, owners, labels }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// `metadata.generation` of a raw object, if present.
pub fn generation(raw: &serde_json::Value) -> Option<i64> {
    raw.get("metadata")?.get("generation")?.as_i64()
}
