//! Object store seam used by the reconcile adapter.

use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;

use crate::ObjectKey;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    /// Store unreachable or timed out. Worth retrying.
    #[error("unavailable: {0}")]
    Unavailable(String),
    /// The store refused the request.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Read-mostly access to the cluster's objects. Synchronized independently of
/// the work queue.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Current state of `key`, `None` when it no longer exists.
    async fn get(&self, key: &ObjectKey) -> Result<Option<Arc<serde_json::Value>>, StoreError>;

    /// Write the status sub-resource of `key`.
    async fn patch_status(&self, key: &ObjectKey, status: serde_json::Value) -> Result<(), StoreError>;
}

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<FxHashMap<ObjectKey, Arc<serde_json::Value>>>,
    unavailable: RwLock<bool>,
    status_writes: RwLock<Vec<ObjectKey>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub fn insert(&self, key: ObjectKey, raw: serde_json::Value) {
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        objects.insert(key, Arc::new(raw));
    }

    pub fn remove(&self, key: &ObjectKey) -> Option<Arc<serde_json::Value>> {
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        objects.remove(key)
    }

    /// Make every following call fail with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, on: bool) {
        *self.unavailable.write().unwrap_or_else(|e| e.into_inner()) = on;
    }

    /// Keys whose status was written, in call order.
    pub fn status_writes(&self) -> Vec<ObjectKey> {
        self.status_writes.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn check(&self) -> Result<(), StoreError> {
        if *self.unavailable.read().unwrap_or_else(|e| e.into_inner()) {
            return Err(StoreError::Unavailable("memory store marked unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Arc<serde_json::Value>>, StoreError> {
        self.check()?;
        let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
        Ok(objects.get(key).cloned())
    }

    async fn patch_status(&self, key: &ObjectKey, status: serde_json::Value) -> Result<(), StoreError> {
        self.check()?;
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        let Some(current) = objects.get(key) else {
            return Err(StoreError::Rejected(format!("{key} not found")));
        };
        let mut next = (**current).clone();
        if let Some(obj) = next.as_object_mut() {
            obj.insert("status".to_string(), status);
        }
        objects.insert(key.clone(), Arc::new(next));
        drop(objects);
        self.status_writes.write().unwrap_or_else(|e| e.into_inner()).push(key.clone());
        Ok(())
    }
}
