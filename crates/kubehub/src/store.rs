use std::sync::Arc;

use kube::{
    api::Patch,
    Client,
};
use labeler_core::{ObjectKey, ObjectStore, StoreError};
use tracing::debug;

use crate::{is_retryable, merge_patch_params, ResolvedResource};

/// `ObjectStore` over the cluster API for one resource kind.
pub struct KubeStore {
    client: Client,
    resource: ResolvedResource,
    field_manager: String,
}

impl KubeStore {
    pub fn new(client: Client, resource: ResolvedResource, field_manager: &str) -> Self {
        Self { client, resource, field_manager: field_manager.to_string() }
    }

    fn store_err(err: kube::Error) -> StoreError {
        if is_retryable(&err) {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Rejected(err.to_string())
        }
    }
}

#[async_trait::async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Arc<serde_json::Value>>, StoreError> {
        let api = self.resource.api(self.client.clone(), key.namespace.as_deref());
        let found = api.get_opt(&key.name).await.map_err(Self::store_err)?;
        match found {
            Some(obj) => {
                let raw = serde_json::to_value(&obj).map_err(|e| StoreError::Rejected(e.to_string()))?;
                Ok(Some(Arc::new(raw)))
            }
            None => Ok(None),
        }
    }

    async fn patch_status(&self, key: &ObjectKey, status: serde_json::Value) -> Result<(), StoreError> {
        let api = self.resource.api(self.client.clone(), key.namespace.as_deref());
        let patch = serde_json::json!({ "status": status });
        let pp = merge_patch_params(&self.field_manager);
        api.patch_status(&key.name, &pp, &Patch::Merge(&patch)).await.map_err(Self::store_err)?;
        debug!(key = %key, "status patched");
        Ok(())
    }
}
