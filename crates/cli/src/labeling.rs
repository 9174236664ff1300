//! Reference reconcile function: merge a Labeler's `spec.customLabels` onto
//! every Deployment in its namespace.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::{ListParams, Patch},
    Api, Client, ResourceExt,
};
use labeler_core::{generation, Action, ReconcileError, Reconciler};
use metrics::counter;
use serde::Deserialize;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LabelerSpec {
    #[serde(default)]
    pub custom_labels: BTreeMap<String, String>,
}

/// Read and validate the spec of a raw Labeler. Errors here never heal on retry.
pub fn parse_spec(obj: &serde_json::Value) -> Result<LabelerSpec, ReconcileError> {
    let spec: LabelerSpec = match obj.get("spec") {
        Some(spec) => serde_json::from_value(spec.clone()).map_err(ReconcileError::permanent)?,
        None => LabelerSpec::default(),
    };
    for (k, v) in &spec.custom_labels {
        if k.is_empty() || k.len() > 317 {
            return Err(ReconcileError::permanent(format!("invalid label key {k:?}")));
        }
        if v.len() > 63 {
            return Err(ReconcileError::permanent(format!("label value for {k:?} longer than 63 characters")));
        }
    }
    Ok(spec)
}

/// Labels from `desired` that `current` lacks or holds with another value.
pub fn missing_labels(current: &BTreeMap<String, String>, desired: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    desired
        .iter()
        .filter(|(k, v)| current.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn classify(err: kube::Error) -> ReconcileError {
    let rejected = matches!(&err, kube::Error::Api(resp) if resp.code < 500 && resp.code != 429 && resp.code != 409);
    if rejected {
        ReconcileError::permanent(err)
    } else {
        ReconcileError::transient(err)
    }
}

pub struct LabelDeployments {
    client: Client,
    field_manager: String,
}

impl LabelDeployments {
    pub fn new(client: Client, field_manager: &str) -> Self {
        Self { client, field_manager: field_manager.to_string() }
    }
}

#[async_trait::async_trait]
impl Reconciler for LabelDeployments {
    async fn reconcile(&self, obj: Arc<serde_json::Value>) -> Result<Action, ReconcileError> {
        let spec = parse_spec(&obj)?;
        let meta = &obj["metadata"];
        let name = meta["name"].as_str().unwrap_or_default();
        let Some(ns) = meta["namespace"].as_str() else {
            return Err(ReconcileError::permanent(format!("labeler {name} has no namespace")));
        };

        let api: Api<Deployment> = Api::namespaced(self.client.clone(), ns);
        let deployments = api.list(&ListParams::default()).await.map_err(classify)?;
        let pp = labeler_kubehub::merge_patch_params(&self.field_manager);
        let mut patched = 0usize;
        for d in deployments.items.iter() {
            let missing = missing_labels(d.labels(), &spec.custom_labels);
            if missing.is_empty() {
                continue;
            }
            let patch = serde_json::json!({ "metadata": { "labels": missing } });
            api.patch(&d.name_any(), &pp, &Patch::Merge(&patch)).await.map_err(classify)?;
            debug!(labeler = %name, ns = %ns, deployment = %d.name_any(), "labels merged");
            patched += 1;
        }
        counter!("labeler_deployments_patched_total", patched as u64);
        info!(labeler = %name, ns = %ns, seen = deployments.items.len(), patched, "labeler reconciled");

        Ok(Action::done().with_status(serde_json::json!({
            "observedGeneration": generation(&obj),
            "labeledDeployments": deployments.items.len(),
        })))
    }
}
