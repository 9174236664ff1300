//! Labeler kubehub: resource discovery, list+watch adapters and the kube-backed
//! object store.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use kube::{
    api::PatchParams,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Api, Client,
};

mod store;
mod watch;

pub use store::KubeStore;
pub use watch::{watch_kind, EventTyper, WatchTarget};

/// Resolved API resource for a GVK key.
#[derive(Debug, Clone)]
pub struct ResolvedResource {
    pub api_resource: ApiResource,
    pub namespaced: bool,
}

impl ResolvedResource {
    /// Dynamic API over the resource, narrowed to `namespace` when it is namespaced.
    pub fn api(&self, client: Client, namespace: Option<&str>) -> Api<DynamicObject> {
        match (self.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(client, ns, &self.api_resource),
            _ => Api::all_with(client, &self.api_resource),
        }
    }
}

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Look a GVK key up through discovery.
pub async fn resolve_resource(client: Client, gvk_key: &str) -> Result<ResolvedResource> {
    let gvk = parse_gvk_key(gvk_key)?;
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok(ResolvedResource { api_resource: ar.clone(), namespaced });
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Params for a JSON merge patch owned by `field_manager`. Not server-side apply.
pub fn merge_patch_params(field_manager: &str) -> PatchParams {
    PatchParams { field_manager: Some(field_manager.to_string()), ..Default::default() }
}

/// Classify a kube client error for retry purposes.
pub(crate) fn is_retryable(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(resp) => resp.code == 429 || resp.code == 409 || resp.code >= 500,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_core_and_grouped_keys() {
        let core = parse_gvk_key("v1/ConfigMap").unwrap();
        assert_eq!((core.group.as_str(), core.version.as_str(), core.kind.as_str()), ("", "v1", "ConfigMap"));
        let crd = parse_gvk_key("clusterops.knative.dev/v1alpha1/Labeler").unwrap();
        assert_eq!(crd.group, "clusterops.knative.dev");
        assert_eq!(crd.version, "v1alpha1");
        assert_eq!(crd.kind, "Labeler");
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(parse_gvk_key("Labeler").is_err());
        assert!(parse_gvk_key("a/b/c/d").is_err());
        assert!(parse_gvk_key("v1/").is_err());
    }

    #[test]
    fn merge_patch_params_carry_field_manager_without_force() {
        let pp = merge_patch_params("labeler-controller");
        assert_eq!(pp.field_manager.as_deref(), Some("labeler-controller"));
        assert!(!pp.force);
        assert!(!pp.dry_run);
    }

    #[test]
    fn api_errors_classified() {
        let resp = |code| {
            kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".into(),
                message: "x".into(),
                reason: "x".into(),
                code,
            })
        };
        assert!(is_retryable(&resp(503)));
        assert!(is_retryable(&resp(429)));
        assert!(!is_retryable(&resp(403)));
        assert!(!is_retryable(&resp(422)));
    }
}
