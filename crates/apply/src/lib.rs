//! Keel apply: cluster mutation (server-side apply with dry-run, delete, patch, get)
//! against a live cluster, plus loading target manifests from YAML.

#![forbid(unsafe_code)]

use std::time::Instant;

use kube::api::{DeleteParams, Patch, PatchParams, PropagationPolicy, ValidationDirective};
use kube::Client;
use metrics::{counter, histogram};
use serde_json::Value as Json;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use keel_core::{Error, Gvk, Manifest, ManifestExt, Result};
use keel_kubehub::{
    api_for, find_server_resource, map_kube_error, ApiResourceInfo, ApplyOptions, ClusterOps, KubeCluster,
    PatchType, ResourceDiscovery,
};

mod diff;
mod manifests;

pub use diff::{diff_summary, outcome_message, strip_noisy, DiffSummary};
pub use manifests::{load_manifests, parse_manifests};

const FIELD_MANAGER: &str = "keel";

/// `ClusterOps` backed by a kube client. Discovery results are cached and
/// refreshed when a kind is not found (for example right after a CRD apply).
pub struct KubeApplier {
    cluster: KubeCluster,
    resources: RwLock<Vec<ApiResourceInfo>>,
}

impl KubeApplier {
    pub fn new(client: Client) -> Self {
        Self { cluster: KubeCluster::new(client), resources: RwLock::new(Vec::new()) }
    }

    fn client(&self) -> Client {
        self.cluster.client().clone()
    }

    async fn resolve(&self, gvk: &Gvk) -> Result<ApiResourceInfo> {
        if let Ok(found) = find_server_resource(&self.resources.read().await, gvk) {
            return Ok(found);
        }
        let fresh = self.cluster.api_resources().await?;
        let found = find_server_resource(&fresh, gvk);
        *self.resources.write().await = fresh;
        found
    }
}

/// Discovery answered from the applier's cached resource list, so repeated sync passes
/// do not rediscover the whole API surface.
#[async_trait::async_trait]
impl ResourceDiscovery for KubeApplier {
    async fn api_resources(&self) -> Result<Vec<ApiResourceInfo>> {
        {
            let cached = self.resources.read().await;
            if !cached.is_empty() {
                return Ok(cached.clone());
            }
        }
        let fresh = self.cluster.api_resources().await?;
        *self.resources.write().await = fresh.clone();
        Ok(fresh)
    }

    async fn server_resource_for(&self, gvk: &Gvk) -> Result<ApiResourceInfo> {
        self.resolve(gvk).await
    }
}

/// Body sent for server-side apply: desired state without server-populated fields.
fn apply_body(obj: &Manifest, namespace: Option<&str>) -> Result<Json> {
    let mut body = strip_noisy(serde_json::to_value(obj)?);
    if let (Some(ns), Some(meta)) = (namespace, body.get_mut("metadata").and_then(Json::as_object_mut)) {
        meta.insert("namespace".into(), Json::String(ns.to_string()));
    }
    Ok(body)
}

#[async_trait::async_trait]
impl ClusterOps for KubeApplier {
    async fn apply_resource(&self, obj: &Manifest, namespace: &str, opts: ApplyOptions) -> Result<String> {
        let t0 = Instant::now();
        let gvk = obj.gvk();
        let name = obj.object_name().to_string();
        if name.is_empty() {
            return Err(Error::Manifest(format!("{gvk} has no metadata.name")));
        }
        let info = self.resolve(&gvk).await?;
        let ns = match obj.object_namespace() {
            "" if info.namespaced && !namespace.is_empty() => Some(namespace),
            "" => None,
            explicit if info.namespaced => Some(explicit),
            _ => None,
        };
        let api = api_for(self.client(), &info, ns);
        let body = apply_body(obj, ns)?;

        let live = api.get_opt(&name).await.map_err(|e| map_kube_error(e, obj.key()))?;
        let summary = match &live {
            Some(l) => Some(diff_summary(&body, &strip_noisy(serde_json::to_value(l)?))),
            None => None,
        };

        let mut pp = PatchParams::apply(FIELD_MANAGER);
        if opts.force {
            pp = pp.force();
        }
        if opts.dry_run {
            pp = pp.dry_run();
        }
        pp.field_validation =
            Some(if opts.validate { ValidationDirective::Strict } else { ValidationDirective::Ignore });

        match api.patch(&name, &pp, &Patch::Apply(&body)).await {
            Ok(_) => {
                histogram!("keel_apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
                let msg = outcome_message(&gvk.group, &gvk.kind, &name, summary, opts.dry_run);
                debug!(key = %obj.key(), %msg, "applied");
                Ok(msg)
            }
            Err(e) => {
                counter!("keel_apply_errors_total", 1u64);
                warn!(key = %obj.key(), dry_run = opts.dry_run, error = %e, "apply failed");
                Err(match map_kube_error(e, obj.key()) {
                    Error::NotFound(what) => Error::Mutation(format!("{what} not found")),
                    other => other,
                })
            }
        }
    }

    async fn delete_resource(&self, gvk: &Gvk, name: &str, namespace: &str, force: bool) -> Result<()> {
        let info = self.resolve(gvk).await?;
        let api = api_for(self.client(), &info, Some(namespace));
        let dp = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Foreground),
            grace_period_seconds: force.then_some(0),
            ..Default::default()
        };
        api.delete(name, &dp).await.map_err(|e| map_kube_error(e, format!("{gvk} {namespace}/{name}")))?;
        counter!("keel_delete_total", 1u64);
        Ok(())
    }

    async fn patch_resource(
        &self,
        gvk: &Gvk,
        name: &str,
        namespace: &str,
        patch_type: PatchType,
        patch: &[u8],
    ) -> Result<Manifest> {
        let info = self.resolve(gvk).await?;
        let api = api_for(self.client(), &info, Some(namespace));
        let body: Json = serde_json::from_slice(patch)?;
        let what = format!("{gvk} {namespace}/{name}");
        let res = match patch_type {
            PatchType::Merge => api.patch(name, &PatchParams::default(), &Patch::Merge(&body)).await,
            PatchType::Strategic => api.patch(name, &PatchParams::default(), &Patch::Strategic(&body)).await,
            PatchType::Apply => api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Apply(&body)).await,
        };
        res.map_err(|e| map_kube_error(e, what))
    }

    async fn get_resource(&self, gvk: &Gvk, name: &str, namespace: &str) -> Result<Manifest> {
        let info = self.resolve(gvk).await?;
        let api = api_for(self.client(), &info, Some(namespace));
        let mut obj = api.get(name).await.map_err(|e| map_kube_error(e, format!("{gvk} {namespace}/{name}")))?;
        if obj.types.is_none() {
            obj.types = Some(kube::core::TypeMeta { api_version: gvk.api_version(), kind: gvk.kind.clone() });
        }
        Ok(obj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::manifest_from_value;

    #[test]
    fn apply_body_sets_namespace_and_drops_status() {
        let obj = manifest_from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cfg", "resourceVersion": "9"},
            "status": {"x": 1},
            "data": {"k": "v"}
        }))
        .unwrap();
        let body = apply_body(&obj, Some("shop")).unwrap();
        assert_eq!(body["metadata"]["namespace"], "shop");
        assert!(body["metadata"].get("resourceVersion").is_none());
        assert!(body.get("status").is_none());
        assert_eq!(body["kind"], "ConfigMap");
    }
}
