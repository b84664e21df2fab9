//! Keel kubehub: cluster capabilities consumed by the engine (mutation, discovery,
//! watch feed) and their kube-rs backed implementation.

#![forbid(unsafe_code)]

use std::sync::Arc;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use keel_core::{Error, GroupKind, Gvk, Manifest, Result};

mod kube_cluster;
pub mod testing;

pub use kube_cluster::{api_for, map_kube_error, KubeCluster};

/// One served API resource as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResourceInfo {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
    pub verbs: SmallVec<[String; 8]>,
}

impl ApiResourceInfo {
    pub fn new(gvk: &Gvk, plural: &str, namespaced: bool) -> Self {
        Self {
            group: gvk.group.clone(),
            version: gvk.version.clone(),
            kind: gvk.kind.clone(),
            plural: plural.to_string(),
            namespaced,
            verbs: ["get", "list", "watch", "create", "update", "patch", "delete"]
                .iter()
                .map(|v| v.to_string())
                .collect(),
        }
    }

    pub fn gvk(&self) -> Gvk {
        Gvk::new(&self.group, &self.version, &self.kind)
    }

    pub fn group_kind(&self) -> GroupKind {
        GroupKind::new(&self.group, &self.kind)
    }

    pub fn supports(&self, verb: &str) -> bool {
        self.verbs.iter().any(|v| v == verb)
    }

    pub fn is_watchable(&self) -> bool {
        self.supports("list") && self.supports("watch")
    }

    pub fn to_api_resource(&self) -> kube::core::ApiResource {
        let gvk = self.gvk();
        kube::core::ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: gvk.api_version(),
            kind: self.kind.clone(),
            plural: self.plural.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOptions {
    pub dry_run: bool,
    pub force: bool,
    pub validate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchType {
    Merge,
    Strategic,
    Apply,
}

/// One observation from a per-kind watch.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(Manifest),
    Modified(Manifest),
    Deleted(Manifest),
    /// The watch was (re)established; `items` is the complete current list.
    Resync { items: Vec<Manifest>, resource_version: String },
}

/// Mutating access to the target cluster.
#[async_trait::async_trait]
pub trait ClusterOps: Send + Sync {
    /// Apply a manifest; returns a human readable outcome message (may be empty).
    async fn apply_resource(&self, obj: &Manifest, namespace: &str, opts: ApplyOptions) -> Result<String>;
    async fn delete_resource(&self, gvk: &Gvk, name: &str, namespace: &str, force: bool) -> Result<()>;
    async fn patch_resource(
        &self,
        gvk: &Gvk,
        name: &str,
        namespace: &str,
        patch_type: PatchType,
        patch: &[u8],
    ) -> Result<Manifest>;
    async fn get_resource(&self, gvk: &Gvk, name: &str, namespace: &str) -> Result<Manifest>;
}

/// Server resource discovery.
#[async_trait::async_trait]
pub trait ResourceDiscovery: Send + Sync {
    async fn api_resources(&self) -> Result<Vec<ApiResourceInfo>>;

    async fn filtered_api_resources(
        &self,
        filter: &(dyn for<'r> Fn(&'r ApiResourceInfo) -> bool + Send + Sync),
    ) -> Result<Vec<ApiResourceInfo>> {
        Ok(self.api_resources().await?.into_iter().filter(|r| filter(r)).collect())
    }

    /// Served metadata for an exact group/version/kind.
    async fn server_resource_for(&self, gvk: &Gvk) -> Result<ApiResourceInfo> {
        find_server_resource(&self.api_resources().await?, gvk)
    }

    async fn is_namespaced(&self, gk: &GroupKind) -> Result<bool> {
        is_namespaced(&self.api_resources().await?, gk)
            .ok_or_else(|| Error::NotFound(format!("server resource for {gk}")))
    }
}

/// List/watch feed for one kind at a time.
#[async_trait::async_trait]
pub trait WatchSource: Send + Sync {
    /// Full list plus the list resource version.
    async fn list(&self, api: &ApiResourceInfo, namespace: Option<&str>) -> Result<(Vec<Manifest>, String)>;
    fn watch(&self, api: &ApiResourceInfo, namespace: Option<&str>) -> BoxStream<'static, Result<WatchEvent>>;
    /// One object by name, for kinds whose cached entry carries no manifest.
    async fn get(&self, api: &ApiResourceInfo, name: &str, namespace: Option<&str>) -> Result<Manifest>;
}

/// Everything the cluster cache needs from a cluster.
pub trait ClusterSource: ResourceDiscovery + WatchSource {}

impl<T: ResourceDiscovery + WatchSource> ClusterSource for T {}

/// Consulted once per planned sync task with the server metadata of its kind.
pub type PermissionValidator = Arc<dyn Fn(&Manifest, &ApiResourceInfo) -> Result<()> + Send + Sync>;

pub fn find_server_resource(resources: &[ApiResourceInfo], gvk: &Gvk) -> Result<ApiResourceInfo> {
    resources
        .iter()
        .find(|r| r.group == gvk.group && r.version == gvk.version && r.kind == gvk.kind)
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("server resource for {gvk}")))
}

/// Scope of a group/kind according to `resources`, `None` when the kind is not served.
pub fn is_namespaced(resources: &[ApiResourceInfo], gk: &GroupKind) -> Option<bool> {
    resources.iter().find(|r| r.group == gk.group && r.kind == gk.kind).map(|r| r.namespaced)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources() -> Vec<ApiResourceInfo> {
        vec![
            ApiResourceInfo::new(&Gvk::new("", "v1", "Pod"), "pods", true),
            ApiResourceInfo::new(&Gvk::new("", "v1", "Namespace"), "namespaces", false),
        ]
    }

    #[test]
    fn scope_lookup_by_group_kind() {
        let rs = resources();
        assert_eq!(is_namespaced(&rs, &GroupKind::new("", "Pod")), Some(true));
        assert_eq!(is_namespaced(&rs, &GroupKind::new("", "Namespace")), Some(false));
        assert_eq!(is_namespaced(&rs, &GroupKind::new("apps", "Deployment")), None);
    }

    #[test]
    fn missing_server_resource_is_not_found() {
        let err = find_server_resource(&resources(), &Gvk::new("argoproj.io", "v1alpha1", "Workflow")).unwrap_err();
        assert!(err.is_not_found());
        assert!(find_server_resource(&resources(), &Gvk::new("", "v1", "Pod")).is_ok());
    }

    #[test]
    fn api_resource_conversion_keeps_api_version() {
        let info = ApiResourceInfo::new(&Gvk::new("apps", "v1", "Deployment"), "deployments", true);
        let ar = info.to_api_resource();
        assert_eq!(ar.api_version, "apps/v1");
        assert_eq!(ar.plural, "deployments");
        assert!(info.is_watchable());
    }
}
