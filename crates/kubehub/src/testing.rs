//! In-memory cluster implementing every capability trait, for tests across the workspace.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::stream::BoxStream;
use futures::StreamExt;
use rustc_hash::FxHashMap;
use serde_json::Value;

use keel_core::{Error, GroupKind, Gvk, Manifest, ManifestExt, ResourceKey, Result};

use crate::{ApiResourceInfo, ApplyOptions, ClusterOps, PatchType, ResourceDiscovery, WatchEvent, WatchSource};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedCall {
    pub key: ResourceKey,
    pub dry_run: bool,
    pub force: bool,
    pub validate: bool,
}

#[derive(Debug, Clone)]
struct Failure {
    message: String,
    wet_only: bool,
}

type Watcher = (GroupKind, Option<String>, UnboundedSender<Result<WatchEvent>>);

#[derive(Default)]
struct State {
    resources: Vec<ApiResourceInfo>,
    objects: BTreeMap<ResourceKey, Manifest>,
    apply_failures: FxHashMap<String, Failure>,
    delete_failures: FxHashMap<String, String>,
    list_failures: FxHashMap<GroupKind, usize>,
    discovery_error: Option<String>,
    apply_message: String,
    applies: Vec<AppliedCall>,
    deletes: Vec<ResourceKey>,
    gets: usize,
    watchers: Vec<Watcher>,
    version: u64,
}

impl State {
    fn scoped_namespace(&self, gk: &GroupKind, namespace: &str) -> String {
        match crate::is_namespaced(&self.resources, gk) {
            Some(false) => String::new(),
            _ => namespace.to_string(),
        }
    }

    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn notify(&mut self, gk: &GroupKind, namespace: &str, event: WatchEvent) {
        self.watchers.retain(|(wgk, wns, tx)| {
            if wgk != gk || wns.as_deref().map(|ns| ns != namespace).unwrap_or(false) {
                return !tx.is_closed();
            }
            tx.unbounded_send(Ok(event.clone())).is_ok()
        });
    }

    fn store(&mut self, mut obj: Manifest) -> ResourceKey {
        let gk = obj.gvk().group_kind();
        let ns = self.scoped_namespace(&gk, obj.object_namespace());
        obj.metadata.namespace = if ns.is_empty() { None } else { Some(ns.clone()) };
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        obj.metadata.resource_version = Some(self.next_version());
        let key = obj.key();
        let existed = self.objects.insert(key.clone(), obj.clone()).is_some();
        let event = if existed { WatchEvent::Modified(obj) } else { WatchEvent::Added(obj) };
        self.notify(&gk, &ns, event);
        key
    }
}

/// Fake cluster with a configurable discovery surface and injectable failures.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    /// A cluster serving the common built-in kinds.
    pub fn new() -> Self {
        let fake = Self::default();
        fake.state().resources = standard_resources();
        fake
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_api_resource(&self, info: ApiResourceInfo) {
        self.state().resources.push(info);
    }

    /// Store an object as if it already existed live.
    pub fn insert(&self, obj: Manifest) -> ResourceKey {
        self.state().store(obj)
    }

    pub fn object(&self, key: &ResourceKey) -> Option<Manifest> {
        self.state().objects.get(key).cloned()
    }

    pub fn objects(&self) -> Vec<Manifest> {
        self.state().objects.values().cloned().collect()
    }

    /// Fail every apply (dry-run included) of objects named `name`.
    pub fn fail_apply(&self, name: &str, message: &str) {
        self.state().apply_failures.insert(name.into(), Failure { message: message.into(), wet_only: false });
    }

    /// Fail only real applies of objects named `name`.
    pub fn fail_wet_apply(&self, name: &str, message: &str) {
        self.state().apply_failures.insert(name.into(), Failure { message: message.into(), wet_only: true });
    }

    pub fn fail_delete(&self, name: &str, message: &str) {
        self.state().delete_failures.insert(name.into(), message.into());
    }

    pub fn fail_discovery(&self, message: &str) {
        self.state().discovery_error = Some(message.into());
    }

    /// Fail the next `times` list calls for a kind.
    pub fn fail_list(&self, gk: GroupKind, times: usize) {
        self.state().list_failures.insert(gk, times);
    }

    pub fn set_apply_message(&self, message: &str) {
        self.state().apply_message = message.into();
    }

    pub fn applies(&self) -> Vec<AppliedCall> {
        self.state().applies.clone()
    }

    pub fn deletes(&self) -> Vec<ResourceKey> {
        self.state().deletes.clone()
    }

    /// Number of single-object reads served through the watch source.
    pub fn gets(&self) -> usize {
        self.state().gets
    }

    /// Push an event to every open watch of `gk`.
    pub fn emit(&self, gk: &GroupKind, namespace: &str, event: WatchEvent) {
        self.state().notify(gk, namespace, event);
    }

    /// Push an error into every open watch of `gk` and close them.
    pub fn break_watches(&self, gk: &GroupKind, message: &str) {
        self.state().watchers.retain(|(wgk, _, tx)| {
            if wgk == gk {
                let _ = tx.unbounded_send(Err(Error::Discovery(message.to_string())));
                tx.close_channel();
                false
            } else {
                true
            }
        });
    }

    pub fn open_watches(&self, gk: &GroupKind) -> usize {
        self.state().watchers.iter().filter(|(wgk, _, tx)| wgk == gk && !tx.is_closed()).count()
    }
}

#[async_trait::async_trait]
impl ClusterOps for FakeCluster {
    async fn apply_resource(&self, obj: &Manifest, namespace: &str, opts: ApplyOptions) -> Result<String> {
        let mut state = self.state();
        let mut obj = obj.clone();
        if obj.object_namespace().is_empty() && !namespace.is_empty() {
            obj.metadata.namespace = Some(namespace.to_string());
        }
        let gk = obj.gvk().group_kind();
        let ns = state.scoped_namespace(&gk, obj.object_namespace());
        let key = ResourceKey::new(&gk.group, &gk.kind, ns, obj.object_name());
        state.applies.push(AppliedCall { key, dry_run: opts.dry_run, force: opts.force, validate: opts.validate });
        if let Some(f) = state.apply_failures.get(obj.object_name()) {
            if !f.wet_only || !opts.dry_run {
                return Err(Error::Mutation(f.message.clone()));
            }
        }
        if !opts.dry_run {
            state.store(obj);
        }
        Ok(state.apply_message.clone())
    }

    async fn delete_resource(&self, gvk: &Gvk, name: &str, namespace: &str, _force: bool) -> Result<()> {
        let mut state = self.state();
        if let Some(msg) = state.delete_failures.get(name) {
            return Err(Error::Mutation(msg.clone()));
        }
        let gk = gvk.group_kind();
        let ns = state.scoped_namespace(&gk, namespace);
        let key = ResourceKey::new(&gk.group, &gk.kind, &ns, name);
        match state.objects.remove(&key) {
            Some(obj) => {
                state.deletes.push(key);
                state.notify(&gk, &ns, WatchEvent::Deleted(obj));
                Ok(())
            }
            None => Err(Error::NotFound(key.to_string())),
        }
    }

    async fn patch_resource(
        &self,
        gvk: &Gvk,
        name: &str,
        namespace: &str,
        _patch_type: PatchType,
        patch: &[u8],
    ) -> Result<Manifest> {
        let patch: Value = serde_json::from_slice(patch)?;
        let mut state = self.state();
        let gk = gvk.group_kind();
        let ns = state.scoped_namespace(&gk, namespace);
        let key = ResourceKey::new(&gk.group, &gk.kind, ns, name);
        let current = state.objects.get(&key).cloned().ok_or_else(|| Error::NotFound(key.to_string()))?;
        let mut value = serde_json::to_value(&current)?;
        merge_patch(&mut value, &patch);
        let patched: Manifest = serde_json::from_value(value)?;
        state.store(patched.clone());
        Ok(patched)
    }

    async fn get_resource(&self, gvk: &Gvk, name: &str, namespace: &str) -> Result<Manifest> {
        let state = self.state();
        let gk = gvk.group_kind();
        let key = ResourceKey::new(&gk.group, &gk.kind, state.scoped_namespace(&gk, namespace), name);
        state.objects.get(&key).cloned().ok_or_else(|| Error::NotFound(key.to_string()))
    }
}

#[async_trait::async_trait]
impl ResourceDiscovery for FakeCluster {
    async fn api_resources(&self) -> Result<Vec<ApiResourceInfo>> {
        let state = self.state();
        match &state.discovery_error {
            Some(msg) => Err(Error::Discovery(msg.clone())),
            None => Ok(state.resources.clone()),
        }
    }
}

#[async_trait::async_trait]
impl WatchSource for FakeCluster {
    async fn list(&self, api: &ApiResourceInfo, namespace: Option<&str>) -> Result<(Vec<Manifest>, String)> {
        let mut state = self.state();
        let gk = api.group_kind();
        if let Some(left) = state.list_failures.get_mut(&gk) {
            if *left > 0 {
                *left -= 1;
                return Err(Error::Discovery(format!("list {gk} failed")));
            }
        }
        let items = state
            .objects
            .iter()
            .filter(|(k, _)| k.group == gk.group && k.kind == gk.kind)
            .filter(|(k, _)| namespace.map(|ns| ns.is_empty() || k.namespace == ns).unwrap_or(true))
            .map(|(_, o)| o.clone())
            .collect();
        let version = state.next_version();
        Ok((items, version))
    }

    fn watch(&self, api: &ApiResourceInfo, namespace: Option<&str>) -> BoxStream<'static, Result<WatchEvent>> {
        let (tx, rx) = unbounded();
        self.state().watchers.push((api.group_kind(), namespace.map(str::to_string), tx));
        rx.boxed()
    }

    async fn get(&self, api: &ApiResourceInfo, name: &str, namespace: Option<&str>) -> Result<Manifest> {
        self.state().gets += 1;
        self.get_resource(&api.gvk(), name, namespace.unwrap_or_default()).await
    }
}

/// JSON merge patch (RFC 7386).
fn merge_patch(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(t), Value::Object(p)) => {
            for (k, v) in p {
                if v.is_null() {
                    t.remove(k);
                } else {
                    merge_patch(t.entry(k.clone()).or_insert(Value::Null), v);
                }
            }
        }
        (t, p) => *t = p.clone(),
    }
}

pub fn standard_resources() -> Vec<ApiResourceInfo> {
    [
        ("", "v1", "Namespace", "namespaces", false),
        ("", "v1", "Pod", "pods", true),
        ("", "v1", "Service", "services", true),
        ("", "v1", "Endpoints", "endpoints", true),
        ("", "v1", "ConfigMap", "configmaps", true),
        ("", "v1", "Secret", "secrets", true),
        ("", "v1", "ServiceAccount", "serviceaccounts", true),
        ("", "v1", "PersistentVolumeClaim", "persistentvolumeclaims", true),
        ("apps", "v1", "Deployment", "deployments", true),
        ("apps", "v1", "ReplicaSet", "replicasets", true),
        ("apps", "v1", "StatefulSet", "statefulsets", true),
        ("apps", "v1", "DaemonSet", "daemonsets", true),
        ("batch", "v1", "Job", "jobs", true),
        ("rbac.authorization.k8s.io", "v1", "ClusterRole", "clusterroles", false),
        ("apiextensions.k8s.io", "v1", "CustomResourceDefinition", "customresourcedefinitions", false),
    ]
    .iter()
    .map(|(g, v, k, p, ns)| ApiResourceInfo::new(&Gvk::new(*g, *v, *k), p, *ns))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::manifest_from_value;
    use serde_json::json;

    fn pod(name: &str) -> Manifest {
        manifest_from_value(json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": name}})).unwrap()
    }

    #[tokio::test]
    async fn apply_stores_only_wet_runs() {
        let fake = FakeCluster::new();
        let opts = ApplyOptions { dry_run: true, ..Default::default() };
        fake.apply_resource(&pod("a"), "ns", opts).await.unwrap();
        assert!(fake.objects().is_empty());
        fake.apply_resource(&pod("a"), "ns", ApplyOptions::default()).await.unwrap();
        let live = fake.get_resource(&Gvk::new("", "v1", "Pod"), "a", "ns").await.unwrap();
        assert!(live.metadata.uid.is_some());
        assert_eq!(fake.applies().len(), 2);
    }

    #[tokio::test]
    async fn delete_of_missing_object_is_not_found() {
        let fake = FakeCluster::new();
        let err = fake.delete_resource(&Gvk::new("", "v1", "Pod"), "nope", "ns", false).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn merge_patch_updates_labels() {
        let fake = FakeCluster::new();
        let mut p = pod("a");
        p.metadata.namespace = Some("ns".into());
        fake.insert(p);
        let patched = fake
            .patch_resource(&Gvk::new("", "v1", "Pod"), "a", "ns", PatchType::Merge, br#"{"metadata":{"labels":{"x":"y"}}}"#)
            .await
            .unwrap();
        assert_eq!(patched.metadata.labels.unwrap().get("x").map(String::as_str), Some("y"));
    }

    #[tokio::test]
    async fn watches_receive_store_events() {
        let fake = FakeCluster::new();
        let info = ApiResourceInfo::new(&Gvk::new("", "v1", "Pod"), "pods", true);
        let mut stream = fake.watch(&info, None);
        fake.insert(pod("w"));
        match stream.next().await {
            Some(Ok(WatchEvent::Added(o))) => assert_eq!(o.object_name(), "w"),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
