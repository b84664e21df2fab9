//! Pairing of target manifests with live objects.

use std::collections::BTreeMap;

use rustc_hash::{FxHashMap, FxHashSet};

use keel_cache::ClusterCache;
use keel_core::{GroupKind, Manifest, ManifestExt, ResourceKey, Result};
use keel_kubehub::ApiResourceInfo;

use crate::hook;

/// Scope lookup used to resolve a target's effective namespace.
pub trait ResourceInfoProvider {
    fn is_namespaced(&self, gk: &GroupKind) -> Result<bool>;
}

impl ResourceInfoProvider for ClusterCache {
    fn is_namespaced(&self, gk: &GroupKind) -> Result<bool> {
        ClusterCache::is_namespaced(self, gk)
    }
}

impl ResourceInfoProvider for Vec<ApiResourceInfo> {
    fn is_namespaced(&self, gk: &GroupKind) -> Result<bool> {
        keel_kubehub::is_namespaced(self, gk)
            .ok_or_else(|| keel_core::Error::NotFound(format!("server resource for {gk}")))
    }
}

/// Matched target and live sides of one resource. At least one side is set.
#[derive(Debug, Clone)]
pub struct ReconciledResource {
    pub target: Option<Manifest>,
    pub live: Option<Manifest>,
}

impl ReconciledResource {
    /// Identity of the pair; the live side wins when both exist.
    pub fn key(&self) -> Option<ResourceKey> {
        self.live.as_ref().or(self.target.as_ref()).map(ManifestExt::key)
    }
}

/// `target[i]` pairs with `live[i]`; `None` target means prune, `None` live means create.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationResult {
    pub target: Vec<Option<Manifest>>,
    pub live: Vec<Option<Manifest>>,
    pub hooks: Vec<Manifest>,
}

impl ReconciliationResult {
    /// Pairs indexed by identity.
    pub fn resources(&self) -> BTreeMap<ResourceKey, ReconciledResource> {
        self.target
            .iter()
            .zip(self.live.iter())
            .filter_map(|(t, l)| {
                let res = ReconciledResource { target: t.clone(), live: l.clone() };
                res.key().map(|k| (k, res))
            })
            .collect()
    }
}

/// Drop ignored hooks, then separate hooks from managed resources.
pub fn split_hooks(targets: Vec<Manifest>) -> (Vec<Manifest>, Vec<Manifest>) {
    targets.into_iter().filter(|o| !hook::ignore(o)).partition(|o| !hook::is_hook(o))
}

/// Remove live objects that are the same object (same UID) seen under several
/// keys, keeping the ones a target refers to and never all of them.
pub fn dedup_live_resources(targets: &[Manifest], live_by_key: &mut FxHashMap<ResourceKey, Manifest>) {
    let target_keys: FxHashSet<ResourceKey> = targets.iter().map(ManifestExt::key).collect();
    let mut by_uid: FxHashMap<&str, Vec<ResourceKey>> = FxHashMap::default();
    for (key, obj) in live_by_key.iter() {
        if let Some(uid) = obj.metadata.uid.as_deref().filter(|u| !u.is_empty()) {
            by_uid.entry(uid).or_default().push(key.clone());
        }
    }
    let mut stale = Vec::new();
    for keys in by_uid.values_mut().filter(|k| k.len() > 1) {
        keys.sort();
        let mut left = keys.len();
        for key in keys.iter() {
            if left == 1 {
                break;
            }
            if !target_keys.contains(key) {
                stale.push(key.clone());
                left -= 1;
            }
        }
    }
    for key in stale {
        live_by_key.remove(&key);
    }
}

/// Pair every target with its live counterpart; unmatched live objects become prune
/// candidates, appended in key order.
pub fn reconcile(
    targets: Vec<Manifest>,
    mut live_by_key: FxHashMap<ResourceKey, Manifest>,
    namespace: &str,
    info: &dyn ResourceInfoProvider,
) -> ReconciliationResult {
    let (targets, hooks) = split_hooks(targets);
    dedup_live_resources(&targets, &mut live_by_key);

    let mut live = Vec::with_capacity(targets.len());
    for obj in &targets {
        let gvk = obj.gvk();
        let ns = match obj.object_namespace() {
            "" => namespace,
            explicit => explicit,
        };
        let namespaced = info.is_namespaced(&gvk.group_kind()).ok();
        // Unknown scope: look under both keys rather than risk pruning the live object.
        let mut candidates = Vec::with_capacity(2);
        if namespaced != Some(false) {
            candidates.push(ResourceKey::new(&gvk.group, &gvk.kind, ns, obj.object_name()));
        }
        if namespaced != Some(true) {
            candidates.push(ResourceKey::new(&gvk.group, &gvk.kind, "", obj.object_name()));
        }
        live.push(candidates.iter().find_map(|k| live_by_key.remove(k)));
    }

    let mut target: Vec<Option<Manifest>> = targets.into_iter().map(Some).collect();
    let mut leftovers: Vec<(ResourceKey, Manifest)> = live_by_key.into_iter().collect();
    leftovers.sort_by(|a, b| a.0.cmp(&b.0));
    for (_, obj) in leftovers {
        target.push(None);
        live.push(Some(obj));
    }
    ReconciliationResult { target, live, hooks }
}
