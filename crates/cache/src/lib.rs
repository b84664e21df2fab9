//! Keel cache: an eventually consistent in-memory mirror of one cluster.
//!
//! The mirror is filled by a full list per kind ([`ClusterCache::ensure_synced`]) and kept
//! current by one watch task per kind. Every mutation goes through a single write lock;
//! hierarchy and lookup queries take the read lock for their whole duration. Ownership is
//! computed from owner references at query time, including the implicit relationships
//! Kubernetes does not record (see `references`).

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, Instant};

use futures::StreamExt;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use keel_core::config::{env_millis, env_or, env_secs};
use keel_core::{Error, GroupKind, Gvk, Manifest, ManifestExt, ResourceKey, Result};
use keel_kubehub::{ApiResourceInfo, ClusterSource};

mod references;
mod resource;
mod watcher;

pub use resource::{ObjectRef, OwnerRef, Resource};
pub use watcher::Backoff;

/// Resources of one namespace ("" for cluster scoped), by key.
pub type NamespaceResources = FxHashMap<ResourceKey, Arc<Resource>>;

/// Computes caller data for a newly observed object. The flag is true for objects
/// without owner references; the returned flag decides whether the full manifest is kept.
pub type ResourceInfoHandler = Arc<dyn Fn(&Manifest, bool) -> (Option<serde_json::Value>, bool) + Send + Sync>;

/// Called after each upsert `(Some(new), old)` or removal `(None, Some(old))`, with the
/// resources of the affected namespace. Runs under the cache write lock and must not
/// call back into the cache.
pub type ResourceUpdatedHandler =
    Arc<dyn Fn(Option<&Resource>, Option<&Resource>, &NamespaceResources) + Send + Sync>;

/// Called for every watch event before it is applied.
pub type EventHandler = Arc<dyn Fn(EventType, &Manifest) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

impl EventType {
    fn as_str(self) -> &'static str {
        match self {
            EventType::Added => "added",
            EventType::Modified => "modified",
            EventType::Deleted => "deleted",
        }
    }
}

#[derive(Clone)]
pub struct Settings {
    /// Namespaces to mirror; empty mirrors the whole cluster.
    pub namespaces: Vec<String>,
    /// Mirror cluster scoped kinds when `namespaces` is set.
    pub cluster_resources: bool,
    pub list_concurrency: usize,
    pub watch_resync: Duration,
    pub watch_backoff_initial: Duration,
    pub watch_backoff_max: Duration,
    pub populate_info: Option<ResourceInfoHandler>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            namespaces: Vec::new(),
            cluster_resources: true,
            list_concurrency: 50,
            watch_resync: Duration::from_secs(600),
            watch_backoff_initial: Duration::from_millis(500),
            watch_backoff_max: Duration::from_secs(30),
            populate_info: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            list_concurrency: env_or("KEEL_LIST_CONCURRENCY", d.list_concurrency).max(1),
            watch_resync: env_secs("KEEL_WATCH_RESYNC_SECS", 600),
            watch_backoff_initial: env_millis("KEEL_WATCH_BACKOFF_INITIAL_MS", 500),
            watch_backoff_max: env_secs("KEEL_WATCH_BACKOFF_MAX_SECS", 30),
            ..d
        }
    }

    pub fn with_namespaces(mut self, namespaces: Vec<String>, cluster_resources: bool) -> Self {
        self.namespaces = namespaces;
        self.cluster_resources = cluster_resources;
        self
    }

    pub fn with_info_handler(mut self, handler: ResourceInfoHandler) -> Self {
        self.populate_info = Some(handler);
        self
    }
}

#[derive(Default)]
struct CacheState {
    resources: NamespaceResources,
    ns_index: FxHashMap<String, NamespaceResources>,
    apis: Vec<ApiResourceInfo>,
}

struct Registry<H> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, H)>>,
}

impl<H: Clone> Registry<H> {
    fn new() -> Arc<Self> {
        Arc::new(Self { next_id: AtomicU64::new(0), entries: Mutex::new(Vec::new()) })
    }

    fn add(self: &Arc<Self>, handler: H) -> Unsubscribe
    where
        H: Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).push((id, handler));
        let weak: Weak<Self> = Arc::downgrade(self);
        Unsubscribe(Box::new(move || {
            if let Some(registry) = weak.upgrade() {
                registry.entries.lock().unwrap_or_else(PoisonError::into_inner).retain(|(i, _)| *i != id);
            }
        }))
    }

    fn snapshot(&self) -> Vec<H> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).iter().map(|(_, h)| h.clone()).collect()
    }
}

/// Removes a handler registered with [`ClusterCache::on_resource_updated`] or [`ClusterCache::on_event`].
pub struct Unsubscribe(Box<dyn FnOnce() + Send + Sync>);

impl Unsubscribe {
    pub fn unsubscribe(self) {
        (self.0)()
    }
}

pub struct ClusterCache {
    source: Arc<dyn ClusterSource>,
    settings: Settings,
    state: RwLock<CacheState>,
    synced: tokio::sync::Mutex<bool>,
    watches: Mutex<Vec<JoinHandle<()>>>,
    updated_handlers: Arc<Registry<ResourceUpdatedHandler>>,
    event_handlers: Arc<Registry<EventHandler>>,
    epoch_tx: watch::Sender<u64>,
}

impl ClusterCache {
    pub fn new(source: Arc<dyn ClusterSource>, settings: Settings) -> Arc<Self> {
        let (epoch_tx, _) = watch::channel(0u64);
        Arc::new(Self {
            source,
            settings,
            state: RwLock::new(CacheState::default()),
            synced: tokio::sync::Mutex::new(false),
            watches: Mutex::new(Vec::new()),
            updated_handlers: Registry::new(),
            event_handlers: Registry::new(),
            epoch_tx,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub(crate) fn source(&self) -> Arc<dyn ClusterSource> {
        Arc::clone(&self.source)
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump_epoch(&self) {
        self.epoch_tx.send_modify(|e| *e = e.wrapping_add(1));
    }

    /// Receives a new value after every cache mutation.
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_tx.subscribe()
    }

    pub fn on_resource_updated(&self, handler: ResourceUpdatedHandler) -> Unsubscribe {
        self.updated_handlers.add(handler)
    }

    pub fn on_event(&self, handler: EventHandler) -> Unsubscribe {
        self.event_handlers.add(handler)
    }

    /// Lists every watchable kind and starts one watch task per kind (per namespace in
    /// namespaced mode). A failed discovery fails the call; a failed list of one kind is
    /// logged and left to that kind's watch task to retry. No-op once synced.
    pub async fn ensure_synced(self: &Arc<Self>) -> Result<()> {
        let mut synced = self.synced.lock().await;
        if *synced {
            return Ok(());
        }
        let started = Instant::now();
        let apis: Vec<ApiResourceInfo> = match self.source.api_resources().await {
            Ok(apis) => apis.into_iter().filter(ApiResourceInfo::is_watchable).collect(),
            Err(Error::Discovery(msg)) => return Err(Error::Discovery(msg)),
            Err(e) => return Err(Error::Discovery(e.to_string())),
        };
        self.write().apis = apis.clone();

        let scopes = self.watch_scopes(&apis);
        let listed: Vec<(ApiResourceInfo, Option<String>, bool)> = futures::stream::iter(scopes)
            .map(|(api, ns)| async move {
                let ok = match self.source.list(&api, ns.as_deref()).await {
                    Ok((items, version)) => {
                        self.replace_resource_cache(&api.group_kind(), &version, items, ns.as_deref().unwrap_or_default());
                        true
                    }
                    Err(e) => {
                        warn!(gk = %api.group_kind(), namespace = ?ns, error = %e, "initial list failed; watch will retry");
                        false
                    }
                };
                (api, ns, ok)
            })
            .buffer_unordered(self.settings.list_concurrency.max(1))
            .collect()
            .await;

        let mut watches = self.watches.lock().unwrap_or_else(PoisonError::into_inner);
        for (api, ns, ok) in listed {
            watches.push(tokio::spawn(watcher::run_watch(Arc::clone(self), api, ns, !ok)));
        }
        *synced = true;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!("keel_cache_sync_ms", elapsed_ms);
        info!(kinds = apis.len(), resources = self.read().resources.len(), elapsed_ms = elapsed_ms as u64, "cluster cache synced");
        Ok(())
    }

    fn watch_scopes(&self, apis: &[ApiResourceInfo]) -> Vec<(ApiResourceInfo, Option<String>)> {
        if self.settings.namespaces.is_empty() {
            return apis.iter().map(|a| (a.clone(), None)).collect();
        }
        let mut scopes = Vec::new();
        for api in apis {
            if api.namespaced {
                scopes.extend(self.settings.namespaces.iter().map(|ns| (api.clone(), Some(ns.clone()))));
            } else if self.settings.cluster_resources {
                scopes.push((api.clone(), None));
            }
        }
        scopes
    }

    /// Aborts all watch tasks. The mirrored state is kept.
    pub fn stop(&self) {
        for handle in self.watches.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            handle.abort();
        }
    }

    /// Stops watching and empties the mirror; the next [`ClusterCache::ensure_synced`] relists.
    pub async fn invalidate(&self) {
        let mut synced = self.synced.lock().await;
        self.stop();
        *self.write() = CacheState::default();
        *synced = false;
        self.bump_epoch();
        info!("cluster cache invalidated");
    }

    fn new_resource(&self, obj: &Manifest) -> Resource {
        let (owners, inferred) = references::resolve_references(obj);
        let (info, keep_manifest) = match &self.settings.populate_info {
            Some(handler) => handler(obj, owners.is_empty()),
            None => (None, true),
        };
        Resource::from_manifest(obj, owners, inferred, info, keep_manifest)
    }

    /// Apply one watch observation: upsert on Added/Modified, remove on Deleted.
    pub fn process_event(&self, event: EventType, obj: &Manifest) {
        metrics::counter!("keel_cache_events_total", 1u64, "event" => event.as_str());
        for handler in self.event_handlers.snapshot() {
            handler(event, obj);
        }
        let key = obj.key();
        {
            let mut state = self.write();
            match event {
                EventType::Deleted => self.on_node_removed(&mut state, &key),
                EventType::Added | EventType::Modified => {
                    let old = state.resources.get(&key).cloned();
                    let new = Arc::new(self.new_resource(obj));
                    self.on_node_updated(&mut state, old, new);
                }
            }
        }
        self.bump_epoch();
    }

    /// Replace every resource of `gk` (restricted to `namespace` unless empty) with a fresh list.
    /// Unchanged resource versions are left in place; other kinds are untouched.
    pub fn replace_resource_cache(&self, gk: &GroupKind, resource_version: &str, items: Vec<Manifest>, namespace: &str) {
        let fresh: Vec<Arc<Resource>> = items.iter().map(|o| Arc::new(self.new_resource(o))).collect();
        let fresh_keys: FxHashSet<ResourceKey> = fresh.iter().map(|r| r.key()).collect();
        {
            let mut state = self.write();
            for res in fresh {
                let old = state.resources.get(&res.key()).cloned();
                if old.as_ref().map(|o| o.resource_version != res.resource_version).unwrap_or(true) {
                    self.on_node_updated(&mut state, old, res);
                }
            }
            let stale: Vec<ResourceKey> = state
                .resources
                .keys()
                .filter(|k| k.group == gk.group && k.kind == gk.kind)
                .filter(|k| namespace.is_empty() || k.namespace == namespace)
                .filter(|k| !fresh_keys.contains(*k))
                .cloned()
                .collect();
            for key in &stale {
                self.on_node_removed(&mut state, key);
            }
            debug!(gk = %gk, resource_version, kept = fresh_keys.len(), removed = stale.len(), "replaced resources");
        }
        self.bump_epoch();
    }

    fn on_node_updated(&self, state: &mut CacheState, old: Option<Arc<Resource>>, new: Arc<Resource>) {
        let key = new.key();
        state.resources.insert(key.clone(), Arc::clone(&new));
        state.ns_index.entry(key.namespace.clone()).or_default().insert(key.clone(), Arc::clone(&new));
        let handlers = self.updated_handlers.snapshot();
        if handlers.is_empty() {
            return;
        }
        let ns = state.ns_index.get(&key.namespace);
        let empty = NamespaceResources::default();
        for handler in handlers {
            handler(Some(&new), old.as_deref(), ns.unwrap_or(&empty));
        }
    }

    fn on_node_removed(&self, state: &mut CacheState, key: &ResourceKey) {
        let Some(existing) = state.resources.remove(key) else {
            return;
        };
        if let Some(ns) = state.ns_index.get_mut(&key.namespace) {
            ns.remove(key);
            if ns.is_empty() {
                state.ns_index.remove(&key.namespace);
            }
        }
        let empty = NamespaceResources::default();
        let ns = state.ns_index.get(&key.namespace).unwrap_or(&empty);
        for handler in self.updated_handlers.snapshot() {
            handler(None, Some(&existing), ns);
        }
    }

    pub fn get_resource(&self, key: &ResourceKey) -> Option<Arc<Resource>> {
        self.read().resources.get(key).cloned()
    }

    /// Resources of `namespace` (all when empty) accepted by `predicate`.
    pub fn find_resources<F>(&self, namespace: &str, predicate: F) -> NamespaceResources
    where
        F: Fn(&Resource) -> bool,
    {
        let state = self.read();
        let source = if namespace.is_empty() { Some(&state.resources) } else { state.ns_index.get(namespace) };
        source
            .into_iter()
            .flatten()
            .filter(|(_, r)| predicate(r))
            .map(|(k, r)| (k.clone(), Arc::clone(r)))
            .collect()
    }

    /// Visits every transitive child of `key` exactly once, depth first, children in key order.
    ///
    /// `visit` returns whether to descend into the visited child. Children sharing a UID
    /// (one object served under two groups) are visited once, through the smallest key.
    /// A child that is also an ancestor is reported and skipped.
    ///
    /// The walk runs over a snapshot of the root's namespace taken under the read lock, so
    /// `visit` may call back into the cache. Changes it makes are not seen by the same walk.
    pub fn iterate_hierarchy<F>(&self, key: &ResourceKey, mut visit: F)
    where
        F: FnMut(&Resource, &NamespaceResources) -> bool,
    {
        let (root, ns_nodes) = {
            let state = self.read();
            let Some(root) = state.resources.get(key).cloned() else {
                return;
            };
            (root, state.ns_index.get(&key.namespace).cloned().unwrap_or_default())
        };
        let mut visited: FxHashSet<ResourceKey> = FxHashSet::default();
        visited.insert(key.clone());
        let mut ancestors = vec![key.clone()];
        walk_children(&root, &ns_nodes, &mut ancestors, &mut visited, &mut visit);
    }

    /// Live counterparts of `targets` plus every cached top-level object `is_managed` accepts.
    ///
    /// In namespaced mode a target outside the mirrored namespaces (or cluster scoped when
    /// cluster resources are not mirrored) is an error. A target cached without its manifest
    /// (see [`Settings::with_info_handler`]) is read from the cluster; targets absent from
    /// the mirror, or gone by the time they are read, are omitted.
    pub async fn get_managed_live_objs<F>(
        &self,
        targets: &[Manifest],
        is_managed: F,
    ) -> Result<FxHashMap<ResourceKey, Manifest>>
    where
        F: Fn(&Resource) -> bool,
    {
        let (mut managed, unloaded) = self.cached_managed_objs(targets, is_managed)?;
        if unloaded.is_empty() {
            return Ok(managed);
        }
        let fetched: Vec<(ResourceKey, Result<Manifest>)> = futures::stream::iter(unloaded)
            .map(|(key, api)| async move {
                let ns = (!key.namespace.is_empty()).then_some(key.namespace.as_str());
                let res = self.source.get(&api, &key.name, ns).await;
                (key, res)
            })
            .buffer_unordered(self.settings.list_concurrency.max(1))
            .collect()
            .await;
        for (key, res) in fetched {
            match res {
                Ok(manifest) => {
                    managed.insert(key, manifest);
                }
                Err(e) if e.is_not_found() => debug!(%key, "managed object gone before read"),
                Err(e) => return Err(e),
            }
        }
        Ok(managed)
    }

    /// Manifests already in the mirror, plus the targeted keys cached without one.
    fn cached_managed_objs<F>(
        &self,
        targets: &[Manifest],
        is_managed: F,
    ) -> Result<(FxHashMap<ResourceKey, Manifest>, Vec<(ResourceKey, ApiResourceInfo)>)>
    where
        F: Fn(&Resource) -> bool,
    {
        let state = self.read();
        if !self.settings.namespaces.is_empty() {
            for t in targets {
                let ns = t.object_namespace();
                let kind = t.gvk().kind;
                if ns.is_empty() && !self.settings.cluster_resources {
                    return Err(Error::Validation(format!(
                        "Cluster level {kind} {:?} can not be managed when in namespaced mode",
                        t.object_name()
                    )));
                }
                if !ns.is_empty() && !self.settings.namespaces.iter().any(|n| n == ns) {
                    return Err(Error::Validation(format!(
                        "Namespace {ns:?} for {kind} {:?} is not managed",
                        t.object_name()
                    )));
                }
            }
        }

        let mut managed: FxHashMap<ResourceKey, Manifest> = FxHashMap::default();
        for (key, res) in &state.resources {
            let Some(manifest) = &res.manifest else { continue };
            if is_managed(res) && is_top_level(&state, res) {
                managed.insert(key.clone(), manifest.as_ref().clone());
            }
        }
        let mut unloaded = Vec::new();
        for t in targets {
            let key = t.key();
            if managed.contains_key(&key) {
                continue;
            }
            let Some(res) = state.resources.get(&key) else { continue };
            match &res.manifest {
                Some(manifest) => {
                    managed.insert(key, manifest.as_ref().clone());
                }
                None => match served_api(&state.apis, &t.gvk()) {
                    Some(api) => unloaded.push((key, api)),
                    None => warn!(%key, "cached without manifest and kind is not served; skipping"),
                },
            }
        }
        Ok((managed, unloaded))
    }

    /// Roots of the ownership trees in `namespace`.
    pub fn get_namespace_top_level_resources(&self, namespace: &str) -> NamespaceResources {
        let state = self.read();
        state
            .ns_index
            .get(namespace)
            .into_iter()
            .flatten()
            .filter(|(_, r)| is_top_level(&state, r))
            .map(|(k, r)| (k.clone(), Arc::clone(r)))
            .collect()
    }

    pub fn is_namespaced(&self, gk: &GroupKind) -> Result<bool> {
        keel_kubehub::is_namespaced(&self.read().apis, gk)
            .ok_or_else(|| Error::NotFound(format!("server resource for {gk}")))
    }

    pub fn get_api_resources(&self) -> Vec<ApiResourceInfo> {
        self.read().apis.clone()
    }

    pub fn len(&self) -> usize {
        self.read().resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Served version of `gvk`, falling back to any served version of its group/kind.
fn served_api(apis: &[ApiResourceInfo], gvk: &Gvk) -> Option<ApiResourceInfo> {
    apis.iter()
        .find(|a| a.group == gvk.group && a.kind == gvk.kind && a.version == gvk.version)
        .or_else(|| apis.iter().find(|a| a.group == gvk.group && a.kind == gvk.kind))
        .cloned()
}

fn is_top_level(state: &CacheState, res: &Resource) -> bool {
    if !res.owner_refs.is_empty() {
        return false;
    }
    if !res.might_have_inferred_owner() {
        return true;
    }
    let key = res.key();
    !state
        .ns_index
        .get(&key.namespace)
        .map(|ns| ns.values().any(|p| p.is_inferred_parent_of(&key)))
        .unwrap_or(false)
}

fn children_of<'a>(parent: &Resource, ns_nodes: &'a NamespaceResources) -> Vec<&'a Arc<Resource>> {
    let mut children: Vec<(ResourceKey, &'a Arc<Resource>)> = ns_nodes
        .iter()
        .filter(|(_, child)| parent.is_parent_of(child))
        .map(|(k, child)| (k.clone(), child))
        .collect();
    children.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));
    let mut seen_uids: FxHashSet<&str> = FxHashSet::default();
    children
        .into_iter()
        .filter(|(_, c)| c.reference.uid.is_empty() || seen_uids.insert(c.reference.uid.as_str()))
        .map(|(_, c)| c)
        .collect()
}

fn walk_children<F>(
    parent: &Resource,
    ns_nodes: &NamespaceResources,
    ancestors: &mut Vec<ResourceKey>,
    visited: &mut FxHashSet<ResourceKey>,
    visit: &mut F,
) where
    F: FnMut(&Resource, &NamespaceResources) -> bool,
{
    for child in children_of(parent, ns_nodes) {
        let child_key = child.key();
        if ancestors.contains(&child_key) {
            warn!(child = %child_key, parent = %parent.key(), "circular dependency detected; child is also an ancestor");
            continue;
        }
        if !visited.insert(child_key.clone()) {
            continue;
        }
        if visit(child, ns_nodes) {
            ancestors.push(child_key);
            walk_children(child, ns_nodes, ancestors, visited, visit);
            ancestors.pop();
        }
    }
}
