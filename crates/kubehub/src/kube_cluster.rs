use std::fmt::Display;

use anyhow::Context;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::{
    api::{Api, ListParams},
    core::{DynamicObject, TypeMeta},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use tracing::{debug, info};

use keel_core::{Error, Manifest, Result};

use crate::{ApiResourceInfo, ResourceDiscovery, WatchEvent, WatchSource};

/// Discovery and list/watch against a live cluster through kube-rs.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn try_default() -> anyhow::Result<Self> {
        let client = Client::try_default().await.context("building kube client from default config")?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Dynamic API handle for a discovered resource, scoped when a namespace is given.
pub fn api_for(client: Client, info: &ApiResourceInfo, namespace: Option<&str>) -> Api<DynamicObject> {
    let ar = info.to_api_resource();
    match namespace {
        Some(ns) if info.namespaced && !ns.is_empty() => Api::namespaced_with(client, ns, &ar),
        _ => Api::all_with(client, &ar),
    }
}

/// Map a kube client error onto the engine taxonomy.
pub fn map_kube_error(e: kube::Error, what: impl Display) -> Error {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound(what.to_string()),
        kube::Error::Api(ae) if ae.code == 403 => Error::Permission(ae.message),
        kube::Error::Api(ae) if ae.code == 400 || ae.code == 422 => Error::Validation(ae.message),
        kube::Error::Api(ae) => Error::Mutation(ae.message),
        other => Error::Mutation(other.to_string()),
    }
}

/// List items come back without type metadata; fill it from discovery and drop managed fields.
fn normalize(mut obj: DynamicObject, info: &ApiResourceInfo) -> Manifest {
    if obj.types.as_ref().map(|t| t.kind.is_empty()).unwrap_or(true) {
        obj.types = Some(TypeMeta { api_version: info.gvk().api_version(), kind: info.kind.clone() });
    }
    obj.metadata.managed_fields = None;
    obj
}

#[async_trait::async_trait]
impl ResourceDiscovery for KubeCluster {
    async fn api_resources(&self) -> Result<Vec<ApiResourceInfo>> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| Error::Discovery(e.to_string()))?;
        let mut out = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                out.push(ApiResourceInfo {
                    group: ar.group.clone(),
                    version: ar.version.clone(),
                    kind: ar.kind.clone(),
                    plural: ar.plural.clone(),
                    namespaced: matches!(caps.scope, Scope::Namespaced),
                    verbs: caps.operations.iter().cloned().collect(),
                });
            }
        }
        out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
        debug!(count = out.len(), "discovered api resources");
        Ok(out)
    }
}

#[async_trait::async_trait]
impl WatchSource for KubeCluster {
    async fn list(&self, api: &ApiResourceInfo, namespace: Option<&str>) -> Result<(Vec<Manifest>, String)> {
        let handle = api_for(self.client.clone(), api, namespace);
        let list = handle.list(&ListParams::default()).await.map_err(|e| map_kube_error(e, api.gvk()))?;
        let version = list.metadata.resource_version.clone().unwrap_or_default();
        let items = list.items.into_iter().map(|o| normalize(o, api)).collect();
        Ok((items, version))
    }

    async fn get(&self, api: &ApiResourceInfo, name: &str, namespace: Option<&str>) -> Result<Manifest> {
        let handle = api_for(self.client.clone(), api, namespace);
        let obj = handle
            .get(name)
            .await
            .map_err(|e| map_kube_error(e, format!("{} {}/{name}", api.gvk(), namespace.unwrap_or_default())))?;
        Ok(normalize(obj, api))
    }

    fn watch(&self, api: &ApiResourceInfo, namespace: Option<&str>) -> BoxStream<'static, Result<WatchEvent>> {
        let handle = api_for(self.client.clone(), api, namespace);
        let info = api.clone();
        info!(gvk = %info.gvk(), ns = ?namespace, "watch started");
        watcher::watcher(handle, watcher::Config::default())
            .map(move |ev| match ev {
                Ok(Event::Applied(o)) => Ok(WatchEvent::Modified(normalize(o, &info))),
                Ok(Event::Deleted(o)) => Ok(WatchEvent::Deleted(normalize(o, &info))),
                Ok(Event::Restarted(list)) => {
                    debug!(gvk = %info.gvk(), count = list.len(), "watch restart");
                    Ok(WatchEvent::Resync {
                        items: list.into_iter().map(|o| normalize(o, &info)).collect(),
                        resource_version: String::new(),
                    })
                }
                Err(e) => Err(Error::Discovery(format!("watch {}: {e}", info.gvk()))),
            })
            .boxed()
    }
}
