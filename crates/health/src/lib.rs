//! Keel health: maps a live object to a health status without cluster I/O.
//!
//! Rules are registered per `(group, kind)` in a [`HealthRegistry`]; the default
//! registry covers the built-in workload, networking and batch kinds plus a few
//! well-known custom resources. Rule errors never escape: they become `Unknown`.

#![forbid(unsafe_code)]

use anyhow::Context;
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use tracing::debug;

use keel_core::{HealthStatus, HealthStatusCode, Manifest, ManifestExt, Result};

mod apps;
mod batch;
mod core_kinds;
mod custom;

/// Caller-supplied health for kinds the built-in rules do not know (or should not decide).
pub trait HealthOverride: Send + Sync {
    /// `Ok(None)` defers to the built-in rules.
    fn get_resource_health(&self, obj: &Manifest) -> Result<Option<HealthStatus>>;
}

pub type HealthRule = fn(&Manifest) -> anyhow::Result<HealthStatus>;

#[derive(Clone, Default)]
pub struct HealthRegistry {
    rules: FxHashMap<(String, String), HealthRule>,
}

impl HealthRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Registry with every built-in rule.
    pub fn with_defaults() -> Self {
        let mut r = Self::empty();
        for group in ["apps", "extensions"] {
            r.register(group, "Deployment", apps::deployment);
            r.register(group, "StatefulSet", apps::stateful_set);
            r.register(group, "ReplicaSet", apps::replica_set);
            r.register(group, "DaemonSet", apps::daemon_set);
            r.register(group, "Ingress", core_kinds::ingress);
        }
        r.register("networking.k8s.io", "Ingress", core_kinds::ingress);
        r.register("", "Service", core_kinds::service);
        r.register("", "PersistentVolumeClaim", core_kinds::pvc);
        r.register("", "Pod", core_kinds::pod);
        r.register("batch", "Job", batch::job);
        r.register("apiregistration.k8s.io", "APIService", custom::api_service);
        r.register("argoproj.io", "Application", custom::application);
        r.register("argoproj.io", "Workflow", custom::workflow);
        r
    }

    pub fn register(&mut self, group: &str, kind: &str, rule: HealthRule) {
        self.rules.insert((group.to_string(), kind.to_string()), rule);
    }

    pub fn rule(&self, group: &str, kind: &str) -> Option<HealthRule> {
        self.rules.get(&(group.to_string(), kind.to_string())).copied()
    }

    /// Health of `obj`, or `None` when no rule applies to its kind.
    pub fn assess(&self, obj: &Manifest, health_override: Option<&dyn HealthOverride>) -> Option<HealthStatus> {
        if obj.is_deleting() {
            return Some(HealthStatus::progressing("Pending deletion"));
        }
        if let Some(o) = health_override {
            match o.get_resource_health(obj) {
                Ok(Some(h)) => return Some(h),
                Ok(None) => {}
                Err(e) => {
                    debug!(key = %obj.key(), error = %e, "health override failed");
                    return Some(HealthStatus::unknown(e.to_string()));
                }
            }
        }
        let gvk = obj.gvk();
        let rule = self.rule(&gvk.group, &gvk.kind)?;
        match rule(obj) {
            Ok(h) => Some(h),
            Err(e) => {
                debug!(key = %obj.key(), error = %e, "health rule failed");
                Some(HealthStatus::unknown(format!("{e:#}")))
            }
        }
    }
}

static DEFAULT_REGISTRY: Lazy<HealthRegistry> = Lazy::new(HealthRegistry::with_defaults);

pub fn default_registry() -> &'static HealthRegistry {
    &DEFAULT_REGISTRY
}

/// Assess `obj` with the default rules.
pub fn get_resource_health(obj: &Manifest, health_override: Option<&dyn HealthOverride>) -> Option<HealthStatus> {
    DEFAULT_REGISTRY.assess(obj, health_override)
}

/// True when `new` is strictly worse than `current`:
/// Healthy < Suspended < Progressing < Degraded < Missing < Unknown.
pub fn is_worse(current: HealthStatusCode, new: HealthStatusCode) -> bool {
    new.severity() > current.severity()
}

/// Worst status among `codes`, `None` for an empty input.
pub fn worst<I: IntoIterator<Item = HealthStatusCode>>(codes: I) -> Option<HealthStatusCode> {
    codes.into_iter().fold(None, |acc, c| match acc {
        Some(cur) if !is_worse(cur, c) => Some(cur),
        _ => Some(c),
    })
}

/// Re-read a dynamic object as a typed k8s-openapi resource, whatever API version it was served under.
pub(crate) fn convert<K>(obj: &Manifest) -> anyhow::Result<K>
where
    K: k8s_openapi::Resource + DeserializeOwned,
{
    let mut value = serde_json::to_value(obj)?;
    if let Some(map) = value.as_object_mut() {
        map.insert("apiVersion".into(), K::API_VERSION.into());
        map.insert("kind".into(), K::KIND.into());
    }
    serde_json::from_value(value).with_context(|| format!("failed to convert {} to {}", obj.gvk(), K::KIND))
}

/// Field of the free-form body (`status.phase` as `["status", "phase"]`).
pub(crate) fn str_at<'a>(obj: &'a Manifest, path: &[&str]) -> Option<&'a str> {
    path.iter().try_fold(&obj.data, |v, p| v.get(p)).and_then(|v| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use HealthStatusCode::*;

    const ALL: [HealthStatusCode; 6] = [Healthy, Suspended, Progressing, Degraded, Missing, Unknown];

    #[test]
    fn is_worse_is_a_strict_total_order() {
        for a in ALL {
            for b in ALL {
                let outcomes = [is_worse(a, b), is_worse(b, a), a == b];
                assert_eq!(outcomes.iter().filter(|x| **x).count(), 1, "{a} vs {b}");
            }
        }
        for c in ALL.iter().filter(|c| **c != Unknown) {
            assert!(is_worse(*c, Unknown));
            assert!(!is_worse(*c, Healthy));
        }
    }

    #[test]
    fn suspended_never_masks_degraded() {
        assert_eq!(worst([Healthy, Suspended, Degraded, Progressing]), Some(Degraded));
        assert_eq!(worst([Suspended, Healthy]), Some(Suspended));
        assert_eq!(worst(Vec::new()), None);
    }
}
