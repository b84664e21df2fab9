use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;

use keel_core::{Gvk, Manifest, ManifestExt, ResourceKey};

/// Owner reference as observed on a child, explicit or implicit.
#[derive(Debug, Clone, Default)]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    uid: String,
    inferred_uid: OnceLock<String>,
}

impl OwnerRef {
    pub fn new(api_version: &str, kind: &str, name: &str, uid: &str) -> Self {
        Self {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
            inferred_uid: OnceLock::new(),
        }
    }

    /// Declared UID, or the one back-filled from the first matching parent.
    pub fn uid(&self) -> Option<&str> {
        if !self.uid.is_empty() {
            return Some(&self.uid);
        }
        self.inferred_uid.get().map(String::as_str)
    }
}

/// Identity of a cached object including its API version and UID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectRef {
    pub gvk: Gvk,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

/// One cache entry.
#[derive(Debug, Clone)]
pub struct Resource {
    pub resource_version: String,
    pub reference: ObjectRef,
    pub owner_refs: Vec<OwnerRef>,
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Caller-attached data computed when the object was observed.
    pub info: Option<serde_json::Value>,
    pub manifest: Option<Arc<Manifest>>,
    /// Children this resource owns without recording it on them (StatefulSet claims).
    pub(crate) inferred_children: Vec<Regex>,
}

impl Resource {
    pub fn key(&self) -> ResourceKey {
        let r = &self.reference;
        ResourceKey::new(&r.gvk.group, &r.gvk.kind, &r.namespace, &r.name)
    }

    pub(crate) fn from_manifest(
        obj: &Manifest,
        owner_refs: Vec<OwnerRef>,
        inferred_children: Vec<Regex>,
        info: Option<serde_json::Value>,
        keep_manifest: bool,
    ) -> Self {
        Self {
            resource_version: obj.metadata.resource_version.clone().unwrap_or_default(),
            reference: ObjectRef {
                gvk: obj.gvk(),
                namespace: obj.object_namespace().to_string(),
                name: obj.object_name().to_string(),
                uid: obj.metadata.uid.clone().unwrap_or_default(),
            },
            owner_refs,
            creation_timestamp: obj.metadata.creation_timestamp.as_ref().map(|t| t.0),
            info,
            manifest: keep_manifest.then(|| Arc::new(obj.clone())),
            inferred_children,
        }
    }

    /// True when `child` names this resource as owner, explicitly or through an implicit rule.
    ///
    /// An owner reference without a UID that matches this resource by kind and name gets
    /// this resource's UID back-filled, so later comparisons use the UID.
    pub fn is_parent_of(&self, child: &Resource) -> bool {
        let uid = self.reference.uid.as_str();
        for owner in &child.owner_refs {
            match owner.uid() {
                Some(owner_uid) => {
                    if !uid.is_empty() && owner_uid == uid {
                        return true;
                    }
                }
                None => {
                    if owner.kind == self.reference.gvk.kind && owner.name == self.reference.name {
                        if !uid.is_empty() {
                            let _ = owner.inferred_uid.set(uid.to_string());
                        }
                        return true;
                    }
                }
            }
        }
        self.is_inferred_parent_of(&child.key())
    }

    pub fn is_inferred_parent_of(&self, key: &ResourceKey) -> bool {
        key.group.is_empty()
            && key.kind == "PersistentVolumeClaim"
            && self.inferred_children.iter().any(|re| re.is_match(&key.name))
    }

    /// Could be claimed by an inferred parent (see [`Resource::is_inferred_parent_of`]).
    pub(crate) fn might_have_inferred_owner(&self) -> bool {
        self.reference.gvk.group.is_empty() && self.reference.gvk.kind == "PersistentVolumeClaim"
    }
}
