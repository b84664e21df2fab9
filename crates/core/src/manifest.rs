use crate::{Error, Gvk, ResourceKey, Result};

/// A Kubernetes object as received from a source or from the cluster.
pub type Manifest = kube::core::DynamicObject;

/// Accessors shared by every component that inspects manifests.
///
/// Method names avoid the ones on `kube::ResourceExt` so both traits can be in scope.
pub trait ManifestExt {
    fn gvk(&self) -> Gvk;
    fn key(&self) -> ResourceKey;
    fn object_name(&self) -> &str;
    fn object_namespace(&self) -> &str;
    fn annotation(&self, key: &str) -> Option<&str>;
    /// Comma separated annotation values, trimmed, empty entries dropped.
    fn annotation_csv(&self, key: &str) -> Vec<String>;
    fn has_annotation_option(&self, key: &str, option: &str) -> bool {
        self.annotation_csv(key).iter().any(|v| v == option)
    }
    fn has_sync_option(&self, option: &str) -> bool {
        self.has_annotation_option(crate::annotations::SYNC_OPTIONS, option)
    }
    fn is_deleting(&self) -> bool;
}

impl ManifestExt for Manifest {
    fn gvk(&self) -> Gvk {
        match &self.types {
            Some(t) => Gvk::from_api_version(&t.api_version, &t.kind),
            None => Gvk::default(),
        }
    }

    fn key(&self) -> ResourceKey {
        let gvk = self.gvk();
        ResourceKey::new(gvk.group, gvk.kind, self.object_namespace(), self.object_name())
    }

    fn object_name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    fn object_namespace(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.as_ref().and_then(|a| a.get(key)).map(String::as_str)
    }

    fn annotation_csv(&self, key: &str) -> Vec<String> {
        self.annotation(key)
            .map(|v| v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
            .unwrap_or_default()
    }

    fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

/// Build a manifest from a JSON value, requiring `apiVersion` and `kind`.
pub fn manifest_from_value(value: serde_json::Value) -> Result<Manifest> {
    let obj: Manifest = serde_json::from_value(value)?;
    match &obj.types {
        Some(t) if !t.kind.is_empty() && !t.api_version.is_empty() => Ok(obj),
        _ => Err(Error::Manifest("object is missing apiVersion or kind".into())),
    }
}
