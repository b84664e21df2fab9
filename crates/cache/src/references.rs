//! Ownership Kubernetes does not record through owner references.

use regex::Regex;
use tracing::warn;

use keel_core::annotations::{SERVICE_ACCOUNT_NAME, SERVICE_ACCOUNT_UID};
use keel_core::{Manifest, ManifestExt};

use crate::resource::OwnerRef;

const SERVICE_ACCOUNT_TOKEN: &str = "kubernetes.io/service-account-token";

/// Owner references of `obj` plus implicit ones, and the claim-name patterns of the
/// children it owns by inference.
pub(crate) fn resolve_references(obj: &Manifest) -> (Vec<OwnerRef>, Vec<Regex>) {
    let mut owners: Vec<OwnerRef> = obj
        .metadata
        .owner_references
        .iter()
        .flatten()
        .map(|r| OwnerRef::new(&r.api_version, &r.kind, &r.name, &r.uid))
        .collect();
    let mut inferred = Vec::new();
    let gvk = obj.gvk();

    match (gvk.group.as_str(), gvk.kind.as_str()) {
        ("", "Endpoints") if owners.is_empty() => {
            owners.push(OwnerRef::new("v1", "Service", obj.object_name(), ""));
        }
        ("", "Secret") => {
            if let Some(owner) = service_account_of_token(obj) {
                owners.push(owner);
            }
        }
        ("apps" | "extensions", "StatefulSet") => inferred = claim_patterns(obj),
        _ => {}
    }
    (owners, inferred)
}

fn service_account_of_token(obj: &Manifest) -> Option<OwnerRef> {
    if obj.data.get("type").and_then(|v| v.as_str()) != Some(SERVICE_ACCOUNT_TOKEN) {
        return None;
    }
    let name = obj.annotation(SERVICE_ACCOUNT_NAME).filter(|s| !s.is_empty())?;
    let uid = obj.annotation(SERVICE_ACCOUNT_UID).filter(|s| !s.is_empty())?;
    Some(OwnerRef::new("v1", "ServiceAccount", name, uid))
}

/// Claims created from `volumeClaimTemplates` are named `<template>-<statefulset>-<ordinal>`.
fn claim_patterns(obj: &Manifest) -> Vec<Regex> {
    let sts = obj.object_name();
    let templates = obj
        .data
        .pointer("/spec/volumeClaimTemplates")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    templates
        .iter()
        .filter_map(|t| t.pointer("/metadata/name").and_then(|n| n.as_str()))
        .filter_map(|template| {
            let pattern = format!(r"^{}-{}-\d+$", regex::escape(template), regex::escape(sts));
            match Regex::new(&pattern) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(statefulset = sts, error = %e, "failed to build claim pattern");
                    None
                }
            }
        })
        .collect()
}
