//! Lifecycle hook classification.
//!
//! Two annotation schemes are understood: the native `argocd.argoproj.io/hook*` keys and
//! Helm's `helm.sh/hook*` keys. When the native hook annotation is present the Helm
//! ones are not consulted at all.

use keel_core::annotations::{HELM_HOOK, HELM_HOOK_DELETE_POLICY, HELM_HOOK_WEIGHT, HOOK, HOOK_DELETE_POLICY, SYNC_WAVE};
use keel_core::{HookDeletePolicy, HookType, Manifest, ManifestExt, SyncPhase};

/// Helm marks CRDs with this value; they are never hooks.
const HELM_CRD_INSTALL: &str = "crd-install";

fn helm_hook_type(value: &str) -> Option<HookType> {
    match value {
        "pre-install" | "pre-upgrade" => Some(HookType::PreSync),
        "post-install" | "post-upgrade" => Some(HookType::PostSync),
        _ => None,
    }
}

fn helm_delete_policy(value: &str) -> Option<HookDeletePolicy> {
    match value {
        "before-hook-creation" => Some(HookDeletePolicy::BeforeHookCreation),
        "hook-succeeded" => Some(HookDeletePolicy::HookSucceeded),
        "hook-failed" => Some(HookDeletePolicy::HookFailed),
        _ => None,
    }
}

fn push_unique<T: PartialEq>(out: &mut Vec<T>, v: T) {
    if !out.contains(&v) {
        out.push(v);
    }
}

fn has_native_hook(obj: &Manifest) -> bool {
    obj.annotation(HOOK).is_some()
}

fn is_helm_hook(obj: &Manifest) -> bool {
    matches!(obj.annotation(HELM_HOOK), Some(v) if v != HELM_CRD_INSTALL)
}

/// True for objects whose lifecycle is tied to a sync phase.
pub fn is_hook(obj: &Manifest) -> bool {
    if has_native_hook(obj) {
        return !skip(obj);
    }
    is_helm_hook(obj)
}

/// Declared hook types in declaration order, duplicates and unknown values dropped.
pub fn types(obj: &Manifest) -> Vec<HookType> {
    let mut out = Vec::new();
    if has_native_hook(obj) {
        for v in obj.annotation_csv(HOOK) {
            if let Some(t) = HookType::parse(&v) {
                push_unique(&mut out, t);
            }
        }
        return out;
    }
    for v in obj.annotation_csv(HELM_HOOK) {
        if let Some(t) = helm_hook_type(&v) {
            push_unique(&mut out, t);
        }
    }
    out
}

/// An object annotated only with `Skip` is never synced.
pub fn skip(obj: &Manifest) -> bool {
    types(obj) == [HookType::Skip]
}

/// A hook whose annotation values are all unrecognised.
pub fn ignore(obj: &Manifest) -> bool {
    is_hook(obj) && types(obj).is_empty()
}

/// Union of native and Helm delete policies; hooks default to `BeforeHookCreation`.
pub fn delete_policies(obj: &Manifest) -> Vec<HookDeletePolicy> {
    let mut out = Vec::new();
    for v in obj.annotation_csv(HOOK_DELETE_POLICY) {
        if let Some(p) = HookDeletePolicy::parse(&v) {
            push_unique(&mut out, p);
        }
    }
    for v in obj.annotation_csv(HELM_HOOK_DELETE_POLICY) {
        if let Some(p) = helm_delete_policy(&v) {
            push_unique(&mut out, p);
        }
    }
    if out.is_empty() && is_hook(obj) {
        out.push(HookDeletePolicy::BeforeHookCreation);
    }
    out
}

/// Sync wave: the native annotation if it parses, else the Helm weight, else 0.
pub fn wave(obj: &Manifest) -> i32 {
    [SYNC_WAVE, HELM_HOOK_WEIGHT]
        .iter()
        .find_map(|k| obj.annotation(k).and_then(|v| v.trim().parse().ok()))
        .unwrap_or(0)
}

/// Phases an object takes part in: its hook phases, `Sync` for plain resources,
/// nothing for skipped ones.
pub fn sync_phases(obj: &Manifest) -> Vec<SyncPhase> {
    if skip(obj) {
        return Vec::new();
    }
    if !is_hook(obj) {
        return vec![SyncPhase::Sync];
    }
    let mut phases = Vec::new();
    for t in types(obj) {
        if let Some(p) = t.phase() {
            push_unique(&mut phases, p);
        }
    }
    phases
}
