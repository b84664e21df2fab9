//! Sync tasks and their ordering.

use std::cmp::Ordering;

use rustc_hash::FxHashMap;

use keel_core::annotations::SYNC_OPTION_PRUNE_LAST;
use keel_core::{HookDeletePolicy, HookType, Manifest, ManifestExt, OperationPhase, ResourceKey, ResultCode, SyncPhase};

use crate::hook;

/// Kinds applied before all others, in order. Unlisted kinds (custom resources
/// included) rank 0, after every listed kind.
const KIND_ORDER: [&str; 35] = [
    "Namespace",
    "NetworkPolicy",
    "ResourceQuota",
    "LimitRange",
    "PodSecurityPolicy",
    "PodDisruptionBudget",
    "ServiceAccount",
    "Secret",
    "SecretList",
    "ConfigMap",
    "StorageClass",
    "PersistentVolume",
    "PersistentVolumeClaim",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleList",
    "ClusterRoleBinding",
    "ClusterRoleBindingList",
    "Role",
    "RoleList",
    "RoleBinding",
    "RoleBindingList",
    "Service",
    "DaemonSet",
    "Pod",
    "ReplicationController",
    "ReplicaSet",
    "Deployment",
    "HorizontalPodAutoscaler",
    "StatefulSet",
    "Job",
    "CronJob",
    "IngressClass",
    "Ingress",
    "APIService",
];

/// Priority of a kind; lower applies first.
pub fn kind_order(kind: &str) -> i32 {
    match KIND_ORDER.iter().position(|k| *k == kind) {
        Some(i) => i as i32 - KIND_ORDER.len() as i32,
        None => 0,
    }
}

pub(crate) const CRD_GROUP: &str = "apiextensions.k8s.io";
pub(crate) const CRD_KIND: &str = "CustomResourceDefinition";

pub(crate) fn is_crd(obj: &Manifest) -> bool {
    let gvk = obj.gvk();
    gvk.group == CRD_GROUP && gvk.kind == CRD_KIND
}

/// `group/kind` served by a CRD manifest.
pub(crate) fn crd_group_kind(obj: &Manifest) -> Option<String> {
    if !is_crd(obj) {
        return None;
    }
    let group = obj.data.pointer("/spec/group")?.as_str()?;
    let kind = obj.data.pointer("/spec/names/kind")?.as_str()?;
    Some(format!("{group}/{kind}"))
}

#[derive(Debug, Clone)]
enum Objects {
    Apply { target: Manifest, live: Option<Manifest> },
    Prune { live: Manifest },
}

/// One unit of work in one phase: apply `target` (creating it when there is no live
/// object) or prune `live`.
#[derive(Debug, Clone)]
pub struct SyncTask {
    pub phase: SyncPhase,
    objects: Objects,
    pub skip_dry_run: bool,
    pub wave_override: Option<i32>,
    pub sync_status: Option<ResultCode>,
    pub operation_state: OperationPhase,
    pub message: String,
}

impl SyncTask {
    fn with_objects(phase: SyncPhase, objects: Objects) -> Self {
        Self {
            phase,
            objects,
            skip_dry_run: false,
            wave_override: None,
            sync_status: None,
            operation_state: OperationPhase::Pending,
            message: String::new(),
        }
    }

    pub fn apply(phase: SyncPhase, target: Manifest, live: Option<Manifest>) -> Self {
        Self::with_objects(phase, Objects::Apply { target, live })
    }

    pub fn prune(phase: SyncPhase, live: Manifest) -> Self {
        Self::with_objects(phase, Objects::Prune { live })
    }

    /// `None` when both sides are missing.
    pub fn from_pair(phase: SyncPhase, target: Option<Manifest>, live: Option<Manifest>) -> Option<Self> {
        match (target, live) {
            (Some(target), live) => Some(Self::apply(phase, target, live)),
            (None, Some(live)) => Some(Self::prune(phase, live)),
            (None, None) => None,
        }
    }

    pub fn target(&self) -> Option<&Manifest> {
        match &self.objects {
            Objects::Apply { target, .. } => Some(target),
            Objects::Prune { .. } => None,
        }
    }

    pub(crate) fn target_mut(&mut self) -> Option<&mut Manifest> {
        match &mut self.objects {
            Objects::Apply { target, .. } => Some(target),
            Objects::Prune { .. } => None,
        }
    }

    pub fn live(&self) -> Option<&Manifest> {
        match &self.objects {
            Objects::Apply { live, .. } => live.as_ref(),
            Objects::Prune { live } => Some(live),
        }
    }

    /// Replace the live side of an apply task; prune tasks keep theirs.
    pub(crate) fn set_live(&mut self, obj: Manifest) {
        if let Objects::Apply { live, .. } = &mut self.objects {
            *live = Some(obj);
        }
    }

    /// The target when there is one, otherwise the live object.
    pub fn obj(&self) -> &Manifest {
        match &self.objects {
            Objects::Apply { target, .. } => target,
            Objects::Prune { live } => live,
        }
    }

    pub fn key(&self) -> ResourceKey {
        self.obj().key()
    }

    pub fn result_key(&self) -> (ResourceKey, SyncPhase) {
        (self.key(), self.phase)
    }

    pub fn kind(&self) -> String {
        self.obj().gvk().kind
    }

    pub fn name(&self) -> &str {
        self.obj().object_name()
    }

    pub fn version(&self) -> String {
        self.obj().gvk().version
    }

    pub fn is_prune(&self) -> bool {
        matches!(self.objects, Objects::Prune { .. })
    }

    pub fn is_hook(&self) -> bool {
        hook::is_hook(self.obj())
    }

    pub fn hook_type(&self) -> Option<HookType> {
        self.is_hook().then(|| HookType::from_phase(self.phase))
    }

    /// Wave override if set, otherwise the wave annotated on the target (or on the live
    /// object for prunes).
    pub fn wave(&self) -> i32 {
        self.wave_override.unwrap_or_else(|| hook::wave(self.obj()))
    }

    pub fn pending(&self) -> bool {
        self.operation_state.is_pending()
    }

    pub fn running(&self) -> bool {
        self.operation_state.is_running()
    }

    pub fn completed(&self) -> bool {
        self.operation_state.is_completed()
    }

    pub fn successful(&self) -> bool {
        self.operation_state.is_successful()
    }

    fn has_hook_delete_policy(&self, policy: HookDeletePolicy) -> bool {
        self.is_hook() && hook::delete_policies(self.obj()).contains(&policy)
    }

    /// A previous instance of this hook must go before it is applied again.
    pub fn delete_before_creation(&self) -> bool {
        self.live().is_some() && self.pending() && self.has_hook_delete_policy(HookDeletePolicy::BeforeHookCreation)
    }

    pub fn delete_on_phase_successful(&self) -> bool {
        self.has_hook_delete_policy(HookDeletePolicy::HookSucceeded)
    }

    pub fn delete_on_phase_failed(&self) -> bool {
        self.has_hook_delete_policy(HookDeletePolicy::HookFailed)
    }

    fn namespace_provided(&self) -> Option<String> {
        let gvk = self.obj().gvk();
        (!self.is_prune() && gvk.group.is_empty() && gvk.kind == "Namespace").then(|| self.name().to_string())
    }

    fn namespace_referenced(&self) -> Option<String> {
        Some(self.obj().object_namespace()).filter(|ns| !ns.is_empty()).map(str::to_string)
    }

    fn crd_provided(&self) -> Option<String> {
        if self.is_prune() {
            return None;
        }
        crd_group_kind(self.obj())
    }

    fn crd_referenced(&self) -> Option<String> {
        let gvk = self.obj().gvk();
        Some(format!("{}/{}", gvk.group, gvk.kind))
    }
}

fn compare(a: &SyncTask, b: &SyncTask) -> Ordering {
    a.phase
        .cmp(&b.phase)
        .then_with(|| kind_order(&a.kind()).cmp(&kind_order(&b.kind())))
        .then_with(|| a.wave().cmp(&b.wave()))
        .then_with(|| a.name().cmp(b.name()))
        .then_with(|| a.key().cmp(&b.key()))
}

/// Order tasks by phase, kind priority, wave and name, after pulling namespaces and
/// CRDs forward to the earliest (phase, wave) of the tasks that need them.
pub fn sort_tasks(tasks: &mut [SyncTask]) {
    adjust_dependencies(tasks, SyncTask::namespace_provided, SyncTask::namespace_referenced);
    adjust_dependencies(tasks, SyncTask::crd_provided, SyncTask::crd_referenced);
    tasks.sort_by(compare);
}

fn adjust_dependencies(
    tasks: &mut [SyncTask],
    provides: fn(&SyncTask) -> Option<String>,
    references: fn(&SyncTask) -> Option<String>,
) {
    let mut earliest: FxHashMap<String, (SyncPhase, i32)> = FxHashMap::default();
    for t in tasks.iter().filter(|t| !t.is_prune() && provides(t).is_none()) {
        if let Some(dep) = references(t) {
            let at = (t.phase, t.wave());
            earliest.entry(dep).and_modify(|e| *e = (*e).min(at)).or_insert(at);
        }
    }
    for t in tasks.iter_mut() {
        let Some(dep) = provides(t) else { continue };
        if let Some(&(phase, wave)) = earliest.get(&dep) {
            if (phase, wave) < (t.phase, t.wave()) {
                t.phase = phase;
                t.wave_override = Some(wave);
            }
        }
    }
}

/// Mirror prune waves so deletion runs in reverse creation order, then move prune
/// tasks marked prune-last (or all of them with `prune_last`) after the last `Sync` wave.
pub fn adjust_prune_waves(tasks: &mut [SyncTask], prune_last: bool) {
    let mut waves: Vec<i32> = tasks.iter().filter(|t| t.is_prune()).map(SyncTask::wave).collect();
    waves.sort_unstable();
    waves.dedup();
    let mirrored: FxHashMap<i32, i32> = waves.iter().zip(waves.iter().rev()).map(|(a, b)| (*a, *b)).collect();
    for t in tasks.iter_mut().filter(|t| t.is_prune()) {
        if let Some(&w) = mirrored.get(&t.wave()) {
            t.wave_override = Some(w);
        }
    }

    let last_sync_wave = tasks
        .iter()
        .filter(|t| t.phase == SyncPhase::Sync && !t.is_prune())
        .map(SyncTask::wave)
        .fold(0, i32::max)
        + 1;
    for t in tasks.iter_mut().filter(|t| t.is_prune()) {
        if prune_last || t.obj().has_sync_option(SYNC_OPTION_PRUNE_LAST) {
            t.wave_override = Some(last_sync_wave);
        }
    }
}

/// Lowest and highest `(phase, wave)` among `tasks`.
pub fn phase_wave_bounds(tasks: &[SyncTask]) -> Option<((SyncPhase, i32), (SyncPhase, i32))> {
    let mut it = tasks.iter().map(|t| (t.phase, t.wave()));
    let first = it.next()?;
    Some(it.fold((first, first), |(lo, hi), at| (lo.min(at), hi.max(at))))
}

/// More than one (phase, wave) step remains.
pub fn multi_step(tasks: &[SyncTask]) -> bool {
    matches!(phase_wave_bounds(tasks), Some((lo, hi)) if lo != hi)
}
