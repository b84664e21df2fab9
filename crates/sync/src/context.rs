//! The sync state machine.
//!
//! A [`SyncContext`] owns one operation. Every call to [`SyncContext::sync`] re-plans the
//! tasks from the reconciliation, re-attaches the results recorded so far and then moves
//! the operation forward by at most one (phase, wave) step. Callers poll it until the
//! phase is terminal; [`crate::SyncRunner`] does that on a timer.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::{future, stream, StreamExt};
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use tracing::{debug, info, info_span, warn, Instrument};

use keel_core::annotations::{SYNC_OPTION_SKIP_DRY_RUN_ON_MISSING_RESOURCE, SYNC_OPTION_VALIDATE_DISABLED};
use keel_core::{
    manifest_from_value, Error, Gvk, HealthStatusCode, Manifest, ManifestExt, OperationPhase, OperationState,
    ResourceKey, ResourceSyncResult, Result, ResultCode, SyncPhase,
};
use keel_health::{get_resource_health, HealthOverride};
use keel_kubehub::{find_server_resource, ApiResourceInfo, ApplyOptions, ClusterOps, ResourceDiscovery};

use crate::hook;
use crate::options::SyncOptions;
use crate::reconcile::ReconciliationResult;
use crate::task::{
    adjust_prune_waves, crd_group_kind, is_crd, multi_step, phase_wave_bounds, sort_tasks, SyncTask, CRD_GROUP,
    CRD_KIND,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Successful,
    Pending,
    Failed,
}

impl RunState {
    fn merge(self, other: RunState) -> RunState {
        match (self, other) {
            (RunState::Failed, _) | (_, RunState::Failed) => RunState::Failed,
            (RunState::Pending, _) | (_, RunState::Pending) => RunState::Pending,
            _ => RunState::Successful,
        }
    }
}

struct OpState {
    phase: OperationPhase,
    message: String,
    results: FxHashMap<(ResourceKey, SyncPhase), ResourceSyncResult>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    terminated: bool,
}

pub struct SyncContext {
    id: String,
    cluster: Arc<dyn ClusterOps>,
    discovery: Arc<dyn ResourceDiscovery>,
    reconciliation: ReconciliationResult,
    namespace: String,
    opts: SyncOptions,
    state: Mutex<OpState>,
    serial: tokio::sync::Mutex<()>,
}

impl SyncContext {
    pub fn new(
        cluster: Arc<dyn ClusterOps>,
        discovery: Arc<dyn ResourceDiscovery>,
        reconciliation: ReconciliationResult,
        namespace: impl Into<String>,
        opts: SyncOptions,
    ) -> Self {
        let initial = &opts.initial_state;
        let results = initial.results.iter().map(|r| ((r.resource_key.clone(), r.sync_phase), r.clone())).collect();
        let state = OpState {
            phase: initial.phase,
            message: initial.message.clone(),
            results,
            started_at: initial.started_at.unwrap_or_else(Utc::now),
            finished_at: None,
            terminated: false,
        };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            cluster,
            discovery,
            reconciliation,
            namespace: namespace.into(),
            opts,
            state: Mutex::new(state),
            serial: tokio::sync::Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Phase, message and per-resource results in first-seen order.
    pub fn get_state(&self) -> (OperationPhase, String, Vec<ResourceSyncResult>) {
        let state = self.lock_state();
        (state.phase, state.message.clone(), sorted_results(&state))
    }

    pub fn operation_state(&self) -> OperationState {
        let state = self.lock_state();
        OperationState {
            phase: state.phase,
            message: state.message.clone(),
            results: sorted_results(&state),
            started_at: Some(state.started_at),
            finished_at: state.finished_at,
        }
    }

    /// Advance the operation by one step. A no-op once the phase is terminal.
    pub async fn sync(&self) {
        let _serial = self.serial.lock().await;
        {
            let state = self.lock_state();
            if state.terminated || state.phase.is_completed() {
                return;
            }
        }
        let started = Instant::now();
        self.sync_iteration().instrument(info_span!("sync", op = %self.id)).await;
        metrics::histogram!("keel_sync_iteration_ms", started.elapsed().as_secs_f64() * 1000.0);
    }

    /// Delete running hooks and fail the operation. Safe to call while `sync` is in flight.
    pub async fn terminate(&self) {
        {
            let mut state = self.lock_state();
            if state.phase.is_completed() {
                return;
            }
            state.terminated = true;
        }
        self.terminate_hooks().instrument(info_span!("terminate", op = %self.id)).await;
    }

    fn lock_state(&self) -> MutexGuard<'_, OpState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn health_override(&self) -> Option<&dyn HealthOverride> {
        self.opts.health_override.as_deref()
    }

    fn started(&self) -> bool {
        !self.lock_state().results.is_empty()
    }

    async fn sync_iteration(&self) {
        info!(skip_hooks = self.opts.skip_hooks, started = self.started(), "syncing");
        let server = self.discovery.api_resources().await;
        let (mut tasks, ok) = self.get_sync_tasks(&server).await;
        if !ok {
            self.set_operation_phase(OperationPhase::Failed, "one or more synchronization tasks are not valid");
            return;
        }

        if self.started() {
            debug!(tasks = tasks.len(), "tasks");
        } else {
            debug!(tasks = tasks.len(), "tasks (dry-run)");
            if self.run_tasks(&mut tasks, true).await == RunState::Failed {
                self.set_operation_phase(OperationPhase::Failed, "one or more objects failed to apply (dry run)");
                return;
            }
        }

        self.refresh_live(&mut tasks).await;
        for t in tasks.iter_mut().filter(|t| t.running() && t.live().is_some()) {
            self.refresh_task_status(t);
        }

        let multi = multi_step(&tasks);
        {
            let running: Vec<&SyncTask> = tasks.iter().filter(|t| (multi || t.is_hook()) && t.running()).collect();
            if !running.is_empty() {
                self.set_running_phase(&running, false);
                return;
            }
        }

        let hooks_to_delete_on_success: Vec<SyncTask> = tasks
            .iter()
            .filter(|t| t.is_hook() && t.live().is_some() && !t.running() && t.delete_on_phase_successful())
            .cloned()
            .collect();
        let hooks_to_delete_on_failure: Vec<SyncTask> = tasks
            .iter()
            .filter(|t| t.is_hook() && t.live().is_some() && !t.running() && t.delete_on_phase_failed())
            .cloned()
            .collect();

        let (sync_fail_tasks, mut tasks): (Vec<SyncTask>, Vec<SyncTask>) =
            tasks.into_iter().partition(|t| t.phase == SyncPhase::SyncFail);

        if tasks.iter().any(|t| t.completed() && !t.successful()) {
            let reasons = sync_failed_messages(&tasks);
            self.delete_hooks(hooks_to_delete_on_failure).await;
            self.set_operation_failed(sync_fail_tasks, &reasons, "one or more synchronization tasks completed unsuccessfully")
                .await;
            return;
        }

        tasks.retain(SyncTask::pending);
        let Some(((phase, wave), last)) = phase_wave_bounds(&tasks) else {
            self.delete_hooks(hooks_to_delete_on_success).await;
            self.set_operation_phase(OperationPhase::Succeeded, "successfully synced (no more tasks)");
            return;
        };
        let final_wave = (phase, wave) == last;

        // Non-hook resources of the wave about to run count as done once applied.
        let remaining: Vec<SyncTask> =
            tasks.iter().filter(|t| t.phase != phase || t.wave() != wave || t.is_hook()).cloned().collect();
        let mut current: Vec<SyncTask> = tasks.into_iter().filter(|t| t.phase == phase && t.wave() == wave).collect();

        self.set_operation_phase(OperationPhase::Running, "one or more tasks are running");
        debug!(?phase, wave, tasks = current.len(), "wet run");
        let run_state = self.run_tasks(&mut current, false).await;

        if run_state != RunState::Failed {
            if let Some(wave_hook) = &self.opts.sync_wave_hook {
                if let Err(e) = wave_hook(phase, wave, final_wave) {
                    warn!(error = %e, "sync wave hook failed");
                    self.delete_hooks(hooks_to_delete_on_failure).await;
                    self.set_operation_phase(OperationPhase::Failed, format!("sync wave hook failed: {e:#}"));
                    return;
                }
            }
        }

        match run_state {
            RunState::Failed => {
                let reasons = sync_failed_messages(&current);
                self.delete_hooks(hooks_to_delete_on_failure).await;
                self.set_operation_failed(sync_fail_tasks, &reasons, "one or more objects failed to apply").await;
            }
            RunState::Successful if remaining.is_empty() => {
                self.delete_hooks(hooks_to_delete_on_success).await;
                self.set_operation_phase(OperationPhase::Succeeded, "successfully synced (all tasks run)");
            }
            RunState::Successful => {
                self.set_running_phase(&remaining.iter().collect::<Vec<_>>(), false);
            }
            RunState::Pending => {
                let deleting: Vec<&SyncTask> = current.iter().filter(|t| t.delete_before_creation()).collect();
                self.set_running_phase(&deleting, true);
            }
        }
    }

    async fn terminate_hooks(&self) {
        info!("terminating");
        let server = self.discovery.api_resources().await;
        let (mut tasks, _) = self.get_sync_tasks(&server).await;
        let mut clean = true;
        for t in tasks.iter_mut().filter(|t| t.is_hook()) {
            self.fetch_live(t).await;
            let Some(live) = t.live() else { continue };
            let (phase, message) = self.hook_operation_phase(live);
            if !phase.is_running() {
                self.set_resource_result(t, None, phase, &message);
                continue;
            }
            match self.delete_task_object(t, true).await {
                Ok(()) => self.set_resource_result(t, None, OperationPhase::Succeeded, "Deleted"),
                Err(e) if e.is_not_found() => self.set_resource_result(t, None, OperationPhase::Succeeded, "Deleted"),
                Err(e) => {
                    warn!(task = %t.key(), error = %e, "failed to delete running hook");
                    self.set_resource_result(t, None, OperationPhase::Failed, &format!("Failed to delete: {e}"));
                    clean = false;
                }
            }
        }
        if clean {
            self.force_operation_phase(OperationPhase::Failed, "Operation terminated");
        } else {
            self.force_operation_phase(OperationPhase::Error, "Operation termination had errors");
        }
    }

    fn target_objs(&self) -> impl Iterator<Item = &Manifest> {
        self.reconciliation.hooks.iter().chain(self.reconciliation.target.iter().flatten())
    }

    fn has_crd_of_group_kind(&self, group: &str, kind: &str) -> bool {
        let wanted = format!("{group}/{kind}");
        self.target_objs().any(|o| crd_group_kind(o).as_deref() == Some(wanted.as_str()))
    }

    /// Reconciled live object with the same group, kind and name; a live object without a
    /// namespace matches any target namespace.
    fn live_obj(&self, obj: &Manifest) -> Option<Manifest> {
        let gvk = obj.gvk();
        self.reconciliation
            .live
            .iter()
            .flatten()
            .find(|live| {
                let k = live.key();
                k.group == gvk.group
                    && k.kind == gvk.kind
                    && (k.namespace.is_empty() || k.namespace == obj.object_namespace())
                    && k.name == obj.object_name()
            })
            .cloned()
    }

    async fn get_sync_tasks(&self, server: &Result<Vec<ApiResourceInfo>>) -> (Vec<SyncTask>, bool) {
        let mut tasks = Vec::new();
        for (target, live) in self.reconciliation.target.iter().zip(&self.reconciliation.live) {
            if let Some(filter) = &self.opts.resources_filter {
                if !filter(target.as_ref(), live.as_ref()) {
                    continue;
                }
            }
            let Some(obj) = target.as_ref().or(live.as_ref()) else { continue };
            if hook::is_hook(obj) {
                continue;
            }
            for phase in hook::sync_phases(obj) {
                tasks.extend(SyncTask::from_pair(phase, target.clone(), live.clone()));
            }
        }

        if !self.opts.skip_hooks {
            let started_at = self.lock_state().started_at.timestamp();
            let revision: String = if self.opts.revision.chars().count() >= 8 {
                self.opts.revision.chars().take(7).collect()
            } else {
                self.opts.revision.clone()
            };
            for obj in &self.reconciliation.hooks {
                for phase in hook::sync_phases(obj) {
                    let mut target = obj.clone();
                    if target.object_name().is_empty() {
                        let prefix = target.metadata.generate_name.clone().unwrap_or_default();
                        let suffix = format!("{revision}-{}-{started_at}", phase.as_str()).to_lowercase();
                        target.metadata.name = Some(format!("{prefix}{suffix}"));
                    }
                    tasks.push(SyncTask::apply(phase, target, None));
                }
            }
        }

        let resources = server.as_ref().ok();
        for t in tasks.iter_mut() {
            let Some(target) = t.target_mut() else { continue };
            if !target.object_namespace().is_empty() || self.namespace.is_empty() {
                continue;
            }
            let gk = target.gvk().group_kind();
            let cluster_scoped = resources.and_then(|list| keel_kubehub::is_namespaced(list, &gk)) == Some(false);
            if !cluster_scoped {
                target.metadata.namespace = Some(self.namespace.clone());
            }
        }

        if self.opts.namespace_auto_create && !self.namespace.is_empty() {
            self.auto_create_namespace(&mut tasks).await;
        }

        for t in tasks.iter_mut().filter(|t| !t.is_prune() && t.live().is_none()) {
            if let Some(live) = self.live_obj(t.obj()) {
                t.set_live(live);
            }
        }

        let mut ok = true;
        for t in tasks.iter_mut() {
            let gvk = t.obj().gvk();
            let found = match server {
                Ok(list) => find_server_resource(list, &gvk),
                Err(e) => Err(Error::Discovery(e.to_string())),
            };
            match found {
                Err(e)
                    if e.is_not_found()
                        && (t.target().is_some_and(|o| o.has_sync_option(SYNC_OPTION_SKIP_DRY_RUN_ON_MISSING_RESOURCE))
                            || self.has_crd_of_group_kind(&gvk.group, &gvk.kind)) =>
                {
                    debug!(task = %t.key(), "skipping dry run for custom resource");
                    t.skip_dry_run = true;
                }
                Err(e) => {
                    let message = match e {
                        Error::Discovery(msg) => msg,
                        other => other.to_string(),
                    };
                    self.set_resource_result(t, Some(ResultCode::SyncFailed), OperationPhase::Pending, &message);
                    ok = false;
                }
                Ok(info) => {
                    if let Some(validator) = &self.opts.permission_validator {
                        if let Err(e) = validator(t.obj(), &info) {
                            self.set_resource_result(t, Some(ResultCode::SyncFailed), OperationPhase::Pending, &e.to_string());
                            ok = false;
                        }
                    }
                }
            }
        }

        adjust_prune_waves(&mut tasks, self.opts.prune_last);
        sort_tasks(&mut tasks);

        let state = self.lock_state();
        for t in tasks.iter_mut() {
            if let Some(r) = state.results.get(&t.result_key()) {
                t.sync_status = r.status;
                t.operation_state = r.hook_phase;
                t.message = r.message.clone();
            }
        }
        (tasks, ok)
    }

    async fn auto_create_namespace(&self, tasks: &mut Vec<SyncTask>) {
        let declared = self.target_objs().any(|o| {
            let gvk = o.gvk();
            gvk.group.is_empty() && gvk.kind == "Namespace" && o.object_name() == self.namespace
        });
        if declared {
            return;
        }
        let ns = match manifest_from_value(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": self.namespace}
        })) {
            Ok(ns) => ns,
            Err(e) => {
                self.set_operation_phase(OperationPhase::Failed, format!("Namespace auto creation failed: {e}"));
                return;
            }
        };
        match self.cluster.get_resource(&Gvk::new("", "v1", "Namespace"), &self.namespace, "").await {
            Ok(live) => {
                let task = SyncTask::apply(SyncPhase::PreSync, ns, Some(live));
                let known = self.lock_state().results.contains_key(&task.result_key());
                if known {
                    tasks.push(task);
                } else {
                    debug!(namespace = %self.namespace, "namespace already exists");
                }
            }
            Err(e) if e.is_not_found() => tasks.push(SyncTask::apply(SyncPhase::PreSync, ns, None)),
            Err(e) => {
                let mut task = SyncTask::apply(SyncPhase::PreSync, ns, None);
                self.set_resource_result(
                    &mut task,
                    Some(ResultCode::SyncFailed),
                    OperationPhase::Error,
                    &format!("Namespace auto creation failed: {e}"),
                );
                tasks.push(task);
            }
        }
    }

    /// Re-read live objects that may have changed since reconciliation: running tasks and
    /// completed hooks that are due for deletion.
    async fn refresh_live(&self, tasks: &mut [SyncTask]) {
        let due: Vec<&mut SyncTask> = tasks
            .iter_mut()
            .filter(|t| {
                !t.is_prune()
                    && (t.running()
                        || (t.completed() && (t.delete_on_phase_successful() || t.delete_on_phase_failed())))
            })
            .collect();
        let fetches: Vec<_> = due.into_iter().map(|t| self.fetch_live(t)).collect();
        stream::iter(fetches).for_each_concurrent(self.opts.concurrency, |f| f).await;
    }

    async fn fetch_live(&self, t: &mut SyncTask) {
        let Some(target) = t.target() else { return };
        let (gvk, name, namespace) =
            (target.gvk(), target.object_name().to_string(), target.object_namespace().to_string());
        match self.cluster.get_resource(&gvk, &name, &namespace).await {
            Ok(obj) => t.set_live(obj),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(task = %t.key(), error = %e, "failed to refresh live object"),
        }
    }

    fn refresh_task_status(&self, t: &mut SyncTask) {
        let Some(live) = t.live() else { return };
        if t.is_hook() {
            let (phase, message) = self.hook_operation_phase(live);
            self.set_resource_result(t, None, phase, &message);
            return;
        }
        match get_resource_health(live, self.health_override()) {
            None => {
                let message = t.message.clone();
                self.set_resource_result(t, None, OperationPhase::Succeeded, &message);
            }
            Some(h) if h.status == HealthStatusCode::Healthy => {
                self.set_resource_result(t, None, OperationPhase::Succeeded, &h.message);
            }
            Some(h) if h.status == HealthStatusCode::Degraded => {
                self.set_resource_result(t, None, OperationPhase::Failed, &h.message);
            }
            Some(_) => {}
        }
    }

    fn hook_operation_phase(&self, live: &Manifest) -> (OperationPhase, String) {
        let created = || (OperationPhase::Succeeded, format!("{} created", live.object_name()));
        let Some(h) = get_resource_health(live, self.health_override()) else { return created() };
        match h.status {
            HealthStatusCode::Unknown | HealthStatusCode::Degraded => (OperationPhase::Failed, h.message),
            HealthStatusCode::Progressing | HealthStatusCode::Suspended => (OperationPhase::Running, h.message),
            HealthStatusCode::Healthy => (OperationPhase::Succeeded, h.message),
            HealthStatusCode::Missing => created(),
        }
    }

    /// Prunes in parallel, then pending hook deletions, then applies batched by kind.
    async fn run_tasks(&self, tasks: &mut [SyncTask], dry_run: bool) -> RunState {
        let dry_run = dry_run || self.opts.dry_run;
        let limit = self.opts.concurrency;
        debug!(tasks = tasks.len(), dry_run, "running tasks");

        let (prunes, mut creates): (Vec<&mut SyncTask>, Vec<&mut SyncTask>) =
            tasks.iter_mut().partition(|t| t.is_prune());

        let prune_runs: Vec<_> = prunes.into_iter().map(|t| self.run_prune(t, dry_run)).collect();
        let mut state = stream::iter(prune_runs)
            .buffer_unordered(limit)
            .fold(RunState::Successful, |acc, s| future::ready(acc.merge(s)))
            .await;
        if state != RunState::Successful {
            return state;
        }

        if !dry_run {
            let deletes: Vec<&mut &mut SyncTask> = creates.iter_mut().filter(|t| t.delete_before_creation()).collect();
            let delete_runs: Vec<_> = deletes.into_iter().map(|t| self.run_delete_before_creation(t)).collect();
            state = stream::iter(delete_runs)
                .buffer_unordered(limit)
                .fold(state, |acc, s| future::ready(acc.merge(s)))
                .await;
            if state != RunState::Successful {
                return state;
            }
        }

        let mut start = 0;
        while start < creates.len() {
            let kind = creates[start].kind();
            let end = creates[start..].iter().position(|t| t.kind() != kind).map_or(creates.len(), |i| start + i);
            let batch: Vec<&mut &mut SyncTask> =
                creates[start..end].iter_mut().filter(|t| !(dry_run && t.skip_dry_run)).collect();
            let apply_runs: Vec<_> = batch.into_iter().map(|t| self.run_apply(t, dry_run)).collect();
            state = stream::iter(apply_runs)
                .buffer_unordered(limit)
                .fold(state, |acc, s| future::ready(acc.merge(s)))
                .await;
            if state == RunState::Failed && !dry_run {
                break;
            }
            start = end;
        }
        state
    }

    async fn run_prune(&self, t: &mut SyncTask, dry_run: bool) -> RunState {
        let (code, message) = self.prune_object(t.obj(), dry_run).await;
        let failed = code == ResultCode::SyncFailed;
        if failed {
            info!(task = %t.key(), %message, "pruning failed");
        }
        if !dry_run || self.opts.dry_run || failed {
            self.set_resource_result(t, Some(code), code.operation_phase(), &message);
        }
        if failed {
            RunState::Failed
        } else {
            RunState::Successful
        }
    }

    async fn run_delete_before_creation(&self, t: &mut SyncTask) -> RunState {
        match self.delete_task_object(t, false).await {
            Ok(()) => RunState::Pending,
            // Already gone.
            Err(e) if e.is_not_found() => RunState::Successful,
            Err(e) => {
                self.set_resource_result(t, None, OperationPhase::Error, &format!("failed to delete resource: {e}"));
                RunState::Failed
            }
        }
    }

    async fn run_apply(&self, t: &mut SyncTask, dry_run: bool) -> RunState {
        let validate = self.opts.validate && !t.obj().has_sync_option(SYNC_OPTION_VALIDATE_DISABLED);
        let (code, message) = self.apply_object(t.obj(), dry_run, self.opts.force, validate).await;
        let failed = code == ResultCode::SyncFailed;
        if failed {
            info!(task = %t.key(), %message, "apply failed");
        }
        if !dry_run || self.opts.dry_run || failed {
            let mut phase = code.operation_phase();
            // Nothing is created on a dry-run operation, so a valid apply is already done.
            if self.opts.dry_run && phase == OperationPhase::Running {
                phase = OperationPhase::Succeeded;
            }
            self.set_resource_result(t, Some(code), phase, &message);
        }
        if failed {
            RunState::Failed
        } else {
            RunState::Successful
        }
    }

    async fn apply_object(&self, target: &Manifest, dry_run: bool, force: bool, validate: bool) -> (ResultCode, String) {
        let opts = ApplyOptions { dry_run, force, validate };
        match self.cluster.apply_resource(target, target.object_namespace(), opts).await {
            Err(e) => {
                metrics::counter!("keel_apply_total", 1u64, "result" => "failed");
                (ResultCode::SyncFailed, e.to_string())
            }
            Ok(message) => {
                metrics::counter!("keel_apply_total", 1u64, "result" => if dry_run { "dry_run" } else { "applied" });
                if is_crd(target) && !dry_run {
                    if let Err(e) = self.ensure_crd_ready(target.object_name()).await {
                        warn!(crd = target.object_name(), error = %e, "CRD not established");
                    }
                }
                (ResultCode::Synced, message)
            }
        }
    }

    /// Poll until the CRD reports `Established=True` or the configured timeout passes.
    async fn ensure_crd_ready(&self, name: &str) -> Result<()> {
        let gvk = Gvk::new(CRD_GROUP, "v1", CRD_KIND);
        let deadline = tokio::time::Instant::now() + self.opts.crd_ready_timeout;
        loop {
            let crd = self.cluster.get_resource(&gvk, name, "").await?;
            if crd_established(&crd) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout(format!("waiting for CRD {name} to be established")));
            }
            tokio::time::sleep(self.opts.crd_ready_poll).await;
        }
    }

    async fn prune_object(&self, live: &Manifest, dry_run: bool) -> (ResultCode, String) {
        if !self.opts.prune {
            return (ResultCode::PruneSkipped, "ignored (requires pruning)".into());
        }
        if live.has_sync_option(keel_core::annotations::SYNC_OPTION_PRUNE_DISABLED) {
            return (ResultCode::PruneSkipped, "ignored (no prune)".into());
        }
        if dry_run {
            return (ResultCode::Pruned, "pruned (dry run)".into());
        }
        // Deleting twice would only bump the object while it finalizes.
        if !live.is_deleting() {
            let gvk = live.gvk();
            match self.cluster.delete_resource(&gvk, live.object_name(), live.object_namespace(), self.opts.force).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return (ResultCode::SyncFailed, e.to_string()),
            }
            metrics::counter!("keel_prune_total", 1u64, "kind" => gvk.kind);
        }
        (ResultCode::Pruned, "pruned".into())
    }

    async fn delete_task_object(&self, t: &SyncTask, force: bool) -> Result<()> {
        let obj = t.live().unwrap_or_else(|| t.obj());
        debug!(task = %t.key(), "deleting resource");
        self.cluster
            .delete_resource(&obj.gvk(), obj.object_name(), obj.object_namespace(), force || self.opts.force)
            .await
    }

    async fn delete_hooks(&self, hooks: Vec<SyncTask>) {
        for mut t in hooks {
            if let Err(e) = self.delete_task_object(&t, false).await {
                if !e.is_not_found() {
                    self.set_resource_result(&mut t, None, OperationPhase::Error, &format!("failed to delete resource: {e}"));
                }
            }
        }
    }

    /// Fail the operation, first giving `SyncFail` tasks their single run.
    async fn set_operation_failed(&self, mut sync_fail_tasks: Vec<SyncTask>, reasons: &[String], message: &str) {
        let message =
            if reasons.is_empty() { message.to_string() } else { format!("{message}, reason: {}", reasons.join(",")) };
        if sync_fail_tasks.iter().all(SyncTask::completed) {
            self.set_operation_phase(OperationPhase::Failed, message);
            return;
        }
        debug!(tasks = sync_fail_tasks.len(), "running sync fail tasks");
        if self.run_tasks(&mut sync_fail_tasks, false).await == RunState::Failed {
            self.set_operation_phase(OperationPhase::Failed, message);
        }
    }

    fn set_running_phase(&self, tasks: &[&SyncTask], pending_deletion: bool) {
        let Some(first) = tasks.first() else { return };
        let hook = first.is_hook();
        let waiting_for = match (pending_deletion, hook) {
            (true, true) => "deletion of hook",
            (true, false) => "deletion of",
            (false, true) => "completion of hook",
            (false, false) => "healthy state of",
        };
        let mut message = format!("waiting for {waiting_for} {}", first.key().short());
        if tasks.len() > 1 {
            let more = if hook { "hooks" } else { "resources" };
            message = format!("{message} and {} more {more}", tasks.len() - 1);
        }
        self.set_operation_phase(OperationPhase::Running, message);
    }

    fn set_operation_phase(&self, phase: OperationPhase, message: impl Into<String>) {
        let mut state = self.lock_state();
        if state.terminated {
            return;
        }
        update_phase(&mut state, phase, message.into());
    }

    fn force_operation_phase(&self, phase: OperationPhase, message: impl Into<String>) {
        let mut state = self.lock_state();
        update_phase(&mut state, phase, message.into());
    }

    /// Record a task outcome. `None` keeps the current status; an empty message keeps the
    /// current message.
    fn set_resource_result(&self, t: &mut SyncTask, status: Option<ResultCode>, phase: OperationPhase, message: &str) {
        if status.is_some() {
            t.sync_status = status;
        }
        t.operation_state = phase;
        if !message.is_empty() {
            t.message = message.to_string();
        }
        let mut res = ResourceSyncResult {
            resource_key: t.key(),
            version: t.version(),
            status: t.sync_status,
            message: t.message.clone(),
            hook_type: t.hook_type(),
            hook_phase: t.operation_state,
            sync_phase: t.phase,
            order: 0,
        };

        let mut state = self.lock_state();
        let next_order = state.results.len() + 1;
        match state.results.get_mut(&t.result_key()) {
            Some(existing) => {
                if existing.status != res.status || existing.hook_phase != res.hook_phase || existing.message != res.message {
                    info!(
                        task = %res.resource_key,
                        phase = %res.sync_phase,
                        status = ?res.status,
                        hook_phase = %res.hook_phase,
                        message = %res.message,
                        "updating resource result"
                    );
                }
                res.order = existing.order;
                *existing = res;
            }
            None => {
                info!(
                    task = %res.resource_key,
                    phase = %res.sync_phase,
                    status = ?res.status,
                    hook_phase = %res.hook_phase,
                    message = %res.message,
                    "adding resource result"
                );
                res.order = next_order;
                state.results.insert(t.result_key(), res);
            }
        }
    }
}

fn update_phase(state: &mut OpState, phase: OperationPhase, message: String) {
    if state.phase != phase || state.message != message {
        info!(from = %state.phase, to = %phase, %message, "updating operation state");
    }
    if phase.is_completed() && state.finished_at.is_none() {
        state.finished_at = Some(Utc::now());
    }
    state.phase = phase;
    state.message = message;
}

fn sorted_results(state: &OpState) -> Vec<ResourceSyncResult> {
    let mut results: Vec<ResourceSyncResult> = state.results.values().cloned().collect();
    results.sort_by_key(|r| r.order);
    results
}

fn sync_failed_messages(tasks: &[SyncTask]) -> Vec<String> {
    tasks.iter().filter(|t| t.sync_status == Some(ResultCode::SyncFailed)).map(|t| t.message.clone()).collect()
}

fn crd_established(crd: &Manifest) -> bool {
    crd.data
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .is_some_and(|conds| conds.iter().any(|c| c["type"] == "Established" && c["status"] == "True"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_kubehub::testing::FakeCluster;

    #[test]
    fn run_state_merge_prefers_failure_then_pending() {
        use RunState::*;
        assert_eq!(Successful.merge(Successful), Successful);
        assert_eq!(Successful.merge(Pending), Pending);
        assert_eq!(Pending.merge(Failed), Failed);
        assert_eq!(Failed.merge(Successful), Failed);
    }

    #[test]
    fn established_condition_is_read_from_status() {
        let mut crd = manifest_from_value(json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": {"name": "widgets.example.com"}
        }))
        .unwrap();
        assert!(!crd_established(&crd));
        crd.data = json!({"status": {"conditions": [
            {"type": "NamesAccepted", "status": "True"},
            {"type": "Established", "status": "True"}
        ]}});
        assert!(crd_established(&crd));
    }

    #[tokio::test]
    async fn results_keep_first_seen_order_and_latest_values() {
        let fake = Arc::new(FakeCluster::new());
        let ctx = SyncContext::new(fake.clone(), fake, ReconciliationResult::default(), "shop", SyncOptions::default());
        let pod = |name: &str| {
            manifest_from_value(json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": name, "namespace": "shop"}}))
                .unwrap()
        };
        let mut a = SyncTask::apply(SyncPhase::Sync, pod("a"), None);
        let mut b = SyncTask::apply(SyncPhase::Sync, pod("b"), None);
        ctx.set_resource_result(&mut b, Some(ResultCode::Synced), OperationPhase::Running, "created");
        ctx.set_resource_result(&mut a, Some(ResultCode::Synced), OperationPhase::Running, "");
        ctx.set_resource_result(&mut b, None, OperationPhase::Succeeded, "");

        let (_, _, results) = ctx.get_state();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].resource_key.name, "b");
        assert_eq!(results[0].order, 1);
        assert_eq!(results[0].status, Some(ResultCode::Synced));
        assert_eq!(results[0].hook_phase, OperationPhase::Succeeded);
        assert_eq!(results[0].message, "created");
        assert_eq!(results[1].order, 2);
    }

    #[tokio::test]
    async fn running_messages_name_the_first_task() {
        let fake = Arc::new(FakeCluster::new());
        let ctx = SyncContext::new(fake.clone(), fake, ReconciliationResult::default(), "shop", SyncOptions::default());
        let obj = |kind: &str, name: &str, annotations: Value| {
            manifest_from_value(json!({
                "apiVersion": "v1",
                "kind": kind,
                "metadata": {"name": name, "namespace": "shop", "annotations": annotations}
            }))
            .unwrap()
        };
        let hook = SyncTask::apply(SyncPhase::PreSync, obj("Pod", "migrate", json!({"argocd.argoproj.io/hook": "PreSync"})), None);
        let svc = SyncTask::apply(SyncPhase::Sync, obj("Service", "web", json!({})), None);
        let cm = SyncTask::apply(SyncPhase::Sync, obj("ConfigMap", "cfg", json!({})), None);

        ctx.set_running_phase(&[&hook], false);
        assert_eq!(ctx.get_state().1, "waiting for completion of hook /Pod/migrate");
        ctx.set_running_phase(&[&svc, &cm], false);
        assert_eq!(ctx.get_state().1, "waiting for healthy state of /Service/web and 1 more resources");
        ctx.set_running_phase(&[&hook, &svc, &cm], true);
        assert_eq!(ctx.get_state().1, "waiting for deletion of hook /Pod/migrate and 2 more hooks");
        assert_eq!(ctx.get_state().0, OperationPhase::Running);
        ctx.set_running_phase(&[], false);
        assert_eq!(ctx.get_state().0, OperationPhase::Running);
    }
}
