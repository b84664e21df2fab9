use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use keel_core::config::{env_millis, env_or};
use keel_core::{Manifest, OperationPhase, ResourceSyncResult, SyncPhase};
use keel_health::HealthOverride;
use keel_kubehub::PermissionValidator;

/// Selects the resources taking part in a selective sync. Called with `(target, live)`.
pub type ResourcesFilter = Arc<dyn Fn(Option<&Manifest>, Option<&Manifest>) -> bool + Send + Sync>;

/// Called after every executed wave with `(phase, wave, final_wave)`.
pub type SyncWaveHook = Arc<dyn Fn(SyncPhase, i32, bool) -> anyhow::Result<()> + Send + Sync>;

/// State of a previously started operation, used to resume it.
#[derive(Debug, Clone, Default)]
pub struct InitialState {
    pub phase: OperationPhase,
    pub message: String,
    pub results: Vec<ResourceSyncResult>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct SyncOptions {
    pub dry_run: bool,
    pub prune: bool,
    pub force: bool,
    pub skip_hooks: bool,
    pub validate: bool,
    pub prune_last: bool,
    pub namespace_auto_create: bool,
    pub resources_filter: Option<ResourcesFilter>,
    pub permission_validator: Option<PermissionValidator>,
    pub health_override: Option<Arc<dyn HealthOverride>>,
    pub initial_state: InitialState,
    pub sync_wave_hook: Option<SyncWaveHook>,
    /// Source revision; its first 7 characters name generated hooks.
    pub revision: String,
    pub concurrency: usize,
    pub crd_ready_timeout: Duration,
    pub crd_ready_poll: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            prune: false,
            force: false,
            skip_hooks: false,
            validate: true,
            prune_last: false,
            namespace_auto_create: false,
            resources_filter: None,
            permission_validator: None,
            health_override: None,
            initial_state: InitialState::default(),
            sync_wave_hook: None,
            revision: String::new(),
            concurrency: 16,
            crd_ready_timeout: Duration::from_millis(3000),
            crd_ready_poll: Duration::from_millis(100),
        }
    }
}

impl fmt::Debug for SyncOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncOptions")
            .field("dry_run", &self.dry_run)
            .field("prune", &self.prune)
            .field("force", &self.force)
            .field("skip_hooks", &self.skip_hooks)
            .field("validate", &self.validate)
            .field("prune_last", &self.prune_last)
            .field("namespace_auto_create", &self.namespace_auto_create)
            .field("revision", &self.revision)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl SyncOptions {
    /// Defaults with the operational knobs read from the environment.
    pub fn from_env() -> Self {
        Self::default().with_operation_settings(
            env_or("KEEL_SYNC_CONCURRENCY", 16usize),
            env_millis("KEEL_CRD_READY_TIMEOUT_MS", 3000),
            env_millis("KEEL_CRD_READY_POLL_MS", 100),
        )
    }

    pub fn with_operation_settings(mut self, concurrency: usize, crd_ready_timeout: Duration, crd_ready_poll: Duration) -> Self {
        self.concurrency = concurrency.max(1);
        self.crd_ready_timeout = crd_ready_timeout;
        self.crd_ready_poll = crd_ready_poll;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_prune(mut self, prune: bool) -> Self {
        self.prune = prune;
        self
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_skip_hooks(mut self, skip_hooks: bool) -> Self {
        self.skip_hooks = skip_hooks;
        self
    }

    pub fn with_validate(mut self, validate: bool) -> Self {
        self.validate = validate;
        self
    }

    pub fn with_prune_last(mut self, prune_last: bool) -> Self {
        self.prune_last = prune_last;
        self
    }

    pub fn with_namespace_auto_create(mut self, enabled: bool) -> Self {
        self.namespace_auto_create = enabled;
        self
    }

    pub fn with_resources_filter(mut self, filter: ResourcesFilter) -> Self {
        self.resources_filter = Some(filter);
        self
    }

    pub fn with_permission_validator(mut self, validator: PermissionValidator) -> Self {
        self.permission_validator = Some(validator);
        self
    }

    pub fn with_health_override(mut self, health_override: Arc<dyn HealthOverride>) -> Self {
        self.health_override = Some(health_override);
        self
    }

    pub fn with_initial_state(mut self, state: InitialState) -> Self {
        self.initial_state = state;
        self
    }

    pub fn with_sync_wave_hook(mut self, hook: SyncWaveHook) -> Self {
        self.sync_wave_hook = Some(hook);
        self
    }

    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_and_keep_cluster_untouched() {
        let opts = SyncOptions::default();
        assert!(opts.validate);
        assert!(!opts.prune && !opts.dry_run && !opts.force);
        assert_eq!(opts.concurrency, 16);
    }

    #[test]
    fn concurrency_is_at_least_one() {
        let opts = SyncOptions::default().with_operation_settings(0, Duration::ZERO, Duration::from_millis(1));
        assert_eq!(opts.concurrency, 1);
    }
}
