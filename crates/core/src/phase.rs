use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ResourceKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncPhase {
    PreSync,
    Sync,
    PostSync,
    SyncFail,
}

impl SyncPhase {
    pub fn order(self) -> i32 {
        match self {
            SyncPhase::PreSync => -1,
            SyncPhase::Sync => 0,
            SyncPhase::PostSync => 1,
            SyncPhase::SyncFail => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncPhase::PreSync => "PreSync",
            SyncPhase::Sync => "Sync",
            SyncPhase::PostSync => "PostSync",
            SyncPhase::SyncFail => "SyncFail",
        }
    }
}

impl PartialOrd for SyncPhase {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SyncPhase {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.order().cmp(&other.order())
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookType {
    PreSync,
    Sync,
    PostSync,
    SyncFail,
    Skip,
}

impl HookType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PreSync" => Some(HookType::PreSync),
            "Sync" => Some(HookType::Sync),
            "PostSync" => Some(HookType::PostSync),
            "SyncFail" => Some(HookType::SyncFail),
            "Skip" => Some(HookType::Skip),
            _ => None,
        }
    }

    /// Phase the hook runs in; `Skip` has none.
    pub fn phase(self) -> Option<SyncPhase> {
        match self {
            HookType::PreSync => Some(SyncPhase::PreSync),
            HookType::Sync => Some(SyncPhase::Sync),
            HookType::PostSync => Some(SyncPhase::PostSync),
            HookType::SyncFail => Some(SyncPhase::SyncFail),
            HookType::Skip => None,
        }
    }

    pub fn from_phase(phase: SyncPhase) -> Self {
        match phase {
            SyncPhase::PreSync => HookType::PreSync,
            SyncPhase::Sync => HookType::Sync,
            SyncPhase::PostSync => HookType::PostSync,
            SyncPhase::SyncFail => HookType::SyncFail,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookDeletePolicy {
    HookSucceeded,
    HookFailed,
    BeforeHookCreation,
}

impl HookDeletePolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "HookSucceeded" => Some(HookDeletePolicy::HookSucceeded),
            "HookFailed" => Some(HookDeletePolicy::HookFailed),
            "BeforeHookCreation" => Some(HookDeletePolicy::BeforeHookCreation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    Synced,
    SyncFailed,
    Pruned,
    PruneSkipped,
}

impl ResultCode {
    /// Operation phase a task enters once this result is recorded.
    pub fn operation_phase(self) -> OperationPhase {
        match self {
            ResultCode::Synced => OperationPhase::Running,
            ResultCode::SyncFailed => OperationPhase::Failed,
            ResultCode::Pruned | ResultCode::PruneSkipped => OperationPhase::Succeeded,
        }
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OperationPhase {
    #[default]
    #[serde(rename = "")]
    Pending,
    Running,
    Succeeded,
    Failed,
    Error,
}

impl OperationPhase {
    pub fn is_pending(self) -> bool {
        self == OperationPhase::Pending
    }

    pub fn is_running(self) -> bool {
        self == OperationPhase::Running
    }

    pub fn is_completed(self) -> bool {
        matches!(self, OperationPhase::Succeeded | OperationPhase::Failed | OperationPhase::Error)
    }

    pub fn is_successful(self) -> bool {
        self == OperationPhase::Succeeded
    }

    pub fn is_failed(self) -> bool {
        matches!(self, OperationPhase::Failed | OperationPhase::Error)
    }
}

impl fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationPhase::Pending => Ok(()),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

/// Durable per-resource outcome, keyed by `(resource_key, sync_phase)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSyncResult {
    pub resource_key: ResourceKey,
    pub version: String,
    pub status: Option<ResultCode>,
    pub message: String,
    pub hook_type: Option<HookType>,
    pub hook_phase: OperationPhase,
    pub sync_phase: SyncPhase,
    /// First-seen sequence, starting at 1.
    pub order: usize,
}

/// Snapshot of an operation as published to observers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationState {
    pub phase: OperationPhase,
    pub message: String,
    pub results: Vec<ResourceSyncResult>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_sort_by_precedence() {
        let mut phases = vec![SyncPhase::SyncFail, SyncPhase::PostSync, SyncPhase::Sync, SyncPhase::PreSync];
        phases.sort();
        assert_eq!(phases, vec![SyncPhase::PreSync, SyncPhase::Sync, SyncPhase::PostSync, SyncPhase::SyncFail]);
    }

    #[test]
    fn result_codes_map_to_task_phases() {
        assert_eq!(ResultCode::Synced.operation_phase(), OperationPhase::Running);
        assert_eq!(ResultCode::SyncFailed.operation_phase(), OperationPhase::Failed);
        assert_eq!(ResultCode::PruneSkipped.operation_phase(), OperationPhase::Succeeded);
        assert!(OperationPhase::Error.is_completed());
        assert!(OperationPhase::Error.is_failed());
        assert!(!OperationPhase::Pending.is_completed());
    }

    #[test]
    fn pending_serializes_as_empty() {
        assert_eq!(serde_json::to_string(&OperationPhase::Pending).unwrap(), "\"\"");
        assert_eq!(OperationPhase::Pending.to_string(), "");
    }
}
