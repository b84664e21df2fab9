//! Keel core types: resource identity, sync phases and results, health status, errors.

#![forbid(unsafe_code)]

pub mod annotations;
pub mod config;
mod error;
mod health;
mod key;
mod manifest;
mod phase;

pub use error::{Error, Result};
pub use health::{HealthStatus, HealthStatusCode};
pub use key::{GroupKind, Gvk, ResourceKey};
pub use manifest::{manifest_from_value, Manifest, ManifestExt};
pub use phase::{
    HookDeletePolicy, HookType, OperationPhase, OperationState, ResourceSyncResult, ResultCode,
    SyncPhase,
};

pub mod prelude {
    pub use super::{
        Error, GroupKind, Gvk, HealthStatus, HealthStatusCode, Manifest, ManifestExt,
        OperationPhase, ResourceKey, ResultCode, SyncPhase,
    };
}
