//! Keel sync: turns a reconciliation of target and live objects into an ordered, resumable
//! sync operation.
//!
//! - [`hook`] classifies lifecycle hooks from their annotations.
//! - [`reconcile`] pairs target manifests with live objects.
//! - [`SyncContext`] plans tasks per phase and wave and applies them one step per call.
//! - [`SyncRunner`] polls a context to completion and publishes its state.

#![forbid(unsafe_code)]

mod context;
pub mod hook;
mod options;
pub mod reconcile;
mod runner;
mod task;

pub use context::SyncContext;
pub use options::{InitialState, ResourcesFilter, SyncOptions, SyncWaveHook};
pub use reconcile::{reconcile, ReconciledResource, ReconciliationResult, ResourceInfoProvider};
pub use runner::{RunnerHandle, RunnerSettings, SyncRunner};
pub use task::{kind_order, SyncTask};
