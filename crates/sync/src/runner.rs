//! Scheduling loop driving a [`SyncContext`] to a terminal phase.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use keel_core::config::env_millis;
use keel_core::{OperationPhase, OperationState};

use crate::SyncContext;

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub poll_interval: Duration,
    /// Least time between a pass and the next one started by a cache change.
    pub min_interval: Duration,
    /// Terminate the operation once this much time has passed.
    pub deadline: Option<Duration>,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self { poll_interval: Duration::from_millis(1000), min_interval: Duration::from_millis(250), deadline: None }
    }
}

impl RunnerSettings {
    pub fn from_env() -> Self {
        Self {
            poll_interval: env_millis("KEEL_SYNC_POLL_MS", 1000),
            min_interval: env_millis("KEEL_SYNC_MIN_INTERVAL_MS", 250),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }
}

/// Read side of a running operation plus its controls.
pub struct RunnerHandle {
    state: Arc<ArcSwap<OperationState>>,
    epoch_rx: watch::Receiver<u64>,
    trigger_tx: mpsc::Sender<()>,
    cancel_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl RunnerHandle {
    /// Latest published state.
    pub fn current(&self) -> Arc<OperationState> {
        self.state.load_full()
    }

    /// Bumped after every publish.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.epoch_rx.clone()
    }

    /// Ask for a sync pass now instead of at the next tick.
    pub fn trigger(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    /// Terminate the operation at the next opportunity. Later calls do nothing.
    pub fn cancel(&self) {
        if let Some(tx) = self.cancel_tx.lock().unwrap_or_else(PoisonError::into_inner).take() {
            let _ = tx.send(());
        }
    }

    /// Resolve once the published phase is terminal or the loop has stopped.
    pub async fn wait(&self) -> Arc<OperationState> {
        let mut rx = self.subscribe();
        loop {
            let current = self.current();
            if current.phase.is_completed() {
                return current;
            }
            if rx.changed().await.is_err() {
                return self.current();
            }
        }
    }
}

pub struct SyncRunner;

impl SyncRunner {
    /// Start the coordinator. It syncs on every tick and every explicit trigger, and stops
    /// after publishing a terminal phase. Cache epoch changes are coalesced: any number of
    /// them lead to one pass, no sooner than `min_interval` after the previous pass.
    pub fn spawn(
        ctx: Arc<SyncContext>,
        settings: RunnerSettings,
        cache_epoch: Option<watch::Receiver<u64>>,
    ) -> RunnerHandle {
        let state = Arc::new(ArcSwap::from_pointee(ctx.operation_state()));
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        let (trigger_tx, mut trigger_rx) = mpsc::channel::<()>(1);
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let published = Arc::clone(&state);

        tokio::spawn(async move {
            let mut epoch = 0u64;
            let mut publish = |ctx: &SyncContext| -> OperationPhase {
                let snapshot = ctx.operation_state();
                let phase = snapshot.phase;
                published.store(Arc::new(snapshot));
                epoch += 1;
                let _ = epoch_tx.send(epoch);
                phase
            };

            let mut ticker = tokio::time::interval(settings.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let deadline = settings.deadline.map(|d| Instant::now() + d);
            let mut cache_epoch = cache_epoch;
            let mut cache_dirty = false;
            let mut last_pass = Instant::now();
            let mut cancel_open = true;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    Some(()) = trigger_rx.recv() => debug!("sync triggered"),
                    changed = cache_changed(&mut cache_epoch), if !cache_dirty => {
                        if !changed {
                            cache_epoch = None;
                        }
                        cache_dirty = changed;
                        continue;
                    }
                    _ = tokio::time::sleep_until(last_pass + settings.min_interval), if cache_dirty => {
                        debug!("cache changed");
                    }
                    res = &mut cancel_rx, if cancel_open => {
                        if res.is_err() {
                            cancel_open = false;
                            continue;
                        }
                        info!(op = ctx.id(), "sync cancelled");
                        ctx.terminate().await;
                        publish(&ctx);
                        break;
                    }
                    _ = until(deadline) => {
                        warn!(op = ctx.id(), "sync deadline exceeded");
                        ctx.terminate().await;
                        publish(&ctx);
                        break;
                    }
                }
                cache_dirty = false;
                ctx.sync().await;
                last_pass = Instant::now();
                if publish(&ctx).is_completed() {
                    break;
                }
            }
            info!(op = ctx.id(), "sync runner stopped");
        });

        RunnerHandle { state, epoch_rx, trigger_tx, cancel_tx: Mutex::new(Some(cancel_tx)) }
    }
}

async fn cache_changed(rx: &mut Option<watch::Receiver<u64>>) -> bool {
    match rx {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
