//! Per-kind list/watch tasks feeding the cache.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tracing::{debug, warn};

use keel_kubehub::{ApiResourceInfo, WatchEvent};

use crate::{ClusterCache, EventType};

/// Doubling retry delay capped at `max`; `reset` after a healthy observation.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, current: initial, max }
    }

    pub fn next_backoff(&mut self) -> Duration {
        let out = self.current.min(self.max);
        self.current = self.current.saturating_mul(2).min(self.max);
        out
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

enum StreamEnd {
    Resync,
    Failed(String),
}

/// Keeps the cache in step with one kind (in one namespace, or cluster wide when `namespace` is `None`).
///
/// The first pass relists only when the initial list did not succeed. Afterwards every
/// resync interval or watch failure is followed by a relist that replaces the kind wholesale.
/// Runs until aborted by [`ClusterCache::stop`].
pub(crate) async fn run_watch(cache: Arc<ClusterCache>, api: ApiResourceInfo, namespace: Option<String>, mut relist: bool) {
    let gk = api.group_kind();
    let settings = cache.settings().clone();
    let mut backoff = Backoff::new(settings.watch_backoff_initial, settings.watch_backoff_max);
    let source = cache.source();

    loop {
        if relist {
            match source.list(&api, namespace.as_deref()).await {
                Ok((items, version)) => {
                    cache.replace_resource_cache(&gk, &version, items, namespace.as_deref().unwrap_or_default());
                    relist = false;
                }
                Err(e) => {
                    let delay = backoff.next_backoff();
                    warn!(gk = %gk, error = %e, delay_ms = delay.as_millis() as u64, "list failed; retrying");
                    metrics::counter!("keel_cache_watch_errors_total", 1u64, "stage" => "list");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }
        }

        let mut stream = source.watch(&api, namespace.as_deref());
        let resync = tokio::time::sleep(settings.watch_resync);
        tokio::pin!(resync);
        let end = loop {
            tokio::select! {
                next = stream.next() => match next {
                    Some(Ok(event)) => {
                        backoff.reset();
                        apply_event(&cache, &api, namespace.as_deref(), event);
                    }
                    Some(Err(e)) => break StreamEnd::Failed(e.to_string()),
                    None => break StreamEnd::Failed("watch stream closed".into()),
                },
                _ = &mut resync => break StreamEnd::Resync,
            }
        };
        match end {
            StreamEnd::Resync => {
                debug!(gk = %gk, "periodic relist");
                relist = true;
            }
            StreamEnd::Failed(msg) => {
                let delay = backoff.next_backoff();
                warn!(gk = %gk, error = %msg, delay_ms = delay.as_millis() as u64, "watch failed; relisting after backoff");
                metrics::counter!("keel_cache_watch_errors_total", 1u64, "stage" => "watch");
                relist = true;
                tokio::time::sleep(delay).await;
            }
        }
    }
}

fn apply_event(cache: &ClusterCache, api: &ApiResourceInfo, namespace: Option<&str>, event: WatchEvent) {
    match event {
        WatchEvent::Resync { items, resource_version } => {
            cache.replace_resource_cache(&api.group_kind(), &resource_version, items, namespace.unwrap_or_default());
        }
        WatchEvent::Added(obj) => cache.process_event(EventType::Added, &obj),
        WatchEvent::Modified(obj) => cache.process_event(EventType::Modified, &obj),
        WatchEvent::Deleted(obj) => cache.process_event(EventType::Deleted, &obj),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_cap_and_resets() {
        let mut b = Backoff::new(Duration::from_millis(500), Duration::from_secs(3));
        let seq: Vec<u128> = (0..5).map(|_| b.next_backoff().as_millis()).collect();
        assert_eq!(seq, vec![500, 1000, 2000, 3000, 3000]);
        b.reset();
        assert_eq!(b.next_backoff(), Duration::from_millis(500));
    }
}
