//! Minimal structural diff used to word apply outcomes.

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool {
        self.adds == 0 && self.updates == 0 && self.removes == 0
    }

    fn walk(&mut self, target: &Json, base: &Json) {
        match (target, base) {
            (Json::Object(t), Json::Object(b)) => {
                for (k, tv) in t {
                    match b.get(k) {
                        Some(bv) if bv == tv => {}
                        Some(bv) => self.walk(tv, bv),
                        None => self.adds += 1,
                    }
                }
                self.removes += b.keys().filter(|k| !t.contains_key(*k)).count();
            }
            (Json::Array(t), Json::Array(b)) => {
                self.updates += t.iter().zip(b.iter()).filter(|(x, y)| x != y).count();
                self.adds += t.len().saturating_sub(b.len());
                self.removes += b.len().saturating_sub(t.len());
            }
            (t, b) if t != b => self.updates += 1,
            _ => {}
        }
    }
}

/// Count what applying `target` over `base` would add, change and remove.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    let mut s = DiffSummary::default();
    s.walk(target, base);
    s
}

/// Drop server-populated fields so desired and live bodies compare cleanly.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        for field in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "selfLink"] {
            meta.remove(field);
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// kubectl-style outcome line, e.g. `deployment.apps/web configured`.
pub fn outcome_message(group: &str, kind: &str, name: &str, live: Option<DiffSummary>, dry_run: bool) -> String {
    let resource = if group.is_empty() {
        kind.to_lowercase()
    } else {
        format!("{}.{}", kind.to_lowercase(), group)
    };
    let verb = match live {
        None => "created",
        Some(s) if s.is_empty() => "unchanged",
        Some(_) => "configured",
    };
    let suffix = if dry_run { " (server dry run)" } else { "" };
    format!("{resource}/{name} {verb}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strip_noisy_prunes_server_fields() {
        let pruned = strip_noisy(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "x",
                "managedFields": [{"manager": "kubectl"}],
                "resourceVersion": "123",
                "generation": 5,
                "uid": "abc"
            },
            "status": {"obs": true},
            "data": {"k": "v"}
        }));
        let meta = pruned["metadata"].as_object().unwrap();
        assert_eq!(meta.len(), 1);
        assert!(pruned.get("status").is_none());
        assert_eq!(pruned["data"]["k"], "v");
    }

    #[test]
    fn counts_adds_updates_removes() {
        let base = json!({"a": 1, "b": {"x": 1}, "c": [1, 2, 3], "gone": true});
        let target = json!({"a": 2, "b": {"x": 1, "y": 2}, "c": [1, 9], "d": true});
        let s = diff_summary(&target, &base);
        assert_eq!(s, DiffSummary { adds: 2, updates: 2, removes: 2 });
    }

    #[test]
    fn outcome_wording_follows_live_state() {
        assert_eq!(outcome_message("", "Pod", "a", None, false), "pod/a created");
        assert_eq!(
            outcome_message("apps", "Deployment", "web", Some(DiffSummary::default()), false),
            "deployment.apps/web unchanged"
        );
        assert_eq!(
            outcome_message("apps", "Deployment", "web", Some(DiffSummary { updates: 1, ..Default::default() }), true),
            "deployment.apps/web configured (server dry run)"
        );
    }
}
