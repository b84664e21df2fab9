use keel_core::{manifest_from_value, HealthStatus, HealthStatusCode, Manifest, Result};
use keel_health::{get_resource_health, HealthOverride, HealthRegistry};
use serde_json::{json, Value};

fn obj(v: Value) -> Manifest {
    manifest_from_value(v).unwrap()
}

fn status_of(v: Value) -> HealthStatusCode {
    get_resource_health(&obj(v), None).expect("rule registered").status
}

fn deployment(replicas: i32, status: Value) -> Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": "web", "namespace": "shop", "generation": 2},
        "spec": {"replicas": replicas, "selector": {}, "template": {}},
        "status": status
    })
}

fn pod(restart_policy: &str, status: Value) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {"name": "p", "namespace": "shop"},
        "spec": {"restartPolicy": restart_policy, "containers": [{"name": "main", "image": "nginx"}]},
        "status": status
    })
}

#[test]
fn deployment_rollout_progression() {
    let rolling = deployment(3, json!({"observedGeneration": 2, "replicas": 3, "updatedReplicas": 1, "availableReplicas": 1}));
    let h = get_resource_health(&obj(rolling), None).unwrap();
    assert_eq!(h.status, HealthStatusCode::Progressing);
    assert_eq!(h.message, "Waiting for rollout to finish: 1 out of 3 new replicas have been updated...");

    let lagging = deployment(3, json!({"observedGeneration": 2, "replicas": 3, "updatedReplicas": 3, "availableReplicas": 2}));
    assert_eq!(status_of(lagging), HealthStatusCode::Progressing);

    let done = deployment(3, json!({"observedGeneration": 2, "replicas": 3, "updatedReplicas": 3, "availableReplicas": 3}));
    assert_eq!(status_of(done), HealthStatusCode::Healthy);

    let stale = deployment(3, json!({"observedGeneration": 1}));
    assert_eq!(status_of(stale), HealthStatusCode::Progressing);
}

#[test]
fn deployment_deadline_and_pause() {
    let stuck = deployment(
        2,
        json!({
            "observedGeneration": 2,
            "conditions": [{"type": "Progressing", "status": "False", "reason": "ProgressDeadlineExceeded"}]
        }),
    );
    let h = get_resource_health(&obj(stuck), None).unwrap();
    assert_eq!(h.status, HealthStatusCode::Degraded);
    assert!(h.message.contains("exceeded its progress deadline"));

    let mut paused = deployment(1, json!({}));
    paused["spec"]["paused"] = json!(true);
    assert_eq!(status_of(paused), HealthStatusCode::Suspended);
}

#[test]
fn extensions_group_deployment_uses_same_rule() {
    let mut d = deployment(1, json!({"observedGeneration": 2, "replicas": 1, "updatedReplicas": 1, "availableReplicas": 1}));
    d["apiVersion"] = json!("extensions/v1beta1");
    assert_eq!(status_of(d), HealthStatusCode::Healthy);
}

#[test]
fn pod_restart_policy_always() {
    let crash = pod(
        "Always",
        json!({
            "phase": "Running",
            "containerStatuses": [{
                "name": "main", "ready": false, "restartCount": 4, "image": "nginx", "imageID": "",
                "state": {"waiting": {"reason": "CrashLoopBackOff", "message": "back-off restarting"}}
            }]
        }),
    );
    let h = get_resource_health(&obj(crash), None).unwrap();
    assert_eq!(h.status, HealthStatusCode::Degraded);
    assert_eq!(h.message, "back-off restarting");

    let ready = pod("Always", json!({"phase": "Running", "conditions": [{"type": "Ready", "status": "True"}]}));
    assert_eq!(status_of(ready), HealthStatusCode::Healthy);

    let starting = pod("Always", json!({"phase": "Running", "conditions": [{"type": "Ready", "status": "False"}]}));
    assert_eq!(status_of(starting), HealthStatusCode::Progressing);

    let oom = pod(
        "Always",
        json!({
            "phase": "Running",
            "containerStatuses": [{
                "name": "main", "ready": false, "restartCount": 1, "image": "nginx", "imageID": "",
                "lastState": {"terminated": {"exitCode": 137, "reason": "OOMKilled"}}
            }]
        }),
    );
    assert_eq!(status_of(oom), HealthStatusCode::Degraded);
}

#[test]
fn finite_pods_stay_progressing_while_running() {
    let hook = pod(
        "Never",
        json!({
            "phase": "Running",
            "containerStatuses": [{
                "name": "main", "ready": false, "restartCount": 0, "image": "nginx", "imageID": "",
                "state": {"waiting": {"reason": "ImagePullBackOff", "message": "pull failed"}}
            }]
        }),
    );
    assert_eq!(status_of(hook), HealthStatusCode::Progressing);
}

#[test]
fn failed_pod_reports_container_exit() {
    let failed = pod(
        "Never",
        json!({
            "phase": "Failed",
            "containerStatuses": [{
                "name": "main", "ready": false, "restartCount": 0, "image": "nginx", "imageID": "",
                "state": {"terminated": {"exitCode": 3}}
            }]
        }),
    );
    let h = get_resource_health(&obj(failed), None).unwrap();
    assert_eq!(h.status, HealthStatusCode::Degraded);
    assert_eq!(h.message, "container \"main\" failed with exit code 3");
}

#[test]
fn job_conditions() {
    let job = |conditions: Value| {
        json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {"name": "migrate", "namespace": "shop"},
            "spec": {"template": {}},
            "status": {"conditions": conditions}
        })
    };
    assert_eq!(status_of(job(json!([]))), HealthStatusCode::Progressing);
    assert_eq!(status_of(job(json!([{"type": "Complete", "status": "True"}]))), HealthStatusCode::Healthy);
    assert_eq!(
        status_of(job(json!([{"type": "Failed", "status": "True", "message": "BackoffLimitExceeded"}]))),
        HealthStatusCode::Degraded
    );
}

#[test]
fn services_and_claims() {
    let lb = json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "s"}, "spec": {"type": "LoadBalancer"}});
    assert_eq!(status_of(lb), HealthStatusCode::Progressing);
    let cluster_ip = json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "s"}, "spec": {"type": "ClusterIP"}});
    assert_eq!(status_of(cluster_ip), HealthStatusCode::Healthy);
    let lost = json!({"apiVersion": "v1", "kind": "PersistentVolumeClaim", "metadata": {"name": "c"}, "status": {"phase": "Lost"}});
    assert_eq!(status_of(lost), HealthStatusCode::Degraded);
}

#[test]
fn pending_deletion_short_circuits() {
    let mut p = pod("Always", json!({"phase": "Running", "conditions": [{"type": "Ready", "status": "True"}]}));
    p["metadata"]["deletionTimestamp"] = json!("2024-01-01T00:00:00Z");
    let h = get_resource_health(&obj(p), None).unwrap();
    assert_eq!(h, HealthStatus::progressing("Pending deletion"));
}

#[test]
fn unknown_kinds_have_no_health() {
    let cm = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c"}});
    assert!(get_resource_health(&obj(cm), None).is_none());
}

#[test]
fn malformed_bodies_degrade_to_unknown() {
    let bad = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": "web"},
        "spec": {"replicas": "three", "selector": {}, "template": {}}
    });
    let h = get_resource_health(&obj(bad), None).unwrap();
    assert_eq!(h.status, HealthStatusCode::Unknown);
    assert!(!h.message.is_empty());
}

struct CronOverride;

impl HealthOverride for CronOverride {
    fn get_resource_health(&self, obj: &Manifest) -> Result<Option<HealthStatus>> {
        match obj.types.as_ref().map(|t| t.kind.as_str()) {
            Some("CronTab") => Ok(Some(HealthStatus::new(HealthStatusCode::Suspended, "cron paused"))),
            Some("Broken") => Err(keel_core::Error::HealthAssessment("script failed".into())),
            _ => Ok(None),
        }
    }
}

#[test]
fn override_wins_and_errors_become_unknown() {
    let cron = obj(json!({"apiVersion": "stable.example.com/v1", "kind": "CronTab", "metadata": {"name": "c"}}));
    assert_eq!(get_resource_health(&cron, Some(&CronOverride)).unwrap().status, HealthStatusCode::Suspended);

    let broken = obj(json!({"apiVersion": "stable.example.com/v1", "kind": "Broken", "metadata": {"name": "b"}}));
    let h = get_resource_health(&broken, Some(&CronOverride)).unwrap();
    assert_eq!(h.status, HealthStatusCode::Unknown);
    assert!(h.message.contains("script failed"));

    let svc = obj(json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "s"}}));
    assert_eq!(get_resource_health(&svc, Some(&CronOverride)).unwrap().status, HealthStatusCode::Healthy);
}

#[test]
fn custom_registry_rules() {
    fn always_missing(_: &Manifest) -> anyhow::Result<HealthStatus> {
        Ok(HealthStatus::new(HealthStatusCode::Missing, ""))
    }
    let mut registry = HealthRegistry::empty();
    registry.register("example.com", "Widget", always_missing);
    let w = obj(json!({"apiVersion": "example.com/v1", "kind": "Widget", "metadata": {"name": "w"}}));
    assert_eq!(registry.assess(&w, None).unwrap().status, HealthStatusCode::Missing);
    let svc = obj(json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "s"}}));
    assert!(registry.assess(&svc, None).is_none());
}
