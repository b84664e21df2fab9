use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use keel_cache::{ClusterCache, EventType, NamespaceResources, Resource, Settings};
use keel_core::{manifest_from_value, GroupKind, Manifest, ResourceKey};
use keel_kubehub::testing::FakeCluster;
use serde_json::{json, Value};

fn cache() -> Arc<ClusterCache> {
    ClusterCache::new(Arc::new(FakeCluster::new()), Settings::default())
}

fn obj(api_version: &str, kind: &str, name: &str, uid: &str, owners: Value) -> Manifest {
    manifest_from_value(json!({
        "apiVersion": api_version,
        "kind": kind,
        "metadata": {"name": name, "namespace": "shop", "uid": uid, "resourceVersion": "1", "ownerReferences": owners}
    }))
    .unwrap()
}

fn owner(kind: &str, name: &str, uid: &str) -> Value {
    json!({"apiVersion": "apps/v1", "kind": kind, "name": name, "uid": uid})
}

fn add(cache: &ClusterCache, o: Manifest) {
    cache.process_event(EventType::Added, &o);
}

fn key(group: &str, kind: &str, name: &str) -> ResourceKey {
    ResourceKey::new(group, kind, "shop", name)
}

fn descendants(cache: &ClusterCache, root: &ResourceKey) -> Vec<String> {
    let mut out = Vec::new();
    cache.iterate_hierarchy(root, |r: &Resource, _| {
        out.push(r.reference.name.clone());
        true
    });
    out
}

#[test]
fn walks_owner_chain_without_root() {
    let c = cache();
    add(&c, obj("apps/v1", "Deployment", "web", "d1", json!([])));
    add(&c, obj("apps/v1", "ReplicaSet", "web-7f", "r1", json!([owner("Deployment", "web", "d1")])));
    add(&c, obj("v1", "Pod", "web-7f-a", "p1", json!([owner("ReplicaSet", "web-7f", "r1")])));
    add(&c, obj("v1", "Pod", "web-7f-b", "p2", json!([owner("ReplicaSet", "web-7f", "r1")])));
    add(&c, obj("v1", "Pod", "stray", "p3", json!([])));

    let seen = descendants(&c, &key("apps", "Deployment", "web"));
    assert_eq!(seen, vec!["web-7f", "web-7f-a", "web-7f-b"]);

    let top: Vec<String> = {
        let mut names: Vec<String> =
            c.get_namespace_top_level_resources("shop").values().map(|r| r.reference.name.clone()).collect();
        names.sort();
        names
    };
    assert_eq!(top, vec!["stray", "web"]);
}

#[test]
fn visit_can_prune_subtrees() {
    let c = cache();
    add(&c, obj("apps/v1", "Deployment", "web", "d1", json!([])));
    add(&c, obj("apps/v1", "ReplicaSet", "web-7f", "r1", json!([owner("Deployment", "web", "d1")])));
    add(&c, obj("v1", "Pod", "web-7f-a", "p1", json!([owner("ReplicaSet", "web-7f", "r1")])));
    let mut seen = Vec::new();
    c.iterate_hierarchy(&key("apps", "Deployment", "web"), |r, _| {
        seen.push(r.reference.name.clone());
        false
    });
    assert_eq!(seen, vec!["web-7f"]);
}

#[test]
fn cycles_terminate_and_skip_the_ancestor() {
    let c = cache();
    add(&c, obj("v1", "ConfigMap", "a", "ua", json!([owner("ConfigMap", "b", "ub")])));
    add(&c, obj("v1", "ConfigMap", "b", "ub", json!([owner("ConfigMap", "a", "ua")])));
    assert_eq!(descendants(&c, &key("", "ConfigMap", "a")), vec!["b"]);
    assert_eq!(descendants(&c, &key("", "ConfigMap", "b")), vec!["a"]);
}

#[test]
fn same_uid_under_two_groups_is_visited_once() {
    let c = cache();
    add(&c, obj("apps/v1", "Deployment", "web", "d1", json!([])));
    add(&c, obj("apps/v1", "ReplicaSet", "web-7f", "r1", json!([owner("Deployment", "web", "d1")])));
    add(&c, obj("extensions/v1beta1", "ReplicaSet", "web-7f", "r1", json!([owner("Deployment", "web", "d1")])));
    let mut groups = Vec::new();
    c.iterate_hierarchy(&key("apps", "Deployment", "web"), |r, _| {
        groups.push(r.reference.gvk.group.clone());
        true
    });
    assert_eq!(groups, vec!["apps"]);
}

#[test]
fn endpoints_hang_off_their_service() {
    let c = cache();
    add(&c, obj("v1", "Service", "web", "s1", json!([])));
    add(&c, obj("v1", "Endpoints", "web", "e1", json!([])));
    add(&c, obj("v1", "Endpoints", "other", "e2", json!([])));
    assert_eq!(descendants(&c, &key("", "Service", "web")), vec!["web"]);
    assert!(!c.get_namespace_top_level_resources("shop").contains_key(&key("", "Endpoints", "web")));
}

#[test]
fn token_secret_belongs_to_service_account() {
    let c = cache();
    add(&c, obj("v1", "ServiceAccount", "builder", "sa1", json!([])));
    let secret = manifest_from_value(json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "type": "kubernetes.io/service-account-token",
        "metadata": {
            "name": "builder-token-x",
            "namespace": "shop",
            "uid": "sec1",
            "annotations": {
                "kubernetes.io/service-account.name": "builder",
                "kubernetes.io/service-account.uid": "sa1"
            }
        }
    }))
    .unwrap();
    add(&c, secret);
    assert_eq!(descendants(&c, &key("", "ServiceAccount", "builder")), vec!["builder-token-x"]);
}

#[test]
fn statefulset_claims_are_inferred_children() {
    let c = cache();
    let sts = manifest_from_value(json!({
        "apiVersion": "apps/v1",
        "kind": "StatefulSet",
        "metadata": {"name": "db", "namespace": "shop", "uid": "st1"},
        "spec": {"volumeClaimTemplates": [{"metadata": {"name": "data"}}]}
    }))
    .unwrap();
    add(&c, sts);
    add(&c, obj("v1", "PersistentVolumeClaim", "data-db-0", "pvc0", json!([])));
    add(&c, obj("v1", "PersistentVolumeClaim", "scratch", "pvc1", json!([])));

    assert_eq!(descendants(&c, &key("apps", "StatefulSet", "db")), vec!["data-db-0"]);
    let top = c.get_namespace_top_level_resources("shop");
    assert!(!top.contains_key(&key("", "PersistentVolumeClaim", "data-db-0")));
    assert!(top.contains_key(&key("", "PersistentVolumeClaim", "scratch")));
}

#[test]
fn owner_without_uid_is_backfilled_from_first_match() {
    let c = cache();
    add(&c, obj("apps/v1", "Deployment", "web", "d1", json!([])));
    add(&c, obj("apps/v1", "ReplicaSet", "web-7f", "r1", json!([owner("Deployment", "web", "")])));
    assert_eq!(descendants(&c, &key("apps", "Deployment", "web")), vec!["web-7f"]);

    let rs = c.get_resource(&key("apps", "ReplicaSet", "web-7f")).unwrap();
    assert_eq!(rs.owner_refs[0].uid(), Some("d1"));

    // Recreated deployment: the child keeps pointing at the UID it was matched with.
    c.process_event(EventType::Modified, &obj("apps/v1", "Deployment", "web", "d2", json!([])));
    assert!(descendants(&c, &key("apps", "Deployment", "web")).is_empty());
}

#[test]
fn delete_removes_from_lookup_and_index() {
    let c = cache();
    let pod = obj("v1", "Pod", "p", "p1", json!([]));
    add(&c, pod.clone());
    assert!(c.get_resource(&key("", "Pod", "p")).is_some());
    c.process_event(EventType::Deleted, &pod);
    assert!(c.get_resource(&key("", "Pod", "p")).is_none());
    assert!(c.find_resources("shop", |_| true).is_empty());
    assert!(c.is_empty());
}

#[test]
fn replace_swaps_one_kind_in_one_namespace() {
    let c = cache();
    add(&c, obj("v1", "Pod", "old", "p1", json!([])));
    add(&c, obj("v1", "Pod", "kept", "p2", json!([])));
    add(&c, obj("v1", "ConfigMap", "cfg", "c1", json!([])));
    let mut elsewhere = obj("v1", "Pod", "other-ns", "p9", json!([]));
    elsewhere.metadata.namespace = Some("billing".into());
    add(&c, elsewhere);

    let fresh = vec![obj("v1", "Pod", "kept", "p2", json!([])), obj("v1", "Pod", "new", "p3", json!([]))];
    c.replace_resource_cache(&GroupKind::new("", "Pod"), "42", fresh, "shop");

    let mut pods: Vec<String> = c
        .find_resources("", |r| r.reference.gvk.kind == "Pod")
        .values()
        .map(|r| format!("{}/{}", r.reference.namespace, r.reference.name))
        .collect();
    pods.sort();
    assert_eq!(pods, vec!["billing/other-ns", "shop/kept", "shop/new"]);
    assert!(c.get_resource(&key("", "ConfigMap", "cfg")).is_some());
}

#[tokio::test]
async fn managed_objects_are_top_level_matches_and_targets() {
    let c = cache();
    let mut labelled = obj("apps/v1", "Deployment", "web", "d1", json!([]));
    labelled.metadata.labels = Some([("app.kubernetes.io/instance".to_string(), "shop".to_string())].into());
    add(&c, labelled);
    add(&c, obj("apps/v1", "ReplicaSet", "web-7f", "r1", json!([owner("Deployment", "web", "d1")])));
    add(&c, obj("v1", "ConfigMap", "unlabelled", "c1", json!([])));
    add(&c, obj("v1", "ConfigMap", "other", "c2", json!([])));

    let is_managed = |r: &Resource| {
        r.manifest
            .as_ref()
            .and_then(|m| m.metadata.labels.as_ref())
            .and_then(|l| l.get("app.kubernetes.io/instance"))
            .map(|v| v == "shop")
            .unwrap_or(false)
    };
    let targets = vec![obj("v1", "ConfigMap", "unlabelled", "", json!([])), obj("v1", "Secret", "absent", "", json!([]))];
    let live = c.get_managed_live_objs(&targets, is_managed).await.unwrap();
    let mut keys: Vec<String> = live.keys().map(|k| k.to_string()).collect();
    keys.sort();
    assert_eq!(keys, vec!["/ConfigMap/shop/unlabelled", "apps/Deployment/shop/web"]);
}

#[tokio::test]
async fn namespaced_mode_rejects_foreign_targets() {
    let c = ClusterCache::new(
        Arc::new(FakeCluster::new()),
        Settings::default().with_namespaces(vec!["shop".into()], false),
    );
    let mut foreign = obj("v1", "ConfigMap", "cfg", "", json!([]));
    foreign.metadata.namespace = Some("billing".into());
    let err = c.get_managed_live_objs(&[foreign], |_| true).await.unwrap_err();
    assert_eq!(err.to_string(), "Namespace \"billing\" for ConfigMap \"cfg\" is not managed");

    let mut cluster_level = obj("rbac.authorization.k8s.io/v1", "ClusterRole", "admin", "", json!([]));
    cluster_level.metadata.namespace = None;
    let err = c.get_managed_live_objs(&[cluster_level], |_| true).await.unwrap_err();
    assert_eq!(err.to_string(), "Cluster level ClusterRole \"admin\" can not be managed when in namespaced mode");
}

#[test]
fn update_handlers_fire_until_unsubscribed() {
    let c = cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let sub = c.on_resource_updated(Arc::new(move |new: Option<&Resource>, old: Option<&Resource>, _ns: &NamespaceResources| {
        assert!(new.is_some() || old.is_some());
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    let mut epoch = c.subscribe_epoch();
    let before = *epoch.borrow_and_update();

    let pod = obj("v1", "Pod", "p", "p1", json!([]));
    add(&c, pod.clone());
    c.process_event(EventType::Deleted, &pod);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(*epoch.borrow_and_update() > before);

    sub.unsubscribe();
    add(&c, pod);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn info_handler_controls_manifest_retention() {
    let settings = Settings::default().with_info_handler(Arc::new(|obj: &Manifest, is_root: bool| {
        (Some(json!({"root": is_root, "name": obj.metadata.name})), false)
    }));
    let c = ClusterCache::new(Arc::new(FakeCluster::new()), settings);
    add(&c, obj("v1", "Pod", "p", "p1", json!([])));
    let res = c.get_resource(&key("", "Pod", "p")).unwrap();
    assert!(res.manifest.is_none());
    assert_eq!(res.info, Some(json!({"root": true, "name": "p"})));
    assert!(c.get_managed_live_objs(&[], |_| true).await.unwrap().is_empty());
}

#[tokio::test]
async fn targets_cached_without_manifest_are_read_from_the_cluster() {
    let fake = Arc::new(FakeCluster::new());
    fake.insert(obj("v1", "Pod", "p", "p1", json!([])));
    let settings = Settings::default().with_info_handler(Arc::new(|_: &Manifest, _: bool| (None, false)));
    let c = ClusterCache::new(fake.clone(), settings);
    c.ensure_synced().await.unwrap();
    assert!(c.get_resource(&key("", "Pod", "p")).unwrap().manifest.is_none());

    // Cached but already gone from the cluster.
    add(&c, obj("v1", "Pod", "ghost", "p2", json!([])));

    let targets = vec![obj("v1", "Pod", "p", "", json!([])), obj("v1", "Pod", "ghost", "", json!([]))];
    let live = c.get_managed_live_objs(&targets, |_| false).await.unwrap();
    assert_eq!(live.len(), 1);
    let pod = &live[&key("", "Pod", "p")];
    assert_eq!(pod.metadata.uid.as_deref(), Some("p1"));
    assert_eq!(fake.gets(), 2);
    c.stop();
}

#[test]
fn visit_may_write_to_the_cache() {
    let c = cache();
    add(&c, obj("apps/v1", "Deployment", "web", "d1", json!([])));
    add(&c, obj("apps/v1", "ReplicaSet", "web-7f", "r1", json!([owner("Deployment", "web", "d1")])));

    let mut seen = Vec::new();
    c.iterate_hierarchy(&key("apps", "Deployment", "web"), |r, _| {
        seen.push(r.reference.name.clone());
        add(&c, obj("v1", "Pod", "late", "p9", json!([owner("ReplicaSet", "web-7f", "r1")])));
        true
    });
    assert_eq!(seen, vec!["web-7f"]);
    assert_eq!(descendants(&c, &key("apps", "Deployment", "web")), vec!["web-7f", "late"]);
}
