#![forbid(unsafe_code)]

use std::sync::Arc;

use kube::ResourceExt;
use porch_controller::{Action, Reconciler};
use porch_core::condition::{find_condition, is_condition_true, READY, STALLED};
use porch_core::{Lifecycle, ObjectKey, PackageRevision, PackageRevisionKey, PackageVariant, PorchError, Repository, RevisionFilter, Task};
use porch_kubehub::MemoryClusterSource;
use porch_render::kptfile::{KPTFILE, PACKAGE_CONTEXT_FILE};
use porch_render::NoopRenderer;
use porch_repository::{MemoryOpener, RepositoryRegistry};
use porch_store::{NewRevision, ObjectStore, PackageRevisionStore};
use porch_variant::{apply_mutations, VariantReconciler};
use serde_json::json;
use serde_yaml::Value;

const APP: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: app\ndata:\n  replicas: \"1\"\n";
const CFG: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: foo-cfg\n  annotations:\n    kpt.dev/config-injection: required\ndata:\n  endpoint: placeholder\n";
const CTX: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: kptfile.kpt.dev\n  annotations:\n    config.kubernetes.io/local-config: \"true\"\ndata:\n  name: example\n  legacy: x\n";
const GATE: &str = "config.injection.ConfigMap.foo-cfg";

struct Env {
    revisions: Arc<PackageRevisionStore>,
    variants: Arc<ObjectStore<PackageVariant>>,
    cluster: Arc<MemoryClusterSource>,
    reconciler: VariantReconciler,
}

fn repo(name: &str, deployment: bool) -> Repository {
    serde_json::from_value(json!({
        "metadata": {"name": name, "namespace": "default"},
        "spec": {"type": "git", "git": {"repo": format!("https://example.com/{name}.git")}, "deployment": deployment}
    }))
    .unwrap()
}

fn env() -> Env {
    let registry = Arc::new(RepositoryRegistry::new(Arc::new(MemoryOpener::new())));
    registry.register(&repo("blueprints", false)).unwrap();
    registry.register(&repo("deployments", true)).unwrap();
    let revisions = Arc::new(PackageRevisionStore::new(registry, Arc::new(NoopRenderer), 256));
    let variants = Arc::new(ObjectStore::new(256));
    let cluster = Arc::new(MemoryClusterSource::new());
    let reconciler = VariantReconciler::new(Arc::clone(&variants), Arc::clone(&revisions), cluster.clone());
    Env { revisions, variants, cluster, reconciler }
}

fn spec(revision: &str) -> serde_json::Value {
    json!({
        "upstream": {"repo": "blueprints", "package": "foo", "revision": revision},
        "downstream": {"repo": "deployments", "package": "foo"}
    })
}

impl Env {
    async fn promote(&self, pr: &PackageRevision) -> Arc<PackageRevision> {
        let pr = self.revisions.set_lifecycle(pr, Lifecycle::Proposed).await.unwrap();
        self.revisions.set_lifecycle(&pr, Lifecycle::Published).await.unwrap()
    }

    async fn publish_blueprint(&self, ws: &str, files: &[(&str, &str)]) -> Arc<PackageRevision> {
        let key = PackageRevisionKey::new("default", "blueprints", "foo", ws);
        let pr = self.revisions.create(NewRevision::new(key.clone(), Task::Init { description: String::new() })).await.unwrap();
        let mut res = self.revisions.resources(&key).await.unwrap();
        for (path, text) in files {
            res.insert(path.to_string(), text.to_string());
        }
        let pr = self.revisions.update_resources(&pr, res, None).await.unwrap();
        self.promote(&pr).await
    }

    fn create_pv(&self, name: &str, spec: serde_json::Value) -> ObjectKey {
        let pv: PackageVariant = serde_json::from_value(json!({"metadata": {"name": name, "namespace": "default"}, "spec": spec})).unwrap();
        ObjectKey::of(&*self.variants.create(pv).unwrap())
    }

    fn edit_pv(&self, key: &ObjectKey, f: impl FnOnce(&mut PackageVariant)) {
        let mut pv = (*self.variants.get(key).unwrap()).clone();
        f(&mut pv);
        self.variants.update(pv).unwrap();
    }

    async fn reconcile(&self, key: &ObjectKey) -> Action {
        self.reconciler.reconcile(key).await.unwrap()
    }

    fn downstream(&self) -> Vec<Arc<PackageRevision>> {
        self.revisions.list(&RevisionFilter::default().namespace("default").repository("deployments").package("foo"))
    }

    fn pv(&self, key: &ObjectKey) -> Arc<PackageVariant> {
        self.variants.get(key).unwrap()
    }

    fn seqs(&self) -> (u64, u64) {
        (self.revisions.last_seq(), self.variants.last_seq())
    }
}

fn yaml(text: &str) -> Value {
    serde_yaml::from_str(text).unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn basic_clone_creates_owned_draft_and_converges() {
    let e = env();
    e.publish_blueprint("a", &[("app.yaml", APP)]).await;
    let key = e.create_pv("foo-variant", spec("v1"));

    assert_eq!(e.reconcile(&key).await, Action::Done);
    let down = e.downstream();
    assert_eq!(down.len(), 1);
    let pr = &down[0];
    assert_eq!(pr.spec.workspace_name, "packagevariant-1");
    assert_eq!(pr.lifecycle(), Lifecycle::Draft);
    assert_eq!(pr.upstream().map(|u| u.to_string()), Some("blueprints/foo@v1".to_string()));
    let pv = e.pv(&key);
    assert!(pr.is_owned_by(&pv.uid().unwrap()));
    assert!(pv.finalizers().iter().any(|f| f == "config.porch.kpt.dev/packagevariants"));
    assert!(is_condition_true(&pv.status.conditions, READY));
    assert_eq!(pv.status.downstream_targets[0].name, "deployments.foo.packagevariant-1");

    // a stable variant reaches a fixed point
    let before = e.seqs();
    e.reconcile(&key).await;
    e.reconcile(&key).await;
    assert_eq!(e.seqs(), before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn new_upstream_copies_published_downstream() {
    let e = env();
    e.publish_blueprint("a", &[("app.yaml", APP)]).await;
    let key = e.create_pv("foo-variant", spec("v1"));
    e.reconcile(&key).await;
    let first = e.promote(&e.downstream()[0]).await;
    assert_eq!(first.spec.revision, "v1");

    e.publish_blueprint("b", &[("app.yaml", &APP.replace("\"1\"", "\"5\""))]).await;
    e.edit_pv(&key, |pv| pv.spec.upstream.as_mut().unwrap().revision = "v2".into());
    e.reconcile(&key).await;

    let down = e.downstream();
    assert_eq!(down.len(), 2);
    assert_eq!(down[0].spec.workspace_name, "packagevariant-1");
    assert_eq!(down[0].lifecycle(), Lifecycle::Published);
    let draft = &down[1];
    assert_eq!(draft.spec.workspace_name, "packagevariant-2");
    assert_eq!(draft.lifecycle(), Lifecycle::Draft);
    assert_eq!(draft.spec.tasks.first().map(Task::type_name), Some("clone"));
    assert_eq!(draft.spec.tasks.last().map(Task::type_name), Some("update"));
    assert_eq!(draft.upstream().map(|u| u.revision.as_str()), Some("v2"));
    let app = yaml(&e.revisions.resources(&draft.key()).await.unwrap()["app.yaml"]);
    assert_eq!(app["data"]["replicas"], Value::from("5"));
    assert_eq!(e.pv(&key).status.downstream_targets.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn injection_copies_cluster_config_and_gates_publish() {
    let e = env();
    e.publish_blueprint("a", &[("cfg.yaml", CFG)]).await;
    let mut s = spec("v1");
    s["injectors"] = json!([{"name": "useast1-endpoints"}]);
    let key = e.create_pv("foo-variant", s);

    // nothing to inject yet: the draft exists but cannot be published
    e.reconcile(&key).await;
    let pr = e.downstream()[0].clone();
    assert_eq!(pr.spec.readiness_gates, vec![GATE.to_string()]);
    assert!(!is_condition_true(&pr.status.conditions, GATE));
    let pv = e.pv(&key);
    assert_eq!(find_condition(&pv.status.conditions, READY).map(|c| c.reason.as_str()), Some("InjectionPending"));
    let proposed = e.revisions.set_lifecycle(&pr, Lifecycle::Proposed).await.unwrap();
    assert!(matches!(e.revisions.set_lifecycle(&proposed, Lifecycle::Published).await, Err(PorchError::Validation(_))));

    e.cluster
        .apply(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": {"name": "useast1-endpoints", "namespace": "default"},
            "data": {"endpoint": "10.0.0.1", "zone": "b"}
        }))
        .unwrap();
    e.reconcile(&key).await;

    let down = e.downstream();
    assert_eq!(down.len(), 1);
    let pr = &down[0];
    assert_eq!(pr.lifecycle(), Lifecycle::Draft);
    assert_eq!(pr.spec.readiness_gates, vec![GATE.to_string()]);
    assert!(is_condition_true(&pr.status.conditions, GATE));
    let cfg = yaml(&e.revisions.resources(&pr.key()).await.unwrap()["cfg.yaml"]);
    assert_eq!(cfg["data"], yaml("endpoint: 10.0.0.1\nzone: b\n"));
    assert_eq!(cfg["metadata"]["annotations"]["kpt.dev/injected-resource-name"], Value::from("useast1-endpoints"));
    assert!(is_condition_true(&e.pv(&key).status.conditions, READY));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn package_context_is_merged() {
    let e = env();
    e.publish_blueprint("a", &[(PACKAGE_CONTEXT_FILE, CTX)]).await;
    let mut s = spec("v1");
    s["packageContext"] = json!({"data": {"region": "us-east1"}, "removeKeys": ["legacy"]});
    let key = e.create_pv("foo-variant", s);
    e.reconcile(&key).await;

    let pr = &e.downstream()[0];
    let ctx = yaml(&e.revisions.resources(&pr.key()).await.unwrap()[PACKAGE_CONTEXT_FILE]);
    assert_eq!(ctx["data"], yaml("name: example\nregion: us-east1\n"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn adopt_existing_takes_over_unowned_draft() {
    let e = env();
    e.publish_blueprint("a", &[("app.yaml", APP)]).await;
    let draft_key = PackageRevisionKey::new("default", "deployments", "foo", "packagevariant-1");
    let up = porch_core::UpstreamRef { repository: "blueprints".into(), package: "foo".into(), revision: "v1".into() };
    let mut req = NewRevision::new(draft_key.clone(), Task::Clone { upstream: up });
    req.labels.insert("origin".into(), "manual".into());
    e.revisions.create(req).await.unwrap();

    let mut s = spec("v1");
    s["adoptionPolicy"] = json!("adoptExisting");
    s["labels"] = json!({"team": "a"});
    s["annotations"] = json!({"owner": "platform"});
    let key = e.create_pv("foo-variant", s);
    e.reconcile(&key).await;

    let down = e.downstream();
    assert_eq!(down.len(), 1);
    let pr = &down[0];
    assert_eq!(pr.key(), draft_key);
    assert!(pr.is_owned_by(&e.pv(&key).uid().unwrap()));
    assert_eq!(pr.labels().get("team").map(String::as_str), Some("a"));
    assert_eq!(pr.labels().get("origin").map(String::as_str), Some("manual"));
    assert_eq!(pr.annotations().get("owner").map(String::as_str), Some("platform"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn adopt_none_leaves_unowned_drafts_alone() {
    let e = env();
    e.publish_blueprint("a", &[("app.yaml", APP)]).await;
    let up = porch_core::UpstreamRef { repository: "blueprints".into(), package: "foo".into(), revision: "v1".into() };
    let manual = PackageRevisionKey::new("default", "deployments", "foo", "packagevariant-1");
    e.revisions.create(NewRevision::new(manual.clone(), Task::Clone { upstream: up })).await.unwrap();

    let key = e.create_pv("foo-variant", spec("v1"));
    e.reconcile(&key).await;
    let down = e.downstream();
    assert_eq!(down.len(), 2);
    assert!(e.revisions.get(&manual).unwrap().metadata.owner_references.is_none());
    assert_eq!(down[1].spec.workspace_name, "packagevariant-2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deletion_proposes_published_and_recreation_revives() {
    let e = env();
    e.publish_blueprint("a", &[("app.yaml", APP)]).await;
    e.publish_blueprint("b", &[("app.yaml", &APP.replace("\"1\"", "\"2\""))]).await;
    let key = e.create_pv("foo-variant", spec("v1"));
    e.reconcile(&key).await;
    let published = e.promote(&e.downstream()[0]).await;
    e.edit_pv(&key, |pv| pv.spec.upstream.as_mut().unwrap().revision = "v2".into());
    e.reconcile(&key).await;
    let draft_key = PackageRevisionKey::new("default", "deployments", "foo", "packagevariant-2");
    assert!(e.revisions.get(&draft_key).is_some());

    e.variants.delete(&key).unwrap();
    e.reconcile(&key).await;
    assert!(e.variants.get(&key).is_none());
    assert!(e.revisions.get(&draft_key).is_none());
    assert_eq!(e.revisions.get(&published.key()).unwrap().lifecycle(), Lifecycle::DeletionProposed);

    let key = e.create_pv("foo-variant", spec("v1"));
    e.reconcile(&key).await;
    let revived = e.revisions.get(&published.key()).unwrap();
    assert_eq!(revived.lifecycle(), Lifecycle::Published);
    assert!(revived.is_owned_by(&e.pv(&key).uid().unwrap()));
    assert_eq!(e.downstream().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn orphan_policy_keeps_revisions_without_owner() {
    let e = env();
    e.publish_blueprint("a", &[("app.yaml", APP)]).await;
    let mut s = spec("v1");
    s["deletionPolicy"] = json!("orphan");
    let key = e.create_pv("foo-variant", s);
    e.reconcile(&key).await;
    e.variants.delete(&key).unwrap();
    e.reconcile(&key).await;

    assert!(e.variants.get(&key).is_none());
    let down = e.downstream();
    assert_eq!(down.len(), 1);
    assert!(down[0].metadata.owner_references.is_none());
    assert_eq!(down[0].lifecycle(), Lifecycle::Draft);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_and_unresolvable_variants_stall() {
    let e = env();
    let bad = e.create_pv("bad", json!({"upstream": {"repo": "blueprints", "package": "foo"}, "downstream": {"repo": "deployments", "package": "foo"}, "packageContext": {"data": {"name": "x"}}}));
    assert_eq!(e.reconcile(&bad).await, Action::Done);
    let pv = e.pv(&bad);
    let stalled = find_condition(&pv.status.conditions, STALLED).unwrap();
    assert!(stalled.is_true());
    assert_eq!(stalled.reason, "ValidationError");
    let msg = stalled.message.clone().unwrap_or_default();
    assert!(msg.contains("spec.upstream.revision") && msg.contains("reserved key"), "{msg}");
    assert!(pv.finalizers().is_empty());

    let missing = e.create_pv("missing", spec("v9"));
    assert!(matches!(e.reconcile(&missing).await, Action::RequeueAfter(_)));
    let pv = e.pv(&missing);
    assert_eq!(find_condition(&pv.status.conditions, STALLED).map(|c| c.reason.as_str()), Some("UpstreamNotFound"));
    assert!(e.downstream().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn proposal_returns_to_draft_when_variant_changes() {
    let e = env();
    e.publish_blueprint("a", &[(PACKAGE_CONTEXT_FILE, CTX)]).await;
    let key = e.create_pv("foo-variant", spec("v1"));
    e.reconcile(&key).await;
    let pr = e.downstream()[0].clone();
    e.revisions.set_lifecycle(&pr, Lifecycle::Proposed).await.unwrap();

    // unchanged variant: the proposal stays
    e.reconcile(&key).await;
    assert_eq!(e.downstream()[0].lifecycle(), Lifecycle::Proposed);

    e.edit_pv(&key, |pv| {
        pv.spec.pipeline = Some(serde_json::from_value(json!({"mutators": [{"image": "set-labels:v0.1", "name": "labels"}]})).unwrap())
    });
    e.reconcile(&key).await;
    let pr = &e.downstream()[0];
    assert_eq!(pr.lifecycle(), Lifecycle::Draft);
    let kptfile = yaml(&e.revisions.resources(&pr.key()).await.unwrap()[KPTFILE]);
    assert_eq!(kptfile["pipeline"]["mutators"][0]["name"], Value::from("PackageVariant.foo-variant.labels.0"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mutations_are_idempotent() {
    let e = env();
    e.publish_blueprint("a", &[(PACKAGE_CONTEXT_FILE, CTX), ("cfg.yaml", CFG)]).await;
    e.cluster
        .apply(json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "env", "namespace": "default"}, "data": {"endpoint": "x"}}))
        .unwrap();
    let mut s = spec("v1");
    s["packageContext"] = json!({"data": {"region": "eu"}});
    s["pipeline"] = json!({"validators": [{"image": "kubeval:v1", "name": "kubeval"}]});
    s["injectors"] = json!([{"kind": "ConfigMap", "name": "env"}]);
    let key = e.create_pv("foo-variant", s);
    let pv = e.pv(&key);

    let up = e.revisions.find_published("default", "blueprints", "foo", "v1").unwrap();
    let base = e.revisions.resources(&up.key()).await.unwrap();
    let once = apply_mutations(&pv, &base, &*e.cluster).await.unwrap();
    assert_ne!(once.resources, base);
    let twice = apply_mutations(&pv, &once.resources, &*e.cluster).await.unwrap();
    assert_eq!(twice.resources, once.resources);
    assert_eq!(twice.missing_required().count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn adopt_existing_takes_every_matching_draft() {
    let e = env();
    e.publish_blueprint("a", &[("app.yaml", APP)]).await;
    let up = porch_core::UpstreamRef { repository: "blueprints".into(), package: "foo".into(), revision: "v1".into() };
    let keys = [
        PackageRevisionKey::new("default", "deployments", "foo", "packagevariant-1"),
        PackageRevisionKey::new("default", "deployments", "foo", "hand-edit"),
    ];
    for k in &keys {
        e.revisions.create(NewRevision::new(k.clone(), Task::Clone { upstream: up.clone() })).await.unwrap();
    }

    let mut s = spec("v1");
    s["adoptionPolicy"] = json!("adoptExisting");
    let key = e.create_pv("foo-variant", s);
    e.reconcile(&key).await;

    let uid = e.pv(&key).uid().unwrap();
    let down = e.downstream();
    assert_eq!(down.len(), 2);
    for k in &keys {
        assert!(e.revisions.get(k).unwrap().is_owned_by(&uid), "{k} not adopted");
    }
    assert_eq!(e.pv(&key).status.downstream_targets.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retargeted_variant_releases_previous_downstream() {
    let e = env();
    e.publish_blueprint("a", &[("app.yaml", APP)]).await;
    e.publish_blueprint("b", &[("app.yaml", &APP.replace("\"1\"", "\"2\""))]).await;
    let key = e.create_pv("foo-variant", spec("v1"));
    e.reconcile(&key).await;
    let published = e.promote(&e.downstream()[0]).await;
    e.edit_pv(&key, |pv| pv.spec.upstream.as_mut().unwrap().revision = "v2".into());
    e.reconcile(&key).await;
    let draft_key = PackageRevisionKey::new("default", "deployments", "foo", "packagevariant-2");
    assert!(e.revisions.get(&draft_key).is_some());

    e.edit_pv(&key, |pv| pv.spec.downstream.as_mut().unwrap().package = "bar".into());
    e.reconcile(&key).await;

    assert!(e.revisions.get(&draft_key).is_none());
    assert_eq!(e.revisions.get(&published.key()).unwrap().lifecycle(), Lifecycle::DeletionProposed);
    let bar = e.revisions.list(&RevisionFilter::default().namespace("default").repository("deployments").package("bar"));
    assert_eq!(bar.len(), 1);
    assert_eq!(bar[0].spec.workspace_name, "packagevariant-1");
    assert!(bar[0].is_owned_by(&e.pv(&key).uid().unwrap()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retargeted_orphan_variant_disowns_previous_downstream() {
    let e = env();
    e.publish_blueprint("a", &[("app.yaml", APP)]).await;
    let mut s = spec("v1");
    s["deletionPolicy"] = json!("orphan");
    let key = e.create_pv("foo-variant", s);
    e.reconcile(&key).await;
    let old = e.downstream()[0].key();

    e.edit_pv(&key, |pv| pv.spec.downstream.as_mut().unwrap().package = "bar".into());
    e.reconcile(&key).await;

    let uid = e.pv(&key).uid().unwrap();
    let kept = e.revisions.get(&old).unwrap();
    assert_eq!(kept.lifecycle(), Lifecycle::Draft);
    assert!(!kept.is_owned_by(&uid));
    let bar = e.revisions.list(&RevisionFilter::default().namespace("default").repository("deployments").package("bar"));
    assert_eq!(bar.len(), 1);
    assert!(bar[0].is_owned_by(&uid));
}
