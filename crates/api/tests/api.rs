#![forbid(unsafe_code)]

use std::sync::Arc;

use kube::ResourceExt;
use porch_api::{ApiError, InProcApi, Porch, PorchApi};
use porch_controller::ControllerConfig;
use porch_core::condition::{is_condition_true, READY};
use porch_core::{Lifecycle, PackageRevision, PackageVariant, PackageVariantSet, Repository, RevisionFilter};
use porch_kubehub::MemoryClusterSource;
use porch_store::EventKind;
use porch_variantset::variant_name;
use serde_json::json;

const APP: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: app\ndata:\n  replicas: \"1\"\n";

fn api() -> InProcApi {
    let cluster = Arc::new(MemoryClusterSource::new());
    InProcApi::new(Arc::new(Porch::in_memory(cluster, ControllerConfig::default())))
}

fn repo(name: &str, deployment: bool) -> Repository {
    serde_json::from_value(json!({
        "metadata": {"name": name, "namespace": "default", "labels": {"env": if deployment { "prod" } else { "dev" }}},
        "spec": {"type": "git", "git": {"repo": format!("https://example.com/{name}.git")}, "deployment": deployment}
    }))
    .unwrap()
}

fn init_revision(repo: &str, package: &str, ws: &str) -> PackageRevision {
    serde_json::from_value(json!({
        "metadata": {"namespace": "default", "labels": {"team": "platform"}},
        "spec": {"repository": repo, "packageName": package, "workspaceName": ws, "tasks": [{"type": "init"}]}
    }))
    .unwrap()
}

async fn publish_blueprint(api: &InProcApi) -> PackageRevision {
    let pr = api.create_revision(init_revision("blueprints", "foo", "a")).await.unwrap();
    let mut res = api.get_resources("default", &pr.name_any()).await.unwrap();
    res.spec.resources.insert("app.yaml".into(), APP.into());
    api.update_resources(res).await.unwrap();
    let mut pr = api.get_revision("default", &pr.name_any()).await.unwrap();
    pr.spec.lifecycle = Lifecycle::Proposed;
    let mut pr = api.update_revision(pr).await.unwrap();
    pr.spec.lifecycle = Lifecycle::Published;
    api.update_revision(pr).await.unwrap()
}

async fn with_repos() -> InProcApi {
    let api = api();
    for (name, deployment) in [("blueprints", false), ("east", true), ("west", true)] {
        api.apply_repository(repo(name, deployment)).await.unwrap();
    }
    api
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn repositories_apply_list_and_delete() {
    let api = api();
    let created = api.apply_repository(repo("blueprints", false)).await.unwrap();
    assert!(created.uid().is_some());

    let mut edited = repo("blueprints", false);
    edited.spec.description = "shared blueprints".into();
    let updated = api.apply_repository(edited).await.unwrap();
    assert_eq!(updated.uid(), created.uid());
    assert_eq!(api.get_repository("default", "blueprints").await.unwrap().spec.description, "shared blueprints");
    assert_eq!(api.list_repositories(Some("default")).await.unwrap().len(), 1);

    api.delete_repository("default", "blueprints").await.unwrap();
    assert!(matches!(api.get_repository("default", "blueprints").await, Err(ApiError::NotFound(_))));
    assert!(matches!(api.delete_repository("default", "blueprints").await, Err(ApiError::NotFound(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn revision_lifecycle_and_guards() {
    let api = with_repos().await;
    let published = publish_blueprint(&api).await;
    assert_eq!(published.spec.revision, "v1");
    assert_eq!(published.labels().get("team").map(String::as_str), Some("platform"));

    let listed = api.list_revisions(RevisionFilter::default().repository("blueprints").lifecycle(Lifecycle::Published)).await.unwrap();
    assert_eq!(listed.len(), 1);

    assert!(matches!(api.create_revision(init_revision("blueprints", "foo", "a")).await, Err(ApiError::AlreadyExists(_))));
    let mut no_task = init_revision("blueprints", "bar", "a");
    no_task.spec.tasks.clear();
    assert!(matches!(api.create_revision(no_task).await, Err(ApiError::Validation(_))));

    let res = api.get_resources("default", &published.name_any()).await.unwrap();
    assert!(matches!(api.update_resources(res).await, Err(ApiError::Immutable(_))));
    assert!(matches!(api.delete_revision("default", &published.name_any()).await, Err(ApiError::Immutable(_))));

    let mut proposal = published.clone();
    proposal.spec.lifecycle = Lifecycle::DeletionProposed;
    api.update_revision(proposal).await.unwrap();
    api.delete_revision("default", &published.name_any()).await.unwrap();
    assert!(matches!(api.get_revision("default", &published.name_any()).await, Err(ApiError::NotFound(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dotted_and_nested_packages_resolve_by_name() {
    let api = with_repos().await;
    let nested = api.create_revision(init_revision("blueprints", "foo/bar", "a")).await.unwrap();
    let dotted = api.create_revision(init_revision("blueprints", "foo.bar", "a")).await.unwrap();
    assert_ne!(nested.name_any(), dotted.name_any());
    assert_eq!(api.get_revision("default", &nested.name_any()).await.unwrap().spec.package_name, "foo/bar");
    assert_eq!(api.get_revision("default", &dotted.name_any()).await.unwrap().spec.package_name, "foo.bar");

    let mut res = api.get_resources("default", &dotted.name_any()).await.unwrap();
    res.spec.resources.insert("app.yaml".into(), APP.into());
    api.update_resources(res).await.unwrap();
    let untouched = api.get_resources("default", &nested.name_any()).await.unwrap();
    assert!(!untouched.spec.resources.contains_key("app.yaml"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_writes_conflict() {
    let api = with_repos().await;
    let draft = api.create_revision(init_revision("blueprints", "foo", "a")).await.unwrap();
    let stale = api.get_resources("default", &draft.name_any()).await.unwrap();
    let mut first = stale.clone();
    first.spec.resources.insert("app.yaml".into(), APP.into());
    api.update_resources(first).await.unwrap();

    assert!(matches!(api.update_resources(stale).await, Err(ApiError::Conflict(_))));
    let mut old = draft.clone();
    old.spec.lifecycle = Lifecycle::Proposed;
    assert!(matches!(api.update_revision(old).await, Err(ApiError::Conflict(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watches_resume_from_a_sequence() {
    let api = api();
    let mut w = api.watch_repositories(None).await.unwrap();
    api.apply_repository(repo("blueprints", false)).await.unwrap();
    let added = w.rx.recv().await.unwrap();
    assert_eq!(added.kind, EventKind::Added);
    assert_eq!(added.object.name_any(), "blueprints");
    w.cancel.cancel();

    api.apply_repository(repo("east", true)).await.unwrap();
    api.delete_repository("default", "blueprints").await.unwrap();

    let mut resumed = api.watch_repositories(Some(added.seq)).await.unwrap();
    let first = resumed.rx.recv().await.unwrap();
    let second = resumed.rx.recv().await.unwrap();
    assert_eq!((first.kind, first.object.name_any()), (EventKind::Added, "east".to_string()));
    assert_eq!((second.kind, second.object.name_any()), (EventKind::Deleted, "blueprints".to_string()));
    assert!(second.seq > first.seq && first.seq > added.seq);
    resumed.cancel.cancel();

    let snapshot = api.watch_repositories(None).await.unwrap();
    let mut rx = snapshot.rx;
    let ev = rx.recv().await.unwrap();
    assert_eq!((ev.kind, ev.object.name_any()), (EventKind::Added, "east".to_string()));
    snapshot.cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn variant_settles_and_cleans_up() {
    let api = with_repos().await;
    publish_blueprint(&api).await;
    let pv: PackageVariant = serde_json::from_value(json!({
        "metadata": {"name": "foo-east", "namespace": "default"},
        "spec": {
            "upstream": {"repo": "blueprints", "package": "foo", "revision": "v1"},
            "downstream": {"repo": "east", "package": "foo"}
        }
    }))
    .unwrap();
    let pv = api.create_variant(pv).await.unwrap();
    assert!(matches!(api.create_variant(pv.clone()).await, Err(ApiError::AlreadyExists(_))));

    let porch = api.porch();
    porch.settle().await;
    let down = api.list_revisions(RevisionFilter::default().repository("east").package("foo")).await.unwrap();
    assert_eq!(down.len(), 1);
    assert_eq!(down[0].spec.workspace_name, "packagevariant-1");
    assert!(down[0].is_owned_by(&pv.uid().unwrap()));
    assert!(is_condition_true(&api.get_variant("default", "foo-east").await.unwrap().status.conditions, READY));

    // a second pass has nothing to write
    let seq = (porch.revisions.last_seq(), porch.variants.last_seq());
    assert_eq!(porch.settle().await, 1);
    assert_eq!((porch.revisions.last_seq(), porch.variants.last_seq()), seq);

    api.delete_variant("default", "foo-east").await.unwrap();
    porch.settle().await;
    assert!(matches!(api.get_variant("default", "foo-east").await, Err(ApiError::NotFound(_))));
    assert!(api.list_revisions(RevisionFilter::default().repository("east")).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn variant_set_settles_to_ready() {
    let api = with_repos().await;
    publish_blueprint(&api).await;
    let pvs: PackageVariantSet = serde_json::from_value(json!({
        "metadata": {"name": "edge", "namespace": "default"},
        "spec": {
            "upstream": {"repo": "blueprints", "package": "foo"},
            "targets": [{"repositorySelector": {"matchLabels": {"env": "prod"}}}]
        }
    }))
    .unwrap();
    api.create_variant_set(pvs).await.unwrap();
    api.porch().settle().await;

    let mut names: Vec<String> = api.list_variants(Some("default")).await.unwrap().iter().map(|pv| pv.name_any()).collect();
    names.sort();
    assert_eq!(names, vec![variant_name("edge", "east", "foo").unwrap(), variant_name("edge", "west", "foo").unwrap()]);
    let set = api.get_variant_set("default", "edge").await.unwrap();
    assert!(is_condition_true(&set.status.conditions, READY));
    for repo in ["east", "west"] {
        assert_eq!(api.list_revisions(RevisionFilter::default().repository(repo)).await.unwrap().len(), 1);
    }

    api.delete_variant_set("default", "edge").await.unwrap();
    api.porch().settle().await;
    assert!(api.list_variants(None).await.unwrap().is_empty());
    assert!(matches!(api.get_variant_set("default", "edge").await, Err(ApiError::NotFound(_))));
}
