//! Resolve PackageVariantSet targets into expansion candidates.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::core::GroupVersionKind;
use kube::ResourceExt;
use porch_core::selector::labels_match;
use porch_core::variantset::{ObjectSelector, PackageVariantTemplate, Target};
use porch_core::{PorchError, PorchResult, Repository};
use porch_kubehub::ClusterSource;
use porch_store::ObjectStore;
use serde_json::{json, Value as Json};

use crate::template::object_view;

/// One `(repo, package, target object)` triple, with the template that applies to it.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate<'a> {
    pub repo_default: String,
    pub package_default: String,
    /// Whitelisted view of the target, or `{repo, package}` for explicit lists.
    pub target: Json,
    pub template: Option<&'a PackageVariantTemplate>,
}

/// Which of the three target forms a target uses.
pub fn check_target(i: usize, t: &Target) -> PorchResult<()> {
    let forms = [!t.repositories.is_empty(), t.repository_selector.is_some(), t.object_selector.is_some()];
    match forms.iter().filter(|f| **f).count() {
        1 => Ok(()),
        0 => Err(PorchError::validation(format!(
            "spec.targets[{i}]: one of repositories, repositorySelector or objectSelector is required"
        ))),
        _ => Err(PorchError::validation(format!(
            "spec.targets[{i}]: repositories, repositorySelector and objectSelector are mutually exclusive"
        ))),
    }
}

fn package_names<'n>(names: &'n [String], upstream_package: &'n str) -> Vec<&'n str> {
    if names.is_empty() { vec![upstream_package] } else { names.iter().map(String::as_str).collect() }
}

fn split_api_version(api_version: &str) -> (&str, &str) {
    api_version.split_once('/').unwrap_or(("", api_version))
}

async fn selected_objects(sel: &ObjectSelector, namespace: &str, cluster: &dyn ClusterSource) -> PorchResult<Vec<Json>> {
    let (group, version) = split_api_version(&sel.api_version);
    let gvk = GroupVersionKind::gvk(group, version, &sel.kind);
    let selector = sel.label_selector();
    let mut out = Vec::new();
    for obj in cluster.list(&gvk, namespace).await? {
        if sel.name.as_deref().map(|n| n != obj.name_any()).unwrap_or(false) {
            continue;
        }
        if labels_match(&selector, obj.labels())? {
            out.push(object_view(&obj.metadata));
        }
    }
    Ok(out)
}

fn selected_repositories(selector: &LabelSelector, namespace: &str, repos: &ObjectStore<Repository>) -> PorchResult<Vec<Json>> {
    let mut out = Vec::new();
    for repo in repos.list(Some(namespace)) {
        if labels_match(selector, repo.labels())? {
            out.push(object_view(&repo.metadata));
        }
    }
    Ok(out)
}

/// Candidates of one target. `fallback` is the set-level template.
pub async fn candidates<'a>(
    target: &'a Target,
    fallback: Option<&'a PackageVariantTemplate>,
    namespace: &str,
    upstream_package: &str,
    repos: &ObjectStore<Repository>,
    cluster: &dyn ClusterSource,
) -> PorchResult<Vec<Candidate<'a>>> {
    let template = target.template.as_ref().or(fallback);
    let candidate = |repo: &str, package: &str, target: Json| Candidate {
        repo_default: repo.to_string(),
        package_default: package.to_string(),
        target,
        template,
    };
    let mut out = Vec::new();
    if !target.repositories.is_empty() {
        for r in &target.repositories {
            for pkg in package_names(&r.package_names, upstream_package) {
                out.push(candidate(&r.name, pkg, json!({"repo": r.name, "package": pkg})));
            }
        }
    } else if let Some(selector) = &target.repository_selector {
        for view in selected_repositories(selector, namespace, repos)? {
            let repo = view["name"].as_str().unwrap_or_default().to_string();
            for pkg in package_names(&target.package_names, upstream_package) {
                out.push(candidate(&repo, pkg, view.clone()));
            }
        }
    } else if let Some(sel) = &target.object_selector {
        for view in selected_objects(sel, namespace, cluster).await? {
            let name = view["name"].as_str().unwrap_or_default().to_string();
            out.push(candidate(&name, upstream_package, view));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use porch_kubehub::MemoryClusterSource;

    fn repo(name: &str, labels: Json) -> Repository {
        serde_json::from_value(json!({
            "metadata": {"name": name, "namespace": "default", "labels": labels},
            "spec": {"type": "git", "git": {"repo": format!("https://example.com/{name}.git")}, "deployment": true}
        }))
        .unwrap()
    }

    fn target(v: Json) -> Target {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn exactly_one_target_form() {
        assert!(check_target(0, &target(json!({"repositories": [{"name": "a"}]}))).is_ok());
        assert!(matches!(check_target(1, &target(json!({}))), Err(PorchError::Validation(_))));
        let both = target(json!({"repositories": [{"name": "a"}], "repositorySelector": {"matchLabels": {"env": "prod"}}}));
        assert!(matches!(check_target(2, &both), Err(PorchError::Validation(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn explicit_lists_default_to_the_upstream_package() {
        let repos = ObjectStore::new(16);
        let cluster = MemoryClusterSource::new();
        let t = target(json!({"repositories": [{"name": "east"}, {"name": "west", "packageNames": ["a", "b"]}]}));
        let got = candidates(&t, None, "default", "foo", &repos, &cluster).await.unwrap();
        let pairs: Vec<(&str, &str)> = got.iter().map(|c| (c.repo_default.as_str(), c.package_default.as_str())).collect();
        assert_eq!(pairs, vec![("east", "foo"), ("west", "a"), ("west", "b")]);
        assert_eq!(got[0].target, json!({"repo": "east", "package": "foo"}));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn repository_selector_matches_labels() {
        let repos = ObjectStore::new(16);
        repos.create(repo("east", json!({"env": "prod"}))).unwrap();
        repos.create(repo("west", json!({"env": "prod"}))).unwrap();
        repos.create(repo("lab", json!({"env": "test"}))).unwrap();
        let cluster = MemoryClusterSource::new();
        let t = target(json!({"repositorySelector": {"matchLabels": {"env": "prod"}}}));
        let got = candidates(&t, None, "default", "foo", &repos, &cluster).await.unwrap();
        let names: Vec<&str> = got.iter().map(|c| c.repo_default.as_str()).collect();
        assert_eq!(names, vec!["east", "west"]);
        assert_eq!(got[0].target["labels"]["env"], "prod");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn object_selector_yields_one_candidate_per_object() {
        let repos = ObjectStore::new(16);
        let cluster = MemoryClusterSource::new();
        for (name, region) in [("edge-1", "us-east1"), ("edge-2", "eu-west1")] {
            cluster
                .apply(json!({
                    "apiVersion": "infra.example.com/v1", "kind": "Site",
                    "metadata": {"name": name, "namespace": "default", "labels": {"region": region}}
                }))
                .unwrap();
        }
        let t = target(json!({
            "objectSelector": {"apiVersion": "infra.example.com/v1", "kind": "Site", "matchLabels": {"region": "us-east1"}},
            "template": {"downstream": {"repo": "edge"}}
        }));
        let got = candidates(&t, None, "default", "foo", &repos, &cluster).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].repo_default, "edge-1");
        assert_eq!(got[0].package_default, "foo");
        assert!(got[0].template.is_some());
    }
}
