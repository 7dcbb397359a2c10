//! Expand a PackageVariantSet into the PackageVariants it should own.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use porch_core::names::derive_name;
use porch_core::variant::Upstream;
use porch_core::variantset::PACKAGE_VARIANT_SET_LABEL;
use porch_core::{owner_reference, ObjectKey, PackageRevision, PackageVariant, PackageVariantSet, PorchError, PorchResult, Repository};
use porch_kubehub::ClusterSource;
use porch_store::ObjectStore;
use tracing::warn;

use crate::targets::{candidates, Candidate};
use crate::template::{downstream_repo, object_view, render_spec, Scope};

/// Desired variants, ordered by name, and the problems that kept some
/// targets from producing any.
#[derive(Debug, Default)]
pub struct Expansion {
    pub variants: Vec<PackageVariant>,
    pub errors: Vec<String>,
}

impl Expansion {
    pub fn is_complete(&self) -> bool { self.errors.is_empty() }
}

/// Generated variants are named after the set, repository and package,
/// with a hash suffix that keeps distinct triples apart.
pub fn variant_name(set: &str, repo: &str, package: &str) -> PorchResult<String> {
    derive_name(&[set, repo, package])
}

fn render(
    pvs: &PackageVariantSet,
    c: &Candidate<'_>,
    upstream: &Upstream,
    upstream_view: &serde_json::Value,
    repos: &ObjectStore<Repository>,
) -> PorchResult<PackageVariant> {
    let namespace = pvs.namespace().unwrap_or_default();
    let scope = Scope::new(&c.repo_default, &c.package_default, upstream_view.clone(), c.target.clone());
    let repo_name = downstream_repo(c.template, &scope)?;
    let repo = repos
        .get(&ObjectKey::new(&namespace, &repo_name))
        .ok_or_else(|| PorchError::expansion(format!("downstream repository {namespace}/{repo_name} not found")))?;
    let scope = scope.with_repository(&repo);
    let spec = render_spec(c.template, &scope, upstream, &repo_name)?;
    let package = spec.downstream.as_ref().map(|d| d.package.clone()).unwrap_or_default();
    let owner = owner_reference(pvs).ok_or_else(|| PorchError::validation("package variant set has no uid"))?;
    Ok(PackageVariant {
        metadata: ObjectMeta {
            name: Some(variant_name(&pvs.name_any(), &repo_name, &package)?),
            namespace: Some(namespace),
            labels: Some(BTreeMap::from([(PACKAGE_VARIANT_SET_LABEL.to_string(), pvs.name_any())])),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec,
        status: Default::default(),
    })
}

/// Evaluate every target of `pvs` against the resolved `upstream` revision.
///
/// A target that fails contributes an error and no variants; the other
/// targets still expand. A candidate that renders to a name an earlier one
/// already took is reported as an error and the first is kept.
pub async fn expand(
    pvs: &PackageVariantSet,
    upstream: &Upstream,
    upstream_pr: &PackageRevision,
    repos: &ObjectStore<Repository>,
    cluster: &dyn ClusterSource,
) -> Expansion {
    let namespace = pvs.namespace().unwrap_or_default();
    let upstream_view = object_view(&upstream_pr.metadata);
    let mut out = Expansion::default();
    let mut by_name: BTreeMap<String, (usize, PackageVariant)> = BTreeMap::new();
    for (i, target) in pvs.spec.targets.iter().enumerate() {
        let found = match candidates(target, pvs.spec.template.as_ref(), &namespace, &upstream.package, repos, cluster).await {
            Ok(c) => c,
            Err(e) => {
                out.errors.push(format!("spec.targets[{i}]: {e}"));
                continue;
            }
        };
        let rendered: PorchResult<Vec<PackageVariant>> =
            found.iter().map(|c| render(pvs, c, upstream, &upstream_view, repos)).collect();
        match rendered {
            Ok(pvs_for_target) => {
                for pv in pvs_for_target {
                    let name = pv.name_any();
                    if let Some((first, _)) = by_name.get(&name) {
                        warn!(pvs = %ObjectKey::of(pvs), variant = %name, "duplicate generated package variant");
                        let down = pv.spec.downstream.as_ref().map(|d| format!("{}/{}", d.repo, d.package)).unwrap_or_default();
                        out.errors.push(format!("spec.targets[{i}]: downstream {down} is already generated by spec.targets[{first}]"));
                        continue;
                    }
                    by_name.insert(name, (i, pv));
                }
            }
            Err(e) => out.errors.push(format!("spec.targets[{i}]: {e}")),
        }
    }
    out.variants = by_name.into_values().map(|(_, pv)| pv).collect();
    out
}
