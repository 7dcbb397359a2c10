//! Which sets to reconcile when something they expand from changes.

use kube::ResourceExt;
use porch_core::{owners_of_kind, ObjectKey, PackageRevision, PackageVariant, PackageVariantSet, Repository};
use porch_kubehub::ClusterEvent;
use porch_store::ObjectStore;

fn keys<'a>(sets: impl Iterator<Item = &'a PackageVariantSet>) -> Vec<ObjectKey> {
    let mut out: Vec<ObjectKey> = sets.map(ObjectKey::of).collect();
    out.sort();
    out.dedup();
    out
}

/// The set that generated the variant; its readiness feeds the set's status.
pub fn for_variant(pv: &PackageVariant) -> Vec<ObjectKey> {
    let namespace = pv.namespace().unwrap_or_default();
    owners_of_kind(&pv.metadata, "PackageVariantSet").map(|o| ObjectKey::new(&namespace, &o.name)).collect()
}

/// Sets expanding from the revision's package.
pub fn for_revision(pr: &PackageRevision, sets: &ObjectStore<PackageVariantSet>) -> Vec<ObjectKey> {
    let namespace = pr.namespace().unwrap_or_default();
    let key = pr.key();
    let all = sets.list(Some(&namespace));
    keys(all.iter().map(|s| &**s).filter(|s| s.spec.upstream.as_ref().map(|u| key.same_package(&u.repo, &u.package)).unwrap_or(false)))
}

/// Every set in the namespace: repositories feed selectors and template lookups.
pub fn for_repository(repo: &Repository, sets: &ObjectStore<PackageVariantSet>) -> Vec<ObjectKey> {
    let all = sets.list(repo.namespace().as_deref());
    keys(all.iter().map(|s| &**s))
}

/// Sets with an object selector over the event's kind.
pub fn for_cluster_event(ev: &ClusterEvent, sets: &ObjectStore<PackageVariantSet>) -> Vec<ObjectKey> {
    let api_version = if ev.gvk.group.is_empty() { ev.gvk.version.clone() } else { format!("{}/{}", ev.gvk.group, ev.gvk.version) };
    let all = sets.list(Some(&ev.namespace));
    keys(all.iter().map(|s| &**s).filter(|s| {
        s.spec.targets.iter().any(|t| t.object_selector.as_ref().map(|o| o.api_version == api_version && o.kind == ev.gvk.kind).unwrap_or(false))
    }))
}
