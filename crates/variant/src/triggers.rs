//! Which variants to reconcile when something they depend on changes.

use kube::ResourceExt;
use porch_core::variant::InjectionSelector;
use porch_core::{owners_of_kind, ObjectKey, PackageRevision, PackageVariant, Repository};
use porch_kubehub::ClusterEvent;
use porch_store::ObjectStore;

fn keys<'a>(variants: impl Iterator<Item = &'a PackageVariant>) -> Vec<ObjectKey> {
    let mut out: Vec<ObjectKey> = variants.map(ObjectKey::of).collect();
    out.sort();
    out.dedup();
    out
}

/// Owners of the revision, plus variants that use its package upstream or
/// downstream (a new upstream revision, or a draft to adopt).
pub fn for_revision(pr: &PackageRevision, variants: &ObjectStore<PackageVariant>) -> Vec<ObjectKey> {
    let namespace = pr.namespace().unwrap_or_default();
    let key = pr.key();
    let mut out: Vec<ObjectKey> = owners_of_kind(&pr.metadata, "PackageVariant").map(|o| ObjectKey::new(&namespace, &o.name)).collect();
    let all = variants.list(Some(&namespace));
    out.extend(keys(all.iter().map(|pv| &**pv).filter(|pv| {
        pv.spec.upstream.as_ref().map(|u| key.same_package(&u.repo, &u.package)).unwrap_or(false)
            || pv.spec.downstream.as_ref().map(|d| key.same_package(&d.repo, &d.package)).unwrap_or(false)
    })));
    out.sort();
    out.dedup();
    out
}

pub fn for_repository(repo: &Repository, variants: &ObjectStore<PackageVariant>) -> Vec<ObjectKey> {
    let name = repo.name_any();
    let all = variants.list(repo.namespace().as_deref());
    keys(all.iter().map(|pv| &**pv).filter(|pv| {
        pv.spec.upstream.as_ref().map(|u| u.repo == name).unwrap_or(false)
            || pv.spec.downstream.as_ref().map(|d| d.repo == name).unwrap_or(false)
    }))
}

fn selects(sel: &InjectionSelector, ev: &ClusterEvent) -> bool {
    fn eq(want: &Option<String>, have: &str) -> bool {
        want.as_deref().map(|w| w == have).unwrap_or(true)
    }
    sel.name == ev.name && eq(&sel.group, &ev.gvk.group) && eq(&sel.version, &ev.gvk.version) && eq(&sel.kind, &ev.gvk.kind)
}

/// Variants in the event's namespace with an injector naming the object.
pub fn for_cluster_event(ev: &ClusterEvent, variants: &ObjectStore<PackageVariant>) -> Vec<ObjectKey> {
    let all = variants.list(Some(&ev.namespace));
    keys(all.iter().map(|pv| &**pv).filter(|pv| pv.spec.injectors.iter().any(|s| selects(s, ev))))
}
