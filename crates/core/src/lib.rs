//! Porch core types: package revisions, variant intents, conditions and errors.
//!
//! Every API object implements [`kube::Resource`], so the usual
//! [`kube::ResourceExt`] accessors (`name_any`, `labels`, `owner_references`, ...)
//! work on them the same way they work on in-cluster objects.

#![forbid(unsafe_code)]

use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
use k8s_openapi::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

macro_rules! impl_resource {
    ($ty:ty, $group:literal, $version:literal, $kind:literal, $plural:literal) => {
        impl ::kube::Resource for $ty {
            type DynamicType = ();
            type Scope = ::k8s_openapi::NamespaceResourceScope;

            fn kind(_: &()) -> ::std::borrow::Cow<'_, str> { $kind.into() }
            fn group(_: &()) -> ::std::borrow::Cow<'_, str> { $group.into() }
            fn version(_: &()) -> ::std::borrow::Cow<'_, str> { $version.into() }
            fn plural(_: &()) -> ::std::borrow::Cow<'_, str> { $plural.into() }
            fn meta(&self) -> &::k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta { &self.metadata }
            fn meta_mut(&mut self) -> &mut ::k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta { &mut self.metadata }
        }
    };
}

pub mod condition;
pub mod error;
pub mod names;
pub mod repository;
pub mod revision;
pub mod selector;
pub mod variant;
pub mod variantset;

pub use condition::{Condition, ConditionStatus};
pub use error::{PorchError, PorchResult};
pub use repository::Repository;
pub use revision::{Lifecycle, PackageRevision, PackageRevisionKey, ResourceMap, RevisionFilter, Task, UpstreamRef};
pub use variant::PackageVariant;
pub use variantset::PackageVariantSet;

/// Well-known annotations on package resources.
pub mod annotations {
    /// Marks a resource as an injection point (`required` or `optional`).
    pub const CONFIG_INJECTION: &str = "kpt.dev/config-injection";
    /// Records which in-cluster object was injected.
    pub const INJECTED_RESOURCE_NAME: &str = "kpt.dev/injected-resource-name";
    /// Objects so marked are excluded from apply.
    pub const LOCAL_CONFIG: &str = "config.kubernetes.io/local-config";
}

/// Namespaced identity of an API object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    pub fn of<K: Resource>(obj: &K) -> Self {
        Self::new(obj.namespace().unwrap_or_default(), obj.name_any())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Namespaced API objects held by the object store and served by the API.
pub trait Object:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + fmt::Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<T> Object for T where
    T: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Serialize an object with its `apiVersion`/`kind` header, the way it appears in a manifest.
pub fn to_manifest<K: Object>(obj: &K) -> serde_json::Value {
    let mut v = serde_json::to_value(obj).unwrap_or(serde_json::Value::Null);
    if let Some(map) = v.as_object_mut() {
        map.insert("apiVersion".into(), K::api_version(&()).into_owned().into());
        map.insert("kind".into(), K::kind(&()).into_owned().into());
    }
    v
}

// ---- ownership edges ----

/// Controller owner reference pointing at `owner`; `None` until it has a name and uid.
pub fn owner_reference<K: Resource<DynamicType = ()>>(owner: &K) -> Option<OwnerReference> {
    owner.controller_owner_ref(&())
}

pub fn is_owned_by(meta: &ObjectMeta, owner_uid: &str) -> bool {
    meta.owner_references.iter().flatten().any(|o| o.uid == owner_uid)
}

/// Owner references of the given kind.
pub fn owners_of_kind<'a>(meta: &'a ObjectMeta, kind: &'a str) -> impl Iterator<Item = &'a OwnerReference> + 'a {
    meta.owner_references.iter().flatten().filter(move |o| o.kind == kind)
}

/// Returns true when the edge was added.
pub fn add_owner(meta: &mut ObjectMeta, owner: OwnerReference) -> bool {
    if is_owned_by(meta, &owner.uid) {
        return false;
    }
    meta.owner_references.get_or_insert_with(Vec::new).push(owner);
    true
}

/// Returns true when an edge was removed.
pub fn remove_owner(meta: &mut ObjectMeta, owner_uid: &str) -> bool {
    let Some(refs) = meta.owner_references.as_mut() else { return false };
    let before = refs.len();
    refs.retain(|o| o.uid != owner_uid);
    let changed = refs.len() != before;
    if refs.is_empty() {
        meta.owner_references = None;
    }
    changed
}

// ---- finalizers ----

pub fn is_deleting(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some()
}

pub fn add_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    let list = meta.finalizers.get_or_insert_with(Vec::new);
    if list.iter().any(|f| f == finalizer) {
        return false;
    }
    list.push(finalizer.to_string());
    true
}

pub fn remove_finalizer(meta: &mut ObjectMeta, finalizer: &str) -> bool {
    let Some(list) = meta.finalizers.as_mut() else { return false };
    let before = list.len();
    list.retain(|f| f != finalizer);
    let changed = list.len() != before;
    if list.is_empty() {
        meta.finalizers = None;
    }
    changed
}

pub fn now() -> Time {
    Time(chrono::Utc::now())
}

/// 64-bit FNV-1a; stable across processes and platforms.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf29ce484222325;
    for b in bytes {
        h ^= *b as u64;
        h = h.wrapping_mul(0x100000001b3);
    }
    h
}

pub mod prelude {
    pub use super::{
        Condition, ConditionStatus, Lifecycle, ObjectKey, Object, PackageRevision, PackageRevisionKey,
        PackageVariant, PackageVariantSet, PorchError, PorchResult, Repository, ResourceMap, RevisionFilter,
        Task, UpstreamRef,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(uid: &str) -> OwnerReference {
        OwnerReference {
            api_version: "config.porch.kpt.dev/v1alpha1".into(),
            kind: "PackageVariant".into(),
            name: "pv".into(),
            uid: uid.into(),
            controller: Some(true),
            block_owner_deletion: None,
        }
    }

    #[test]
    fn owner_edges_add_and_remove() {
        let mut meta = ObjectMeta::default();
        assert!(add_owner(&mut meta, owner("a")));
        assert!(!add_owner(&mut meta, owner("a")));
        assert!(add_owner(&mut meta, owner("b")));
        assert!(is_owned_by(&meta, "b"));
        assert!(remove_owner(&mut meta, "a"));
        assert!(remove_owner(&mut meta, "b"));
        assert!(meta.owner_references.is_none());
        assert!(!remove_owner(&mut meta, "b"));
    }

    #[test]
    fn finalizers_are_idempotent() {
        let mut meta = ObjectMeta::default();
        assert!(add_finalizer(&mut meta, "x"));
        assert!(!add_finalizer(&mut meta, "x"));
        assert!(remove_finalizer(&mut meta, "x"));
        assert!(meta.finalizers.is_none());
    }

    #[test]
    fn fnv_is_stable() {
        assert_eq!(fnv1a64(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a64(b"a"), fnv1a64(b"a"));
        assert_ne!(fnv1a64(b"a"), fnv1a64(b"b"));
    }
}
