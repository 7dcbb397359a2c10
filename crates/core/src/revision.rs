//! Package revisions: identity, lifecycle, task history and revision ordering.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use crate::condition::{find_condition, Condition};
use crate::{fnv1a64, is_owned_by, PorchError, PorchResult};

/// Package-relative slash-separated path to file contents.
pub type ResourceMap = BTreeMap<String, String>;

/// Workspace names generated by the variant reconciler.
pub const WORKSPACE_PREFIX: &str = "packagevariant-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Lifecycle {
    #[default]
    Draft,
    Proposed,
    Published,
    DeletionProposed,
}

impl Lifecycle {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "Draft",
            Self::Proposed => "Proposed",
            Self::Published => "Published",
            Self::DeletionProposed => "DeletionProposed",
        }
    }

    /// Published and DeletionProposed revisions carry a revision string and frozen contents.
    pub fn is_published(self) -> bool {
        matches!(self, Self::Published | Self::DeletionProposed)
    }

    pub fn is_draft_like(self) -> bool {
        matches!(self, Self::Draft | Self::Proposed)
    }

    /// Edges of the lifecycle graph. `Proposed -> Draft` rejects a proposal and
    /// `DeletionProposed -> Published` revives a revision.
    pub fn can_transition_to(self, to: Lifecycle) -> bool {
        use Lifecycle::*;
        matches!(
            (self, to),
            (Draft, Proposed) | (Proposed, Draft) | (Proposed, Published) | (Published, DeletionProposed) | (DeletionProposed, Published)
        )
    }

    /// Drafts, proposals and deletion proposals may be removed; published revisions may not.
    pub fn can_delete(self) -> bool {
        !matches!(self, Self::Published)
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `(repository, package, workspace)` within a namespace; at most one revision per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageRevisionKey {
    pub namespace: String,
    pub repository: String,
    pub package: String,
    pub workspace: String,
}

impl PackageRevisionKey {
    pub fn new(namespace: impl Into<String>, repository: impl Into<String>, package: impl Into<String>, workspace: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), repository: repository.into(), package: package.into(), workspace: workspace.into() }
    }

    /// Object name of the revision: `<repo>.<package with / as .>.<workspace>`.
    ///
    /// If any part already contains a `.` that form no longer splits back
    /// into one key, so the name becomes the dot-free
    /// `<repo>-<package>-<workspace>-<hash>` instead.
    pub fn object_name(&self) -> String {
        let parts = [self.repository.as_str(), self.package.as_str(), self.workspace.as_str()];
        if !parts.iter().any(|p| p.contains('.')) {
            return format!("{}.{}.{}", self.repository, self.package.replace('/', "."), self.workspace);
        }
        let readable = parts.join("-").replace(['.', '/'], "-");
        format!("{readable}-{:016x}", fnv1a64(parts.join("\0").as_bytes()))
    }

    pub fn same_package(&self, repository: &str, package: &str) -> bool {
        self.repository == repository && self.package == package
    }
}

impl fmt::Display for PackageRevisionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.namespace, self.repository, self.package, self.workspace)
    }
}

/// Reference to a published upstream revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamRef {
    pub repository: String,
    pub package: String,
    pub revision: String,
}

impl fmt::Display for UpstreamRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.repository, self.package, self.revision)
    }
}

/// Ordered history entry. `tasks[0]` is always `init` or `clone`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Task {
    Init {
        #[serde(default, skip_serializing_if = "String::is_empty")]
        description: String,
    },
    Clone { upstream: UpstreamRef },
    Update { upstream: UpstreamRef },
    Eval {
        image: String,
        #[serde(default, rename = "configMap", skip_serializing_if = "BTreeMap::is_empty")]
        config_map: BTreeMap<String, String>,
    },
}

impl Task {
    pub fn is_creation(&self) -> bool {
        matches!(self, Task::Init { .. } | Task::Clone { .. })
    }

    pub fn upstream(&self) -> Option<&UpstreamRef> {
        match self {
            Task::Clone { upstream } | Task::Update { upstream } => Some(upstream),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Task::Init { .. } => "init",
            Task::Clone { .. } => "clone",
            Task::Update { .. } => "update",
            Task::Eval { .. } => "eval",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRevisionSpec {
    pub repository: String,
    pub package_name: String,
    pub workspace_name: String,
    /// Empty until published.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision: String,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub readiness_gates: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRevisionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_lock: Option<UpstreamRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PackageRevision {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: PackageRevisionSpec,
    #[serde(default)]
    pub status: PackageRevisionStatus,
}

impl_resource!(PackageRevision, "porch.kpt.dev", "v1alpha1", "PackageRevision", "packagerevisions");

impl PackageRevision {
    /// A fresh draft whose history starts with `creation`.
    pub fn draft(key: &PackageRevisionKey, creation: Task) -> PorchResult<Self> {
        if !creation.is_creation() {
            return Err(PorchError::validation(format!("first task must be init or clone, got {}", creation.type_name())));
        }
        let upstream_lock = creation.upstream().cloned();
        Ok(Self {
            metadata: ObjectMeta {
                name: Some(key.object_name()),
                namespace: Some(key.namespace.clone()),
                ..Default::default()
            },
            spec: PackageRevisionSpec {
                repository: key.repository.clone(),
                package_name: key.package.clone(),
                workspace_name: key.workspace.clone(),
                revision: String::new(),
                lifecycle: Lifecycle::Draft,
                tasks: vec![creation],
                readiness_gates: Vec::new(),
            },
            status: PackageRevisionStatus { upstream_lock, ..Default::default() },
        })
    }

    pub fn key(&self) -> PackageRevisionKey {
        PackageRevisionKey::new(
            self.namespace().unwrap_or_default(),
            &self.spec.repository,
            &self.spec.package_name,
            &self.spec.workspace_name,
        )
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.spec.lifecycle
    }

    /// Upstream recorded by the latest clone/update task.
    pub fn upstream(&self) -> Option<&UpstreamRef> {
        self.spec.tasks.iter().rev().find_map(Task::upstream)
    }

    pub fn revision_number(&self) -> Option<u64> {
        revision_number(&self.spec.revision)
    }

    pub fn is_owned_by(&self, owner_uid: &str) -> bool {
        is_owned_by(&self.metadata, owner_uid)
    }

    /// Readiness gates with no equally named `True` condition.
    pub fn unsatisfied_gates(&self) -> Vec<&str> {
        self.spec
            .readiness_gates
            .iter()
            .filter(|g| !find_condition(&self.status.conditions, g).map(Condition::is_true).unwrap_or(false))
            .map(String::as_str)
            .collect()
    }

    pub fn resource_version(&self) -> u64 {
        self.metadata.resource_version.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0)
    }
}

/// Selection over the revision catalogue; unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RevisionFilter {
    pub namespace: Option<String>,
    pub repository: Option<String>,
    pub package: Option<String>,
    pub workspace: Option<String>,
    pub lifecycle: Option<Lifecycle>,
    pub owner_uid: Option<String>,
}

impl RevisionFilter {
    pub fn namespace(mut self, ns: impl Into<String>) -> Self { self.namespace = Some(ns.into()); self }
    pub fn repository(mut self, repo: impl Into<String>) -> Self { self.repository = Some(repo.into()); self }
    pub fn package(mut self, pkg: impl Into<String>) -> Self { self.package = Some(pkg.into()); self }
    pub fn workspace(mut self, ws: impl Into<String>) -> Self { self.workspace = Some(ws.into()); self }
    pub fn lifecycle(mut self, lc: Lifecycle) -> Self { self.lifecycle = Some(lc); self }
    pub fn owner(mut self, uid: impl Into<String>) -> Self { self.owner_uid = Some(uid.into()); self }

    pub fn matches(&self, pr: &PackageRevision) -> bool {
        fn eq(want: &Option<String>, have: &str) -> bool {
            want.as_deref().map(|w| w == have).unwrap_or(true)
        }
        eq(&self.namespace, pr.metadata.namespace.as_deref().unwrap_or(""))
            && eq(&self.repository, &pr.spec.repository)
            && eq(&self.package, &pr.spec.package_name)
            && eq(&self.workspace, &pr.spec.workspace_name)
            && self.lifecycle.map(|l| l == pr.spec.lifecycle).unwrap_or(true)
            && self.owner_uid.as_deref().map(|u| pr.is_owned_by(u)).unwrap_or(true)
    }
}

/// Edit surface for a revision's file tree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PackageRevisionResources {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: PackageRevisionResourcesSpec,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRevisionResourcesSpec {
    pub repository: String,
    pub package_name: String,
    pub workspace_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision: String,
    #[serde(default)]
    pub resources: ResourceMap,
}

impl_resource!(PackageRevisionResources, "porch.kpt.dev", "v1alpha1", "PackageRevisionResources", "packagerevisionresources");

impl PackageRevisionResources {
    pub fn of(pr: &PackageRevision, resources: ResourceMap) -> Self {
        Self {
            metadata: ObjectMeta {
                name: pr.metadata.name.clone(),
                namespace: pr.metadata.namespace.clone(),
                resource_version: pr.metadata.resource_version.clone(),
                ..Default::default()
            },
            spec: PackageRevisionResourcesSpec {
                repository: pr.spec.repository.clone(),
                package_name: pr.spec.package_name.clone(),
                workspace_name: pr.spec.workspace_name.clone(),
                revision: pr.spec.revision.clone(),
                resources,
            },
        }
    }
}

// ---- revision and workspace numbering ----

/// `v<N>` -> N.
pub fn revision_number(rev: &str) -> Option<u64> {
    rev.strip_prefix('v')?.parse().ok()
}

/// Numeric by the integer after `v`; unparsable revisions sort before numbered ones.
pub fn compare_revisions(a: &str, b: &str) -> Ordering {
    match (revision_number(a), revision_number(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.cmp(b),
    }
}

/// Next published revision given the revisions already taken in a package.
pub fn next_revision<'a>(existing: impl IntoIterator<Item = &'a str>) -> String {
    let max = existing.into_iter().filter_map(revision_number).max().unwrap_or(0);
    format!("v{}", max + 1)
}

/// `packagevariant-N` -> N.
pub fn workspace_number(ws: &str) -> Option<u64> {
    ws.strip_prefix(WORKSPACE_PREFIX)?.parse().ok()
}

/// `packagevariant-<1 + max existing suffix>`.
pub fn next_workspace<'a>(existing: impl IntoIterator<Item = &'a str>) -> String {
    let max = existing.into_iter().filter_map(workspace_number).max().unwrap_or(0);
    format!("{}{}", WORKSPACE_PREFIX, max + 1)
}
