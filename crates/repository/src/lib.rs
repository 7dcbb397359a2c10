//! Porch repository abstraction.
//!
//! [`PackageRepository`] is the uniform read/write surface over a package
//! store. The Git and OCI wire backends are external; this crate ships the
//! table-backed implementation with all revision rules, an in-memory table,
//! clone helpers and the structural three-way merge used by `update` tasks.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use porch_core::{Lifecycle, PackageRevision, PackageRevisionKey, PorchResult, ResourceMap, RevisionFilter, Task};

pub mod clone;
pub mod merge;
pub mod registry;
pub mod table;

pub use registry::{MemoryOpener, RepositoryOpener, RepositoryRegistry};
pub use table::{MemoryTable, RevisionTable, StoredRevision, TableRepository};

/// Read/write access to the package revisions of one repository.
///
/// Every write carries the caller's view of the revision; a stale resource
/// version fails with `Conflict`.
#[async_trait]
pub trait PackageRepository: Send + Sync {
    fn namespace(&self) -> &str;
    fn name(&self) -> &str;

    async fn list_revisions(&self, filter: &RevisionFilter) -> PorchResult<Vec<PackageRevision>>;

    async fn get_resources(&self, key: &PackageRevisionKey) -> PorchResult<ResourceMap>;

    /// Store a new Draft. `draft.spec.tasks[0]` must be `init` or `clone`.
    async fn create_draft(&self, draft: PackageRevision, resources: ResourceMap) -> PorchResult<PackageRevision>;

    /// Replace a Draft or Proposed revision's resources, optionally appending a task.
    /// Labels, annotations and owner references are taken from `pr`.
    async fn update_draft(&self, pr: &PackageRevision, resources: ResourceMap, task: Option<Task>) -> PorchResult<PackageRevision>;

    /// Write labels, annotations, owner references and finalizers; allowed in every lifecycle.
    async fn update_metadata(&self, pr: &PackageRevision) -> PorchResult<PackageRevision>;

    async fn set_lifecycle(&self, pr: &PackageRevision, lifecycle: Lifecycle) -> PorchResult<PackageRevision>;

    async fn delete(&self, pr: &PackageRevision) -> PorchResult<()>;
}
