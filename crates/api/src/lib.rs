//! Porch public API façade (in-process).
//!
//! This crate defines the typed request/response surface frontends (the CLI
//! today) depend on: create, read, update, delete, list and watch for
//! Repository, PackageRevision, PackageRevisionResources, PackageVariant and
//! PackageVariantSet. [`InProcApi`] serves it straight from a [`Porch`]
//! system; a remote implementation can slot in behind the same trait.

#![forbid(unsafe_code)]

mod error;
mod inproc;
mod system;

use porch_core::revision::PackageRevisionResources;
use porch_core::{PackageRevision, PackageVariant, PackageVariantSet, Repository, RevisionFilter};
use porch_store::EventKind;
use serde::{Deserialize, Serialize};

pub use error::{ApiError, ApiResult};
pub use inproc::InProcApi;
pub use system::{Porch, MAX_SETTLE_ROUNDS};

/// One change seen by a watch. Pass `seq` back as `since` to resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEvent<T> {
    pub seq: u64,
    pub kind: EventKind,
    pub object: T,
}

/// Declarative Porch API surface.
#[async_trait::async_trait]
pub trait PorchApi: Send + Sync {
    async fn list_repositories(&self, namespace: Option<&str>) -> ApiResult<Vec<Repository>>;
    async fn get_repository(&self, namespace: &str, name: &str) -> ApiResult<Repository>;
    /// Create the repository, or update it when it exists.
    async fn apply_repository(&self, repo: Repository) -> ApiResult<Repository>;
    async fn delete_repository(&self, namespace: &str, name: &str) -> ApiResult<()>;
    async fn watch_repositories(&self, since: Option<u64>) -> ApiResult<StreamHandle<ApiEvent<Repository>>>;

    async fn list_revisions(&self, filter: RevisionFilter) -> ApiResult<Vec<PackageRevision>>;
    async fn get_revision(&self, namespace: &str, name: &str) -> ApiResult<PackageRevision>;
    /// Create a draft. Repository, package and workspace come from `spec`;
    /// `spec.tasks[0]` (init or clone) says how to fill it.
    async fn create_revision(&self, pr: PackageRevision) -> ApiResult<PackageRevision>;
    /// Apply a lifecycle change and metadata (labels, annotations, owners, finalizers).
    async fn update_revision(&self, pr: PackageRevision) -> ApiResult<PackageRevision>;
    async fn delete_revision(&self, namespace: &str, name: &str) -> ApiResult<()>;
    async fn watch_revisions(&self, since: Option<u64>) -> ApiResult<StreamHandle<ApiEvent<PackageRevision>>>;

    async fn get_resources(&self, namespace: &str, name: &str) -> ApiResult<PackageRevisionResources>;
    /// Replace the files of a draft; the result is rendered before it is stored.
    async fn update_resources(&self, res: PackageRevisionResources) -> ApiResult<PackageRevisionResources>;

    async fn list_variants(&self, namespace: Option<&str>) -> ApiResult<Vec<PackageVariant>>;
    async fn get_variant(&self, namespace: &str, name: &str) -> ApiResult<PackageVariant>;
    async fn create_variant(&self, pv: PackageVariant) -> ApiResult<PackageVariant>;
    async fn update_variant(&self, pv: PackageVariant) -> ApiResult<PackageVariant>;
    async fn delete_variant(&self, namespace: &str, name: &str) -> ApiResult<()>;
    async fn watch_variants(&self, since: Option<u64>) -> ApiResult<StreamHandle<ApiEvent<PackageVariant>>>;

    async fn list_variant_sets(&self, namespace: Option<&str>) -> ApiResult<Vec<PackageVariantSet>>;
    async fn get_variant_set(&self, namespace: &str, name: &str) -> ApiResult<PackageVariantSet>;
    async fn create_variant_set(&self, pvs: PackageVariantSet) -> ApiResult<PackageVariantSet>;
    async fn update_variant_set(&self, pvs: PackageVariantSet) -> ApiResult<PackageVariantSet>;
    async fn delete_variant_set(&self, namespace: &str, name: &str) -> ApiResult<()>;
    async fn watch_variant_sets(&self, since: Option<u64>) -> ApiResult<StreamHandle<ApiEvent<PackageVariantSet>>>;
}

// ----------------- Streaming primitives -----------------

/// Cancellation handle that aborts the underlying task.
pub struct CancelHandle {
    task: Option<tokio::task::JoinHandle<()>>,
}

impl CancelHandle {
    pub fn cancel(mut self) {
        if let Some(h) = self.task.take() {
            h.abort();
        }
    }
}

/// Generic stream handle used by API watch endpoints.
pub struct StreamHandle<T> {
    pub rx: tokio::sync::mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}
