use std::sync::Arc;
use std::time::Instant;

use porch_core::revision::PackageRevisionResources;
use porch_core::{Object, ObjectKey, PackageRevision, PackageVariant, PackageVariantSet, Repository, RevisionFilter};
use porch_store::{NewRevision, ObjectStore, Watch};
use metrics::counter;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::{ApiError, ApiEvent, ApiResult, CancelHandle, Porch, PorchApi, StreamHandle};

const WATCH_BUFFER: usize = 256;

/// Serves the API straight from an in-process [`Porch`].
#[derive(Clone)]
pub struct InProcApi {
    porch: Arc<Porch>,
}

impl InProcApi {
    pub fn new(porch: Arc<Porch>) -> Self { Self { porch } }

    pub fn porch(&self) -> &Arc<Porch> { &self.porch }

    fn revision(&self, namespace: &str, name: &str) -> ApiResult<Arc<PackageRevision>> {
        self.porch
            .revisions
            .get_by_name(namespace, name)
            .ok_or_else(|| ApiError::NotFound(format!("package revision {namespace}/{name}")))
    }
}

fn list_of<T: Object>(store: &ObjectStore<T>, namespace: Option<&str>) -> Vec<T> {
    store.list(namespace).iter().map(|o| (**o).clone()).collect()
}

fn get_of<T: Object>(store: &ObjectStore<T>, namespace: &str, name: &str) -> ApiResult<T> {
    store
        .get(&ObjectKey::new(namespace, name))
        .map(|o| (*o).clone())
        .ok_or_else(|| ApiError::NotFound(format!("{} {namespace}/{name}", T::kind(&()))))
}

/// Initial events first, then the live broadcast. A receiver that falls
/// behind ends the stream; the caller resumes from the last seq it saw.
fn stream<T>(what: &'static str, watch: Watch<T>) -> StreamHandle<ApiEvent<T>>
where
    T: Clone + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel(WATCH_BUFFER);
    let Watch { initial, rx: mut live } = watch;
    let task = tokio::spawn(async move {
        let mut last = 0u64;
        for ev in initial {
            last = ev.seq;
            if tx.send(ApiEvent { seq: ev.seq, kind: ev.kind, object: (*ev.object).clone() }).await.is_err() {
                return;
            }
        }
        loop {
            match live.recv().await {
                // the snapshot may already cover events racing the subscription
                Ok(ev) if ev.seq <= last => continue,
                Ok(ev) => {
                    last = ev.seq;
                    if tx.send(ApiEvent { seq: ev.seq, kind: ev.kind, object: (*ev.object).clone() }).await.is_err() {
                        return;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(watch = what, skipped = n, last_seq = last, "api: watcher lagged; closing stream");
                    counter!("porch_api_watch_lagged_total", 1u64, "watch" => what);
                    return;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
    StreamHandle { rx, cancel: CancelHandle { task: Some(task) } }
}

#[async_trait::async_trait]
impl PorchApi for InProcApi {
    async fn list_repositories(&self, namespace: Option<&str>) -> ApiResult<Vec<Repository>> {
        Ok(list_of(&self.porch.repositories, namespace))
    }

    async fn get_repository(&self, namespace: &str, name: &str) -> ApiResult<Repository> {
        get_of(&self.porch.repositories, namespace, name)
    }

    async fn apply_repository(&self, repo: Repository) -> ApiResult<Repository> {
        let t0 = Instant::now();
        let out = self.porch.put_repository(repo).await?;
        info!(repo = %ObjectKey::of(&*out), took_ms = %t0.elapsed().as_millis(), "api: repository applied");
        Ok((*out).clone())
    }

    async fn delete_repository(&self, namespace: &str, name: &str) -> ApiResult<()> {
        self.porch.remove_repository(&ObjectKey::new(namespace, name))?;
        info!(repo = %format!("{namespace}/{name}"), "api: repository deleted");
        Ok(())
    }

    async fn watch_repositories(&self, since: Option<u64>) -> ApiResult<StreamHandle<ApiEvent<Repository>>> {
        debug!(?since, "api: watch repositories");
        Ok(stream("repositories", self.porch.repositories.watch(since)?))
    }

    async fn list_revisions(&self, filter: RevisionFilter) -> ApiResult<Vec<PackageRevision>> {
        Ok(self.porch.revisions.list(&filter).iter().map(|pr| (**pr).clone()).collect())
    }

    async fn get_revision(&self, namespace: &str, name: &str) -> ApiResult<PackageRevision> {
        Ok((*self.revision(namespace, name)?).clone())
    }

    async fn create_revision(&self, pr: PackageRevision) -> ApiResult<PackageRevision> {
        let t0 = Instant::now();
        let mut pr = pr;
        if pr.metadata.namespace.as_deref().unwrap_or("").is_empty() {
            pr.metadata.namespace = Some("default".into());
        }
        let key = pr.key();
        if key.repository.is_empty() || key.package.is_empty() || key.workspace.is_empty() {
            return Err(ApiError::Validation("PackageRevision: spec.repository, spec.packageName and spec.workspaceName are required".into()));
        }
        let task = pr.spec.tasks.first().cloned().ok_or_else(|| ApiError::Validation("PackageRevision: spec.tasks[0] must be init or clone".into()))?;
        if self.porch.revisions.get(&key).is_some() {
            return Err(ApiError::AlreadyExists(format!("package revision {key}")));
        }
        let mut req = NewRevision::new(key.clone(), task);
        req.labels = pr.metadata.labels.take().unwrap_or_default();
        req.annotations = pr.metadata.annotations.take().unwrap_or_default();
        req.owner = pr.metadata.owner_references.take().and_then(|o| o.into_iter().next());
        let out = self.porch.revisions.create(req).await?;
        info!(revision = %key, took_ms = %t0.elapsed().as_millis(), "api: revision created");
        Ok((*out).clone())
    }

    async fn update_revision(&self, pr: PackageRevision) -> ApiResult<PackageRevision> {
        let t0 = Instant::now();
        let ns = pr.metadata.namespace.clone().unwrap_or_else(|| "default".into());
        let name = pr.metadata.name.clone().unwrap_or_default();
        let current = self.revision(&ns, &name)?;
        if pr.metadata.resource_version.is_some() && pr.resource_version() != current.resource_version() {
            return Err(ApiError::Conflict(format!(
                "package revision {ns}/{name} was modified (have version {}, stored {})",
                pr.resource_version(),
                current.resource_version()
            )));
        }
        let mut out = current;
        if pr.lifecycle() != out.lifecycle() {
            out = self.porch.revisions.set_lifecycle(&out, pr.lifecycle()).await?;
        }
        let mut next = (*out).clone();
        next.metadata.labels = pr.metadata.labels.clone();
        next.metadata.annotations = pr.metadata.annotations.clone();
        next.metadata.owner_references = pr.metadata.owner_references.clone();
        next.metadata.finalizers = pr.metadata.finalizers.clone();
        if next.metadata != out.metadata {
            out = self.porch.revisions.update_metadata(&next).await?;
        }
        info!(revision = %out.key(), lifecycle = %out.lifecycle(), took_ms = %t0.elapsed().as_millis(), "api: revision updated");
        Ok((*out).clone())
    }

    async fn delete_revision(&self, namespace: &str, name: &str) -> ApiResult<()> {
        let pr = self.revision(namespace, name)?;
        self.porch.revisions.delete(&pr).await?;
        info!(revision = %pr.key(), "api: revision deleted");
        Ok(())
    }

    async fn watch_revisions(&self, since: Option<u64>) -> ApiResult<StreamHandle<ApiEvent<PackageRevision>>> {
        debug!(?since, "api: watch revisions");
        Ok(stream("revisions", self.porch.revisions.watch(since)?))
    }

    async fn get_resources(&self, namespace: &str, name: &str) -> ApiResult<PackageRevisionResources> {
        let pr = self.revision(namespace, name)?;
        let resources = self.porch.revisions.resources(&pr.key()).await?;
        Ok(PackageRevisionResources::of(&pr, resources))
    }

    async fn update_resources(&self, res: PackageRevisionResources) -> ApiResult<PackageRevisionResources> {
        let t0 = Instant::now();
        let ns = res.metadata.namespace.clone().unwrap_or_else(|| "default".into());
        let name = res.metadata.name.clone().unwrap_or_default();
        let current = self.revision(&ns, &name)?;
        let mut pr = (*current).clone();
        if res.metadata.resource_version.is_some() {
            pr.metadata.resource_version = res.metadata.resource_version.clone();
        }
        let files = res.spec.resources.len();
        let out = self.porch.revisions.update_resources(&pr, res.spec.resources, None).await?;
        let stored = self.porch.revisions.resources(&out.key()).await?;
        info!(revision = %out.key(), files, took_ms = %t0.elapsed().as_millis(), "api: resources updated");
        Ok(PackageRevisionResources::of(&out, stored))
    }

    async fn list_variants(&self, namespace: Option<&str>) -> ApiResult<Vec<PackageVariant>> {
        Ok(list_of(&self.porch.variants, namespace))
    }

    async fn get_variant(&self, namespace: &str, name: &str) -> ApiResult<PackageVariant> {
        get_of(&self.porch.variants, namespace, name)
    }

    async fn create_variant(&self, pv: PackageVariant) -> ApiResult<PackageVariant> {
        let out = self.porch.variants.create(pv)?;
        info!(variant = %ObjectKey::of(&*out), "api: package variant created");
        Ok((*out).clone())
    }

    async fn update_variant(&self, pv: PackageVariant) -> ApiResult<PackageVariant> {
        let out = self.porch.variants.update(pv)?;
        debug!(variant = %ObjectKey::of(&*out), "api: package variant updated");
        Ok((*out).clone())
    }

    async fn delete_variant(&self, namespace: &str, name: &str) -> ApiResult<()> {
        self.porch.variants.delete(&ObjectKey::new(namespace, name))?;
        info!(variant = %format!("{namespace}/{name}"), "api: package variant deleted");
        Ok(())
    }

    async fn watch_variants(&self, since: Option<u64>) -> ApiResult<StreamHandle<ApiEvent<PackageVariant>>> {
        debug!(?since, "api: watch package variants");
        Ok(stream("packagevariants", self.porch.variants.watch(since)?))
    }

    async fn list_variant_sets(&self, namespace: Option<&str>) -> ApiResult<Vec<PackageVariantSet>> {
        Ok(list_of(&self.porch.sets, namespace))
    }

    async fn get_variant_set(&self, namespace: &str, name: &str) -> ApiResult<PackageVariantSet> {
        get_of(&self.porch.sets, namespace, name)
    }

    async fn create_variant_set(&self, pvs: PackageVariantSet) -> ApiResult<PackageVariantSet> {
        let out = self.porch.sets.create(pvs)?;
        info!(set = %ObjectKey::of(&*out), "api: package variant set created");
        Ok((*out).clone())
    }

    async fn update_variant_set(&self, pvs: PackageVariantSet) -> ApiResult<PackageVariantSet> {
        let out = self.porch.sets.update(pvs)?;
        debug!(set = %ObjectKey::of(&*out), "api: package variant set updated");
        Ok((*out).clone())
    }

    async fn delete_variant_set(&self, namespace: &str, name: &str) -> ApiResult<()> {
        self.porch.sets.delete(&ObjectKey::new(namespace, name))?;
        info!(set = %format!("{namespace}/{name}"), "api: package variant set deleted");
        Ok(())
    }

    async fn watch_variant_sets(&self, since: Option<u64>) -> ApiResult<StreamHandle<ApiEvent<PackageVariantSet>>> {
        debug!(?since, "api: watch package variant sets");
        Ok(stream("packagevariantsets", self.porch.sets.watch(since)?))
    }
}
