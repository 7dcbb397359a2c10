//! Package revision catalogue.
//!
//! A read cache over every registered repository plus the write paths that
//! reconcilers and the API use. Writes go to the owning repository first and
//! are then folded into the cache; cached entries only move forward in
//! resource version.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use porch_core::revision::PackageRevisionSpec;
use porch_core::{add_owner, Lifecycle, PackageRevision, PackageRevisionKey, PorchError, PorchResult, ResourceMap, RevisionFilter, Task, UpstreamRef};
use porch_render::Renderer;
use porch_repository::clone::{clone_resources, init_resources};
use porch_repository::merge::three_way;
use porch_repository::{PackageRepository, RepositoryRegistry};
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use crate::events::{EventKind, EventLog, Watch, WatchEvent};

type Cache = FxHashMap<PackageRevisionKey, Arc<PackageRevision>>;

/// Request to create a new draft with an `init` or `clone` task.
#[derive(Debug, Clone)]
pub struct NewRevision {
    pub key: PackageRevisionKey,
    pub task: Task,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub owner: Option<OwnerReference>,
}

impl NewRevision {
    pub fn new(key: PackageRevisionKey, task: Task) -> Self {
        Self { key, task, labels: BTreeMap::new(), annotations: BTreeMap::new(), owner: None }
    }
}

pub struct PackageRevisionStore {
    registry: Arc<RepositoryRegistry>,
    renderer: Arc<dyn Renderer>,
    cache: ArcSwap<Cache>,
    log: EventLog<PackageRevision>,
}

fn non_empty(m: BTreeMap<String, String>) -> Option<BTreeMap<String, String>> {
    if m.is_empty() { None } else { Some(m) }
}

impl PackageRevisionStore {
    pub fn new(registry: Arc<RepositoryRegistry>, renderer: Arc<dyn Renderer>, history: usize) -> Self {
        Self { registry, renderer, cache: ArcSwap::from_pointee(FxHashMap::default()), log: EventLog::new(history) }
    }

    pub fn registry(&self) -> &Arc<RepositoryRegistry> { &self.registry }

    // ---- cache maintenance ----

    fn apply(&self, pr: PackageRevision) -> Arc<PackageRevision> { self.fold(pr).0 }

    /// Returns the cached entry and whether it changed.
    fn fold(&self, pr: PackageRevision) -> (Arc<PackageRevision>, bool) {
        let key = pr.key();
        let pr = Arc::new(pr);
        let mut kind = None;
        let mut current = Arc::clone(&pr);
        self.cache.rcu(|cur| {
            match cur.get(&key) {
                Some(old) if old.resource_version() >= pr.resource_version() => {
                    kind = None;
                    current = Arc::clone(old);
                    Arc::clone(cur)
                }
                old => {
                    kind = Some(if old.is_some() { EventKind::Modified } else { EventKind::Added });
                    current = Arc::clone(&pr);
                    let mut next = (**cur).clone();
                    next.insert(key.clone(), Arc::clone(&pr));
                    Arc::new(next)
                }
            }
        });
        let changed = kind.is_some();
        if let Some(kind) = kind {
            self.log.emit(kind, Arc::clone(&current));
        }
        (current, changed)
    }

    fn evict(&self, key: &PackageRevisionKey) {
        let mut removed = None;
        self.cache.rcu(|cur| {
            removed = cur.get(key).cloned();
            if removed.is_none() {
                return Arc::clone(cur);
            }
            let mut next = (**cur).clone();
            next.remove(key);
            Arc::new(next)
        });
        if let Some(pr) = removed {
            self.log.emit(EventKind::Deleted, pr);
        }
    }

    /// Re-read one repository's revisions into the cache. Returns the number of changes.
    pub async fn refresh(&self, namespace: &str, repository: &str) -> PorchResult<usize> {
        let backend = self.registry.get(namespace, repository)?;
        let listed = backend.list_revisions(&RevisionFilter::default()).await?;
        let mut changes = 0;
        let mut seen = rustc_hash::FxHashSet::default();
        for pr in listed {
            seen.insert(pr.key());
            if self.fold(pr).1 {
                changes += 1;
            }
        }
        let stale: Vec<PackageRevisionKey> = self
            .cache
            .load()
            .keys()
            .filter(|k| k.namespace == namespace && k.repository == repository && !seen.contains(*k))
            .cloned()
            .collect();
        for k in &stale {
            self.evict(k);
        }
        changes += stale.len();
        debug!(repo = %format!("{namespace}/{repository}"), changes, "revision cache refreshed");
        Ok(changes)
    }

    pub async fn refresh_all(&self) -> PorchResult<()> {
        for backend in self.registry.backends(None)? {
            self.refresh(backend.namespace(), backend.name()).await?;
        }
        Ok(())
    }

    /// Drop cached revisions of an unregistered repository.
    pub fn forget_repository(&self, namespace: &str, repository: &str) {
        let keys: Vec<PackageRevisionKey> =
            self.cache.load().keys().filter(|k| k.namespace == namespace && k.repository == repository).cloned().collect();
        for k in &keys {
            self.evict(k);
        }
        if !keys.is_empty() {
            info!(repo = %format!("{namespace}/{repository}"), revisions = keys.len(), "revisions forgotten");
        }
    }

    // ---- reads ----

    pub fn list(&self, filter: &RevisionFilter) -> Vec<Arc<PackageRevision>> {
        let snap = self.cache.load();
        let mut out: Vec<Arc<PackageRevision>> = snap.values().filter(|pr| filter.matches(pr)).cloned().collect();
        out.sort_by_key(|pr| pr.key());
        out
    }

    pub fn get(&self, key: &PackageRevisionKey) -> Option<Arc<PackageRevision>> { self.cache.load().get(key).cloned() }

    /// Look a revision up by object name within a namespace.
    pub fn get_by_name(&self, namespace: &str, name: &str) -> Option<Arc<PackageRevision>> {
        self.cache.load().values().find(|pr| pr.metadata.namespace.as_deref() == Some(namespace) && pr.metadata.name.as_deref() == Some(name)).cloned()
    }

    /// The published (or deletion-proposed) revision `revision` of a package.
    pub fn find_published(&self, namespace: &str, repository: &str, package: &str, revision: &str) -> Option<Arc<PackageRevision>> {
        self.cache
            .load()
            .values()
            .find(|pr| {
                let k = pr.key();
                k.namespace == namespace && k.same_package(repository, package) && pr.lifecycle().is_published() && pr.spec.revision == revision
            })
            .cloned()
    }

    pub async fn resources(&self, key: &PackageRevisionKey) -> PorchResult<ResourceMap> {
        self.registry.get(&key.namespace, &key.repository)?.get_resources(key).await
    }

    fn backend(&self, key: &PackageRevisionKey) -> PorchResult<Arc<dyn PackageRepository>> {
        self.registry.get(&key.namespace, &key.repository)
    }

    async fn upstream_resources(&self, namespace: &str, up: &UpstreamRef) -> PorchResult<Option<ResourceMap>> {
        match self.find_published(namespace, &up.repository, &up.package, &up.revision) {
            Some(pr) => Ok(Some(self.resources(&pr.key()).await?)),
            None => Ok(None),
        }
    }

    /// Refresh the repository after a version conflict so the next attempt reads fresh state.
    async fn settle<T>(&self, key: &PackageRevisionKey, res: PorchResult<T>) -> PorchResult<T> {
        if let Err(PorchError::Conflict(_)) = &res {
            if let Err(e) = self.refresh(&key.namespace, &key.repository).await {
                warn!(revision = %key, error = %e, "refresh after conflict failed");
            }
        }
        res
    }

    // ---- writes ----

    /// Create a draft from an `init` or `clone` task; the result is rendered before it is stored.
    pub async fn create(&self, req: NewRevision) -> PorchResult<Arc<PackageRevision>> {
        let key = &req.key;
        let backend = self.backend(key)?;
        let resources = match &req.task {
            Task::Init { description } => init_resources(&key.package, description),
            Task::Clone { upstream } => {
                let src = self
                    .upstream_resources(&key.namespace, upstream)
                    .await?
                    .ok_or_else(|| PorchError::not_found(format!("upstream package revision {upstream}")))?;
                let deployment = self.registry.repository(&key.namespace, &key.repository)?.map(|r| r.spec.deployment).unwrap_or(false);
                clone_resources(&src, &key.package, deployment)?
            }
            other => return Err(PorchError::validation(format!("cannot create a package revision with a {} task", other.type_name()))),
        };
        let rendered = self.renderer.render(resources).await?;
        let mut draft = PackageRevision::draft(key, req.task.clone())?;
        draft.metadata.labels = non_empty(req.labels);
        draft.metadata.annotations = non_empty(req.annotations);
        if let Some(owner) = req.owner {
            add_owner(&mut draft.metadata, owner);
        }
        let out = backend.create_draft(draft, rendered).await?;
        Ok(self.apply(out))
    }

    /// Copy-on-write: a new draft in `workspace` with the source's resources and task history.
    pub async fn copy(&self, source: &PackageRevision, workspace: &str, owner: Option<OwnerReference>) -> PorchResult<Arc<PackageRevision>> {
        let src_key = source.key();
        let key = PackageRevisionKey::new(&src_key.namespace, &src_key.repository, &src_key.package, workspace);
        let resources = self.resources(&src_key).await?;
        let mut metadata = ObjectMeta {
            name: Some(key.object_name()),
            namespace: Some(key.namespace.clone()),
            labels: source.metadata.labels.clone(),
            annotations: source.metadata.annotations.clone(),
            ..Default::default()
        };
        if let Some(owner) = owner {
            add_owner(&mut metadata, owner);
        }
        let draft = PackageRevision {
            metadata,
            spec: PackageRevisionSpec {
                repository: key.repository.clone(),
                package_name: key.package.clone(),
                workspace_name: key.workspace.clone(),
                revision: String::new(),
                lifecycle: Lifecycle::Draft,
                tasks: source.spec.tasks.clone(),
                readiness_gates: Vec::new(),
            },
            status: porch_core::revision::PackageRevisionStatus { upstream_lock: source.status.upstream_lock.clone(), ..Default::default() },
        };
        let out = self.backend(&key)?.create_draft(draft, resources).await?;
        info!(source = %src_key, revision = %key, "copied package revision");
        Ok(self.apply(out))
    }

    /// Replace a draft's resources; they are rendered before they are stored.
    pub async fn update_resources(&self, pr: &PackageRevision, resources: ResourceMap, task: Option<Task>) -> PorchResult<Arc<PackageRevision>> {
        let key = pr.key();
        let lifecycle = self.get(&key).map(|c| c.lifecycle()).unwrap_or(pr.lifecycle());
        if !lifecycle.is_draft_like() {
            return Err(PorchError::Immutable(format!("package revision {key} is {lifecycle}")));
        }
        let rendered = self.renderer.render(resources).await?;
        let res = self.backend(&key)?.update_draft(pr, rendered, task).await;
        let out = self.settle(&key, res).await?;
        Ok(self.apply(out))
    }

    /// Move a draft onto a new upstream revision with a three-way merge of the
    /// old upstream, the new upstream and the draft's local resources.
    pub async fn update_upstream(&self, pr: &PackageRevision, upstream: UpstreamRef) -> PorchResult<Arc<PackageRevision>> {
        let key = pr.key();
        let ns = key.namespace.as_str();
        let target = self
            .upstream_resources(ns, &upstream)
            .await?
            .ok_or_else(|| PorchError::not_found(format!("upstream package revision {upstream}")))?;
        let base = match pr.upstream() {
            Some(old) => self.upstream_resources(ns, old).await?.unwrap_or_else(|| {
                warn!(revision = %key, old = %old, "old upstream revision is gone; merging against an empty base");
                ResourceMap::new()
            }),
            None => ResourceMap::new(),
        };
        let local = self.resources(&key).await?;
        let merged = three_way(&base, &target, &local)?;
        info!(revision = %key, upstream = %upstream, "updating draft to new upstream");
        self.update_resources(pr, merged, Some(Task::Update { upstream })).await
    }

    /// Write labels, annotations, owner references and finalizers.
    pub async fn update_metadata(&self, pr: &PackageRevision) -> PorchResult<Arc<PackageRevision>> {
        let key = pr.key();
        let res = self.backend(&key)?.update_metadata(pr).await;
        let out = self.settle(&key, res).await?;
        Ok(self.apply(out))
    }

    pub async fn set_lifecycle(&self, pr: &PackageRevision, lifecycle: Lifecycle) -> PorchResult<Arc<PackageRevision>> {
        let key = pr.key();
        let res = self.backend(&key)?.set_lifecycle(pr, lifecycle).await;
        let out = self.settle(&key, res).await?;
        Ok(self.apply(out))
    }

    pub async fn delete(&self, pr: &PackageRevision) -> PorchResult<()> {
        let key = pr.key();
        let res = self.backend(&key)?.delete(pr).await;
        match self.settle(&key, res).await {
            Ok(()) | Err(PorchError::NotFound(_)) => {
                self.evict(&key);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Without `since`, the initial events are the cached revisions as `Added`.
    pub fn watch(&self, since: Option<u64>) -> PorchResult<Watch<PackageRevision>> {
        let (replay, rx) = self.log.subscribe(since)?;
        let initial = match since {
            Some(_) => replay,
            None => {
                let seq = self.log.last_seq();
                self.list(&RevisionFilter::default()).into_iter().map(|object| WatchEvent { seq, kind: EventKind::Added, object }).collect()
            }
        };
        Ok(Watch { initial, rx })
    }

    pub fn last_seq(&self) -> u64 { self.log.last_seq() }
}
