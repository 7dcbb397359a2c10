//! Revision tables and the table-backed [`PackageRepository`].
//!
//! A table is a dumb keyed record store with compare-and-set on the
//! resource version. [`TableRepository`] layers the revision rules on top:
//! immutability of published revisions, the lifecycle graph, readiness gates
//! and publish numbering.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use metrics::counter;
use porch_core::revision::next_revision;
use porch_core::{now, Lifecycle, PackageRevision, PackageRevisionKey, PorchError, PorchResult, ResourceMap, RevisionFilter, Task};
use porch_render::kptfile::gates_and_conditions;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::PackageRepository;

/// A revision together with its file tree.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRevision {
    pub revision: PackageRevision,
    pub resources: ResourceMap,
}

impl StoredRevision {
    pub fn key(&self) -> PackageRevisionKey { self.revision.key() }
    pub fn resource_version(&self) -> u64 { self.revision.resource_version() }
}

/// Keyed storage for revisions. Writes are compare-and-set on the stored resource version.
pub trait RevisionTable: Send + Sync {
    /// `AlreadyExists` when the key is taken.
    fn insert(&self, rec: &StoredRevision) -> PorchResult<()>;
    /// `Conflict` unless the stored resource version equals `expected`.
    fn replace(&self, rec: &StoredRevision, expected: u64) -> PorchResult<()>;
    fn remove(&self, key: &PackageRevisionKey, expected: u64) -> PorchResult<()>;
    fn load(&self, key: &PackageRevisionKey) -> PorchResult<Option<StoredRevision>>;
    fn list(&self, namespace: &str, repository: &str) -> PorchResult<Vec<PackageRevision>>;
}

impl<T: RevisionTable + ?Sized> RevisionTable for Arc<T> {
    fn insert(&self, rec: &StoredRevision) -> PorchResult<()> { (**self).insert(rec) }
    fn replace(&self, rec: &StoredRevision, expected: u64) -> PorchResult<()> { (**self).replace(rec, expected) }
    fn remove(&self, key: &PackageRevisionKey, expected: u64) -> PorchResult<()> { (**self).remove(key, expected) }
    fn load(&self, key: &PackageRevisionKey) -> PorchResult<Option<StoredRevision>> { (**self).load(key) }
    fn list(&self, namespace: &str, repository: &str) -> PorchResult<Vec<PackageRevision>> { (**self).list(namespace, repository) }
}

/// In-memory table; one instance may back many repositories.
#[derive(Debug, Default)]
pub struct MemoryTable {
    rows: RwLock<BTreeMap<PackageRevisionKey, StoredRevision>>,
}

impl MemoryTable {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.rows.read().map(|r| r.len()).unwrap_or(0) }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

fn poisoned<T>(_: T) -> PorchError {
    PorchError::backend("revision table lock poisoned")
}

impl RevisionTable for MemoryTable {
    fn insert(&self, rec: &StoredRevision) -> PorchResult<()> {
        let mut rows = self.rows.write().map_err(poisoned)?;
        let key = rec.key();
        if rows.contains_key(&key) {
            return Err(PorchError::AlreadyExists(format!("package revision {key}")));
        }
        rows.insert(key, rec.clone());
        Ok(())
    }

    fn replace(&self, rec: &StoredRevision, expected: u64) -> PorchResult<()> {
        let mut rows = self.rows.write().map_err(poisoned)?;
        let key = rec.key();
        let slot = rows.get_mut(&key).ok_or_else(|| PorchError::not_found(format!("package revision {key}")))?;
        if slot.resource_version() != expected {
            return Err(PorchError::conflict(format!("package revision {key}: stored version {} != {expected}", slot.resource_version())));
        }
        *slot = rec.clone();
        Ok(())
    }

    fn remove(&self, key: &PackageRevisionKey, expected: u64) -> PorchResult<()> {
        let mut rows = self.rows.write().map_err(poisoned)?;
        match rows.get(key) {
            None => Err(PorchError::not_found(format!("package revision {key}"))),
            Some(r) if r.resource_version() != expected => {
                Err(PorchError::conflict(format!("package revision {key}: stored version {} != {expected}", r.resource_version())))
            }
            Some(_) => {
                rows.remove(key);
                Ok(())
            }
        }
    }

    fn load(&self, key: &PackageRevisionKey) -> PorchResult<Option<StoredRevision>> {
        Ok(self.rows.read().map_err(poisoned)?.get(key).cloned())
    }

    fn list(&self, namespace: &str, repository: &str) -> PorchResult<Vec<PackageRevision>> {
        let rows = self.rows.read().map_err(poisoned)?;
        Ok(rows
            .iter()
            .filter(|(k, _)| k.namespace == namespace && k.repository == repository)
            .map(|(_, r)| r.revision.clone())
            .collect())
    }
}

/// Repository over a [`RevisionTable`], scoped to one Repository object.
pub struct TableRepository<T> {
    namespace: String,
    name: String,
    table: T,
    /// Serializes revision number assignment within this repository.
    publish: Mutex<()>,
}

impl<T: RevisionTable> TableRepository<T> {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, table: T) -> Self {
        Self { namespace: namespace.into(), name: name.into(), table, publish: Mutex::new(()) }
    }

    fn check_scope(&self, key: &PackageRevisionKey) -> PorchResult<()> {
        if key.namespace != self.namespace || key.repository != self.name {
            return Err(PorchError::validation(format!("package revision {key} does not belong to repository {}/{}", self.namespace, self.name)));
        }
        Ok(())
    }

    fn load_current(&self, pr: &PackageRevision) -> PorchResult<StoredRevision> {
        let key = pr.key();
        self.check_scope(&key)?;
        let cur = self.table.load(&key)?.ok_or_else(|| PorchError::not_found(format!("package revision {key}")))?;
        if pr.metadata.resource_version.is_some() && cur.resource_version() != pr.resource_version() {
            return Err(PorchError::conflict(format!(
                "package revision {key} was modified (have version {}, stored {})",
                pr.resource_version(),
                cur.resource_version()
            )));
        }
        Ok(cur)
    }

    fn write(&self, mut next: StoredRevision, expected: u64, op: &'static str) -> PorchResult<PackageRevision> {
        next.revision.metadata.resource_version = Some((expected + 1).to_string());
        self.table.replace(&next, expected)?;
        counter!("porch_revision_writes_total", 1u64, "op" => op);
        Ok(next.revision)
    }
}

/// Copy readiness gates and conditions declared in the Kptfile onto the revision.
pub fn project_kptfile(pr: &mut PackageRevision, resources: &ResourceMap) -> PorchResult<()> {
    let (gates, conditions) = gates_and_conditions(resources)?;
    pr.spec.readiness_gates = gates;
    pr.status.conditions = conditions;
    Ok(())
}

#[async_trait]
impl<T: RevisionTable> PackageRepository for TableRepository<T> {
    fn namespace(&self) -> &str { &self.namespace }
    fn name(&self) -> &str { &self.name }

    async fn list_revisions(&self, filter: &RevisionFilter) -> PorchResult<Vec<PackageRevision>> {
        let mut out: Vec<PackageRevision> = self.table.list(&self.namespace, &self.name)?.into_iter().filter(|pr| filter.matches(pr)).collect();
        out.sort_by_key(PackageRevision::key);
        Ok(out)
    }

    async fn get_resources(&self, key: &PackageRevisionKey) -> PorchResult<ResourceMap> {
        self.check_scope(key)?;
        let rec = self.table.load(key)?.ok_or_else(|| PorchError::not_found(format!("package revision {key}")))?;
        Ok(rec.resources)
    }

    async fn create_draft(&self, mut draft: PackageRevision, resources: ResourceMap) -> PorchResult<PackageRevision> {
        let key = draft.key();
        self.check_scope(&key)?;
        if key.package.is_empty() || key.workspace.is_empty() {
            return Err(PorchError::validation(format!("package revision {key}: package and workspace names are required")));
        }
        match draft.spec.tasks.first() {
            Some(t) if t.is_creation() => {}
            _ => return Err(PorchError::validation(format!("package revision {key}: first task must be init or clone"))),
        }
        draft.spec.lifecycle = Lifecycle::Draft;
        draft.spec.revision.clear();
        draft.status.published_at = None;
        draft.metadata.name = Some(key.object_name());
        draft.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        draft.metadata.creation_timestamp = Some(now());
        draft.metadata.resource_version = Some("1".to_string());
        draft.metadata.generation = Some(1);
        project_kptfile(&mut draft, &resources)?;
        self.table.insert(&StoredRevision { revision: draft.clone(), resources })?;
        counter!("porch_revision_writes_total", 1u64, "op" => "create");
        info!(revision = %key, task = draft.spec.tasks[0].type_name(), "draft created");
        Ok(draft)
    }

    async fn update_draft(&self, pr: &PackageRevision, resources: ResourceMap, task: Option<Task>) -> PorchResult<PackageRevision> {
        let cur = self.load_current(pr)?;
        let lifecycle = cur.revision.lifecycle();
        if !lifecycle.is_draft_like() {
            return Err(PorchError::Immutable(format!("package revision {} is {lifecycle}", pr.key())));
        }
        let expected = cur.resource_version();
        let mut next = StoredRevision { revision: cur.revision, resources };
        next.revision.metadata.labels = pr.metadata.labels.clone();
        next.revision.metadata.annotations = pr.metadata.annotations.clone();
        next.revision.metadata.owner_references = pr.metadata.owner_references.clone();
        if let Some(task) = task {
            if let Some(up) = task.upstream() {
                next.revision.status.upstream_lock = Some(up.clone());
            }
            next.revision.spec.tasks.push(task);
        }
        next.revision.metadata.generation = Some(next.revision.metadata.generation.unwrap_or(1) + 1);
        project_kptfile(&mut next.revision, &next.resources)?;
        let out = self.write(next, expected, "update")?;
        debug!(revision = %out.key(), tasks = out.spec.tasks.len(), "draft updated");
        Ok(out)
    }

    async fn update_metadata(&self, pr: &PackageRevision) -> PorchResult<PackageRevision> {
        let cur = self.load_current(pr)?;
        let expected = cur.resource_version();
        let mut next = cur;
        next.revision.metadata.labels = pr.metadata.labels.clone();
        next.revision.metadata.annotations = pr.metadata.annotations.clone();
        next.revision.metadata.owner_references = pr.metadata.owner_references.clone();
        next.revision.metadata.finalizers = pr.metadata.finalizers.clone();
        self.write(next, expected, "metadata")
    }

    async fn set_lifecycle(&self, pr: &PackageRevision, lifecycle: Lifecycle) -> PorchResult<PackageRevision> {
        let cur = self.load_current(pr)?;
        let from = cur.revision.lifecycle();
        if from == lifecycle {
            return Ok(cur.revision);
        }
        let key = pr.key();
        if !from.can_transition_to(lifecycle) {
            return Err(PorchError::validation(format!("package revision {key}: cannot move from {from} to {lifecycle}")));
        }
        let expected = cur.resource_version();
        let mut next = cur;
        let _guard;
        if lifecycle == Lifecycle::Published && from == Lifecycle::Proposed {
            let unsatisfied = next.revision.unsatisfied_gates();
            if !unsatisfied.is_empty() {
                return Err(PorchError::validation(format!("package revision {key}: readiness gates not satisfied: {}", unsatisfied.join(", "))));
            }
            _guard = self.publish.lock().await;
            let siblings = self.table.list(&self.namespace, &self.name)?;
            let taken = siblings.iter().filter(|s| s.spec.package_name == key.package).map(|s| s.spec.revision.as_str());
            next.revision.spec.revision = next_revision(taken);
            next.revision.status.published_at = Some(now().0);
        }
        next.revision.spec.lifecycle = lifecycle;
        let out = self.write(next, expected, "lifecycle")?;
        info!(revision = %key, from = %from, to = %lifecycle, rev = %out.spec.revision, "lifecycle changed");
        Ok(out)
    }

    async fn delete(&self, pr: &PackageRevision) -> PorchResult<()> {
        let cur = self.load_current(pr)?;
        let key = pr.key();
        if !cur.revision.lifecycle().can_delete() {
            return Err(PorchError::Immutable(format!("package revision {key} is Published; propose deletion first")));
        }
        self.table.remove(&key, cur.resource_version())?;
        counter!("porch_revision_writes_total", 1u64, "op" => "delete");
        info!(revision = %key, "package revision deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use porch_core::{Condition, ConditionStatus};
    use porch_render::kptfile::{new_kptfile, KPTFILE};

    fn repo() -> TableRepository<MemoryTable> {
        TableRepository::new("default", "deployments", MemoryTable::new())
    }

    fn draft(ws: &str) -> PackageRevision {
        PackageRevision::draft(&PackageRevisionKey::new("default", "deployments", "foo", ws), Task::Init { description: String::new() }).unwrap()
    }

    fn files() -> ResourceMap {
        let mut m = ResourceMap::new();
        m.insert(KPTFILE.into(), new_kptfile("foo", ""));
        m
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn create_is_unique_per_key() {
        let r = repo();
        let pr = r.create_draft(draft("ws"), files()).await.unwrap();
        assert_eq!(pr.resource_version(), 1);
        assert!(pr.metadata.uid.is_some());
        assert!(matches!(r.create_draft(draft("ws"), files()).await, Err(PorchError::AlreadyExists(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stale_writes_conflict() {
        let r = repo();
        let pr = r.create_draft(draft("ws"), files()).await.unwrap();
        let pr2 = r.update_draft(&pr, files(), None).await.unwrap();
        assert_eq!(pr2.resource_version(), 2);
        assert!(matches!(r.update_draft(&pr, files(), None).await, Err(PorchError::Conflict(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn publish_numbers_and_freezes() {
        let r = repo();
        let a = r.create_draft(draft("a"), files()).await.unwrap();
        assert!(r.set_lifecycle(&a, Lifecycle::Published).await.is_err());
        let a = r.set_lifecycle(&a, Lifecycle::Proposed).await.unwrap();
        let a = r.set_lifecycle(&a, Lifecycle::Published).await.unwrap();
        assert_eq!(a.spec.revision, "v1");
        assert!(a.status.published_at.is_some());
        assert!(matches!(r.update_draft(&a, files(), None).await, Err(PorchError::Immutable(_))));
        assert!(matches!(r.delete(&a).await, Err(PorchError::Immutable(_))));

        let b = r.create_draft(draft("b"), files()).await.unwrap();
        let b = r.set_lifecycle(&b, Lifecycle::Proposed).await.unwrap();
        let b = r.set_lifecycle(&b, Lifecycle::Published).await.unwrap();
        assert_eq!(b.spec.revision, "v2");

        let a = r.set_lifecycle(&a, Lifecycle::DeletionProposed).await.unwrap();
        let a = r.set_lifecycle(&a, Lifecycle::Published).await.unwrap();
        assert_eq!(a.spec.revision, "v1");
        let a = r.set_lifecycle(&a, Lifecycle::DeletionProposed).await.unwrap();
        r.delete(&a).await.unwrap();
        assert_eq!(r.list_revisions(&RevisionFilter::default()).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn readiness_gates_block_publish() {
        let r = repo();
        let mut res = porch_render::PackageResources::parse(&files()).unwrap();
        {
            let mut k = porch_render::KptfileMut::new(res.kptfile_mut().unwrap());
            k.add_readiness_gate("config.injection.ConfigMap.foo-cfg");
            k.set_condition(Condition::new("config.injection.ConfigMap.foo-cfg", ConditionStatus::False, "NoResourceSelected", "")).unwrap();
        }
        let pr = r.create_draft(draft("ws"), res.to_map().unwrap()).await.unwrap();
        assert_eq!(pr.spec.readiness_gates, vec!["config.injection.ConfigMap.foo-cfg"]);
        let pr = r.set_lifecycle(&pr, Lifecycle::Proposed).await.unwrap();
        let err = r.set_lifecycle(&pr, Lifecycle::Published).await.unwrap_err();
        assert!(err.to_string().contains("readiness gates"));
        let pr = r.set_lifecycle(&pr, Lifecycle::Draft).await.unwrap();
        assert_eq!(pr.lifecycle(), Lifecycle::Draft);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn update_task_moves_upstream_lock() {
        let r = repo();
        let pr = r.create_draft(draft("ws"), files()).await.unwrap();
        let up = porch_core::UpstreamRef { repository: "blueprints".into(), package: "foo".into(), revision: "v2".into() };
        let pr = r.update_draft(&pr, files(), Some(Task::Update { upstream: up.clone() })).await.unwrap();
        assert_eq!(pr.status.upstream_lock, Some(up));
        assert_eq!(pr.spec.tasks.len(), 2);
        assert!(pr.spec.tasks[0].is_creation());
    }
}
