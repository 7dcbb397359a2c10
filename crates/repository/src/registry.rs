//! Registered repositories and how their backends are opened.

use std::sync::{Arc, RwLock};

use porch_core::{ObjectKey, PorchError, PorchResult, Repository};
use rustc_hash::FxHashMap;
use tracing::info;

use crate::table::{MemoryTable, TableRepository};
use crate::PackageRepository;

/// Opens the backend for a Repository object.
pub trait RepositoryOpener: Send + Sync {
    fn open(&self, repo: &Repository) -> PorchResult<Arc<dyn PackageRepository>>;
}

/// Backs every repository with one shared in-memory table.
#[derive(Debug, Default, Clone)]
pub struct MemoryOpener {
    table: Arc<MemoryTable>,
}

impl MemoryOpener {
    pub fn new() -> Self { Self::default() }
    pub fn table(&self) -> Arc<MemoryTable> { Arc::clone(&self.table) }
}

impl RepositoryOpener for MemoryOpener {
    fn open(&self, repo: &Repository) -> PorchResult<Arc<dyn PackageRepository>> {
        let key = ObjectKey::of(repo);
        Ok(Arc::new(TableRepository::new(key.namespace, key.name, Arc::clone(&self.table))))
    }
}

struct Entry {
    spec: Arc<Repository>,
    backend: Arc<dyn PackageRepository>,
}

/// Repository objects by namespaced name, each with its opened backend.
pub struct RepositoryRegistry {
    opener: Arc<dyn RepositoryOpener>,
    repos: RwLock<FxHashMap<ObjectKey, Entry>>,
}

fn poisoned<T>(_: T) -> PorchError {
    PorchError::backend("repository registry lock poisoned")
}

impl RepositoryRegistry {
    pub fn new(opener: Arc<dyn RepositoryOpener>) -> Self {
        Self { opener, repos: RwLock::new(FxHashMap::default()) }
    }

    /// Open (or re-open after a spec change) the backend for `repo`.
    /// Returns true when the backend is new.
    pub fn register(&self, repo: &Repository) -> PorchResult<bool> {
        let key = ObjectKey::of(repo);
        {
            let repos = self.repos.read().map_err(poisoned)?;
            if let Some(e) = repos.get(&key) {
                if e.spec.spec == repo.spec {
                    return Ok(false);
                }
            }
        }
        let backend = self.opener.open(repo)?;
        self.repos.write().map_err(poisoned)?.insert(key.clone(), Entry { spec: Arc::new(repo.clone()), backend });
        info!(repo = %key, location = %repo.location(), deployment = repo.spec.deployment, "repository registered");
        Ok(true)
    }

    pub fn unregister(&self, key: &ObjectKey) -> PorchResult<bool> {
        let removed = self.repos.write().map_err(poisoned)?.remove(key).is_some();
        if removed {
            info!(repo = %key, "repository unregistered");
        }
        Ok(removed)
    }

    pub fn get(&self, namespace: &str, name: &str) -> PorchResult<Arc<dyn PackageRepository>> {
        let key = ObjectKey::new(namespace, name);
        self.repos
            .read()
            .map_err(poisoned)?
            .get(&key)
            .map(|e| Arc::clone(&e.backend))
            .ok_or_else(|| PorchError::not_found(format!("repository {key}")))
    }

    pub fn repository(&self, namespace: &str, name: &str) -> PorchResult<Option<Arc<Repository>>> {
        Ok(self.repos.read().map_err(poisoned)?.get(&ObjectKey::new(namespace, name)).map(|e| Arc::clone(&e.spec)))
    }

    pub fn backends(&self, namespace: Option<&str>) -> PorchResult<Vec<Arc<dyn PackageRepository>>> {
        let repos = self.repos.read().map_err(poisoned)?;
        let mut out: Vec<(ObjectKey, Arc<dyn PackageRepository>)> = repos
            .iter()
            .filter(|(k, _)| namespace.map(|ns| k.namespace == ns).unwrap_or(true))
            .map(|(k, e)| (k.clone(), Arc::clone(&e.backend)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out.into_iter().map(|(_, b)| b).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo(name: &str, deployment: bool) -> Repository {
        serde_json::from_value(serde_json::json!({
            "metadata": {"name": name, "namespace": "default"},
            "spec": {"type": "git", "git": {"repo": "https://example.com/r.git"}, "deployment": deployment}
        }))
        .unwrap()
    }

    #[test]
    fn register_is_idempotent_until_spec_changes() {
        let reg = RepositoryRegistry::new(Arc::new(MemoryOpener::new()));
        assert!(reg.register(&repo("blueprints", false)).unwrap());
        assert!(!reg.register(&repo("blueprints", false)).unwrap());
        assert!(reg.register(&repo("blueprints", true)).unwrap());
        assert_eq!(reg.get("default", "blueprints").unwrap().name(), "blueprints");
        assert!(reg.repository("default", "blueprints").unwrap().unwrap().spec.deployment);
        assert!(matches!(reg.get("default", "nope"), Err(PorchError::NotFound(_))));
        assert!(reg.unregister(&ObjectKey::new("default", "blueprints")).unwrap());
        assert!(reg.backends(Some("default")).unwrap().is_empty());
    }
}
