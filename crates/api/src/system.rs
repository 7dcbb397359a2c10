//! The assembled Porch system: stores, controllers and the triggers between them.

use std::sync::Arc;

use porch_controller::{spawn_forward, spawn_resync, Controller, ControllerConfig};
use porch_core::{ObjectKey, Object, PackageRevision, PackageVariant, PackageVariantSet, PorchError, PorchResult, Repository};
use porch_kubehub::{ClusterEvent, ClusterSource};
use porch_render::{NoopRenderer, Renderer};
use porch_repository::{MemoryOpener, RepositoryOpener, RepositoryRegistry};
use porch_store::{ObjectStore, PackageRevisionStore, WatchEvent, DEFAULT_HISTORY};
use porch_variant::VariantReconciler;
use porch_variantset::VariantSetReconciler;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Upper bound on [`Porch::settle`] rounds.
pub const MAX_SETTLE_ROUNDS: usize = 20;

pub struct Porch {
    pub repositories: Arc<ObjectStore<Repository>>,
    pub revisions: Arc<PackageRevisionStore>,
    pub variants: Arc<ObjectStore<PackageVariant>>,
    pub sets: Arc<ObjectStore<PackageVariantSet>>,
    pub cluster: Arc<dyn ClusterSource>,
    variant_ctl: Controller<VariantReconciler>,
    set_ctl: Controller<VariantSetReconciler>,
    cfg: ControllerConfig,
}

fn keys_of<T: Object>(store: &ObjectStore<T>) -> Vec<ObjectKey> {
    store.list(None).iter().map(|o| ObjectKey::of(&**o)).collect()
}

fn own_key<T: Object>(ev: &WatchEvent<T>) -> Vec<ObjectKey> {
    vec![ObjectKey::of(&*ev.object)]
}

impl Porch {
    pub fn new(opener: Arc<dyn RepositoryOpener>, renderer: Arc<dyn Renderer>, cluster: Arc<dyn ClusterSource>, cfg: ControllerConfig) -> Self {
        let registry = Arc::new(RepositoryRegistry::new(opener));
        let revisions = Arc::new(PackageRevisionStore::new(registry, renderer, DEFAULT_HISTORY));
        let repositories = Arc::new(ObjectStore::new(DEFAULT_HISTORY));
        let variants = Arc::new(ObjectStore::new(DEFAULT_HISTORY));
        let sets = Arc::new(ObjectStore::new(DEFAULT_HISTORY));
        let variant_ctl = Controller::new(
            Arc::new(VariantReconciler::new(Arc::clone(&variants), Arc::clone(&revisions), Arc::clone(&cluster))),
            &cfg,
        );
        let set_ctl = Controller::new(
            Arc::new(VariantSetReconciler::new(
                Arc::clone(&sets),
                Arc::clone(&variants),
                Arc::clone(&repositories),
                Arc::clone(&revisions),
                Arc::clone(&cluster),
            )),
            &cfg,
        );
        Self { repositories, revisions, variants, sets, cluster, variant_ctl, set_ctl, cfg }
    }

    /// In-memory repositories and the no-op renderer.
    pub fn in_memory(cluster: Arc<dyn ClusterSource>, cfg: ControllerConfig) -> Self {
        Self::new(Arc::new(MemoryOpener::new()), Arc::new(NoopRenderer), cluster, cfg)
    }

    /// Register (or re-open) a repository, store it and load its revisions.
    pub async fn put_repository(&self, mut repo: Repository) -> PorchResult<Arc<Repository>> {
        if repo.metadata.name.as_deref().unwrap_or("").is_empty() {
            return Err(PorchError::validation("Repository: metadata.name is required"));
        }
        if repo.metadata.namespace.as_deref().unwrap_or("").is_empty() {
            repo.metadata.namespace = Some("default".into());
        }
        let key = ObjectKey::of(&repo);
        self.revisions.registry().register(&repo)?;
        let stored = match self.repositories.get(&key) {
            None => self.repositories.create(repo)?,
            Some(existing) => {
                if repo.metadata.resource_version.is_none() {
                    repo.metadata.resource_version = existing.metadata.resource_version.clone();
                }
                self.repositories.update(repo)?
            }
        };
        let loaded = self.revisions.refresh(&key.namespace, &key.name).await?;
        debug!(repo = %key, revisions = loaded, "repository loaded");
        Ok(stored)
    }

    pub fn remove_repository(&self, key: &ObjectKey) -> PorchResult<Arc<Repository>> {
        let removed = self.repositories.delete(key)?;
        self.revisions.registry().unregister(key)?;
        self.revisions.forget_repository(&key.namespace, &key.name);
        Ok(removed)
    }

    pub fn config(&self) -> &ControllerConfig { &self.cfg }

    fn seqs(&self) -> (u64, u64, u64, u64) {
        (self.repositories.last_seq(), self.revisions.last_seq(), self.variants.last_seq(), self.sets.last_seq())
    }

    /// Reconcile every set, then every variant, until a round writes nothing.
    /// Returns the number of rounds run.
    pub async fn settle(&self) -> usize {
        for round in 1..=MAX_SETTLE_ROUNDS {
            let before = self.seqs();
            for key in keys_of(&self.sets) {
                self.set_ctl.process(&key).await;
            }
            for key in keys_of(&self.variants) {
                self.variant_ctl.process(&key).await;
            }
            if self.seqs() == before {
                debug!(rounds = round, "settled");
                return round;
            }
        }
        info!(rounds = MAX_SETTLE_ROUNDS, "settle stopped before reaching a fixed point");
        MAX_SETTLE_ROUNDS
    }

    /// Start workers, watch forwarders and the periodic resync. Everything
    /// stops when `cancel` fires.
    pub fn run(&self, cancel: CancellationToken) -> PorchResult<Vec<JoinHandle<()>>> {
        let vq = self.variant_ctl.queue();
        let sq = self.set_ctl.queue();
        let mut handles = Vec::new();

        handles.push(spawn_forward(self.variants.watch(None)?.rx, vq.clone(), own_key::<PackageVariant>, cancel.clone()));
        handles.push(spawn_forward(
            self.variants.watch(None)?.rx,
            sq.clone(),
            |ev: &WatchEvent<PackageVariant>| porch_variantset::triggers::for_variant(&ev.object),
            cancel.clone(),
        ));
        handles.push(spawn_forward(self.sets.watch(None)?.rx, sq.clone(), own_key::<PackageVariantSet>, cancel.clone()));

        let variants = Arc::clone(&self.variants);
        handles.push(spawn_forward(
            self.revisions.watch(None)?.rx,
            vq.clone(),
            move |ev: &WatchEvent<PackageRevision>| porch_variant::triggers::for_revision(&ev.object, &variants),
            cancel.clone(),
        ));
        let sets = Arc::clone(&self.sets);
        handles.push(spawn_forward(
            self.revisions.watch(None)?.rx,
            sq.clone(),
            move |ev: &WatchEvent<PackageRevision>| porch_variantset::triggers::for_revision(&ev.object, &sets),
            cancel.clone(),
        ));

        let variants = Arc::clone(&self.variants);
        handles.push(spawn_forward(
            self.repositories.watch(None)?.rx,
            vq.clone(),
            move |ev: &WatchEvent<Repository>| porch_variant::triggers::for_repository(&ev.object, &variants),
            cancel.clone(),
        ));
        let sets = Arc::clone(&self.sets);
        handles.push(spawn_forward(
            self.repositories.watch(None)?.rx,
            sq.clone(),
            move |ev: &WatchEvent<Repository>| porch_variantset::triggers::for_repository(&ev.object, &sets),
            cancel.clone(),
        ));

        let variants = Arc::clone(&self.variants);
        handles.push(spawn_forward(
            self.cluster.subscribe(),
            vq.clone(),
            move |ev: &ClusterEvent| porch_variant::triggers::for_cluster_event(ev, &variants),
            cancel.clone(),
        ));
        let sets = Arc::clone(&self.sets);
        handles.push(spawn_forward(
            self.cluster.subscribe(),
            sq.clone(),
            move |ev: &ClusterEvent| porch_variantset::triggers::for_cluster_event(ev, &sets),
            cancel.clone(),
        ));

        if let Some(period) = self.cfg.resync() {
            let variants = Arc::clone(&self.variants);
            handles.push(spawn_resync(vq.clone(), period, move || keys_of(&variants), cancel.clone()));
            let sets = Arc::clone(&self.sets);
            handles.push(spawn_resync(sq.clone(), period, move || keys_of(&sets), cancel.clone()));
        }

        for key in keys_of(&self.sets) {
            sq.add(key);
        }
        for key in keys_of(&self.variants) {
            vq.add(key);
        }
        handles.extend(self.set_ctl.spawn_workers(cancel.clone()));
        handles.extend(self.variant_ctl.spawn_workers(cancel));
        info!(
            repositories = self.repositories.len(),
            variants = self.variants.len(),
            sets = self.sets.len(),
            "porch controllers running"
        );
        Ok(handles)
    }
}
