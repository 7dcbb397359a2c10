//! Porch kubehub: read access to in-cluster objects for config injection.
//!
//! [`ClusterSource`] lists objects of one kind in one namespace and
//! publishes a [`ClusterEvent`] whenever a listed kind changes, so variants
//! that injected from it can be reconciled again.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client, ResourceExt,
};
use metrics::counter;
use porch_core::{PorchError, PorchResult};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A change to an in-cluster object of a kind that was listed before.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEvent {
    pub gvk: GroupVersionKind,
    pub namespace: String,
    pub name: String,
    pub deleted: bool,
}

#[async_trait]
pub trait ClusterSource: Send + Sync {
    /// Objects of `gvk` in `namespace`. A kind the cluster does not serve lists as empty.
    async fn list(&self, gvk: &GroupVersionKind, namespace: &str) -> PorchResult<Vec<DynamicObject>>;

    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent>;
}

/// `v1/Kind` or `group/version/Kind`.
pub fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind::gvk("", version, kind)),
        [group, version, kind] => Ok(GroupVersionKind::gvk(group, version, kind)),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

fn gvk_of(obj: &DynamicObject) -> Option<GroupVersionKind> {
    let types = obj.types.as_ref()?;
    let (group, version) = match types.api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", types.api_version.as_str()),
    };
    Some(GroupVersionKind::gvk(group, version, &types.kind))
}

// ---- in-memory source ----

type ObjKey = (String, String, String);

/// Cluster stand-in for tests and for running without a cluster.
pub struct MemoryClusterSource {
    objects: RwLock<BTreeMap<ObjKey, DynamicObject>>,
    tx: broadcast::Sender<ClusterEvent>,
}

impl Default for MemoryClusterSource {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { objects: RwLock::new(BTreeMap::new()), tx }
    }
}

fn poisoned<T>(_: T) -> PorchError {
    PorchError::backend("cluster object lock poisoned")
}

impl MemoryClusterSource {
    pub fn new() -> Self { Self::default() }

    /// Create or replace an object given as a full manifest.
    pub fn apply(&self, manifest: serde_json::Value) -> PorchResult<()> {
        let obj: DynamicObject = serde_json::from_value(manifest)?;
        let gvk = gvk_of(&obj).ok_or_else(|| PorchError::validation("cluster object needs apiVersion and kind"))?;
        let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
        let name = obj.name_any();
        self.objects.write().map_err(poisoned)?.insert((gvk_key(&gvk), namespace.clone(), name.clone()), obj);
        let _ = self.tx.send(ClusterEvent { gvk, namespace, name, deleted: false });
        Ok(())
    }

    pub fn delete(&self, gvk: &GroupVersionKind, namespace: &str, name: &str) -> PorchResult<bool> {
        let removed = self.objects.write().map_err(poisoned)?.remove(&(gvk_key(gvk), namespace.to_string(), name.to_string())).is_some();
        if removed {
            let _ = self.tx.send(ClusterEvent { gvk: gvk.clone(), namespace: namespace.into(), name: name.into(), deleted: true });
        }
        Ok(removed)
    }
}

#[async_trait]
impl ClusterSource for MemoryClusterSource {
    async fn list(&self, gvk: &GroupVersionKind, namespace: &str) -> PorchResult<Vec<DynamicObject>> {
        let key = gvk_key(gvk);
        let objects = self.objects.read().map_err(poisoned)?;
        Ok(objects.iter().filter(|((k, ns, _), _)| *k == key && ns == namespace).map(|(_, o)| o.clone()).collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> { self.tx.subscribe() }
}

// ---- live cluster ----

/// Lists through the API server. The first list of a kind starts a watcher for
/// it, which feeds [`ClusterSource::subscribe`].
pub struct KubeClusterSource {
    client: Client,
    resources: tokio::sync::Mutex<FxHashMap<String, Option<(ApiResource, bool)>>>,
    watched: Mutex<FxHashSet<String>>,
    tx: broadcast::Sender<ClusterEvent>,
    cancel: CancellationToken,
}

impl KubeClusterSource {
    pub async fn try_default(cancel: CancellationToken) -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, cancel))
    }

    pub fn new(client: Client, cancel: CancellationToken) -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { client, resources: tokio::sync::Mutex::new(FxHashMap::default()), watched: Mutex::new(FxHashSet::default()), tx, cancel }
    }

    /// Resolve through discovery; `None` when the kind is not served. Cached per kind.
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<Option<(ApiResource, bool)>> {
        let key = gvk_key(gvk);
        let mut cache = self.resources.lock().await;
        if let Some(hit) = cache.get(&key) {
            return Ok(hit.clone());
        }
        let found = find_api_resource(self.client.clone(), gvk).await?;
        cache.insert(key, found.clone());
        Ok(found)
    }

    fn ensure_watch(&self, gvk: &GroupVersionKind, ar: &ApiResource) {
        let key = gvk_key(gvk);
        let fresh = match self.watched.lock() {
            Ok(mut w) => w.insert(key.clone()),
            Err(_) => false,
        };
        if !fresh {
            return;
        }
        // one watcher per kind across all namespaces
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), ar);
        let (tx, cancel, gvk) = (self.tx.clone(), self.cancel.clone(), gvk.clone());
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                res = watch_kind(api, gvk, tx) => {
                    if let Err(e) = res {
                        warn!(gvk = %key, error = %e, "cluster watcher failed");
                    }
                }
            }
        });
    }
}

#[async_trait]
impl ClusterSource for KubeClusterSource {
    async fn list(&self, gvk: &GroupVersionKind, namespace: &str) -> PorchResult<Vec<DynamicObject>> {
        let backend = |e: anyhow::Error| PorchError::backend(format!("cluster list {}: {e:#}", gvk_key(gvk)));
        let Some((ar, namespaced)) = self.resolve(gvk).await.map_err(backend)? else {
            debug!(gvk = %gvk_key(gvk), "kind not served by the cluster");
            return Ok(Vec::new());
        };
        self.ensure_watch(gvk, &ar);
        let api: Api<DynamicObject> =
            if namespaced { Api::namespaced_with(self.client.clone(), namespace, &ar) } else { Api::all_with(self.client.clone(), &ar) };
        let list = api.list(&ListParams::default()).await.map_err(|e| backend(e.into()))?;
        counter!("porch_cluster_lists_total", 1u64, "kind" => gvk.kind.clone());
        Ok(list
            .items
            .into_iter()
            .map(|mut o| {
                // listed items carry no type meta
                o.types.get_or_insert_with(|| kube::core::TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() });
                o
            })
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> { self.tx.subscribe() }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<Option<(ApiResource, bool)>> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok(Some((ar.clone(), namespaced)));
            }
        }
    }
    Ok(None)
}

fn event_for(gvk: &GroupVersionKind, obj: &DynamicObject, deleted: bool) -> ClusterEvent {
    ClusterEvent { gvk: gvk.clone(), namespace: obj.namespace().unwrap_or_default(), name: obj.name_any(), deleted }
}

async fn watch_kind(api: Api<DynamicObject>, gvk: GroupVersionKind, tx: broadcast::Sender<ClusterEvent>) -> Result<()> {
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(gvk = %gvk_key(&gvk), "cluster watcher started");
    while let Some(ev) = stream.try_next().await? {
        match ev {
            Event::Applied(o) => {
                let _ = tx.send(event_for(&gvk, &o, false));
            }
            Event::Deleted(o) => {
                let _ = tx.send(event_for(&gvk, &o, true));
            }
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                for o in list.iter() {
                    let _ = tx.send(event_for(&gvk, o, false));
                }
            }
        }
    }
    warn!(gvk = %gvk_key(&gvk), "cluster watcher stream ended");
    Ok(())
}
