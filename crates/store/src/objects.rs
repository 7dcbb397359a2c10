//! In-RAM store for namespaced intent objects (Repository, PackageVariant, PackageVariantSet).
//!
//! Readers load an immutable snapshot; writers swap in a new map with `rcu`.
//! Writes that leave the object unchanged emit no event, so reconcilers that
//! rewrite identical status do not retrigger themselves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use porch_core::{is_deleting, now, Object, ObjectKey, PorchError, PorchResult};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::events::{EventKind, EventLog, Watch, WatchEvent};

type Snapshot<T> = FxHashMap<ObjectKey, Arc<T>>;

pub struct ObjectStore<T> {
    items: ArcSwap<Snapshot<T>>,
    log: EventLog<T>,
    versions: AtomicU64,
}

enum Outcome<T> {
    Written(EventKind, Arc<T>),
    Unchanged(Arc<T>),
}

fn spec_of<T: Object>(obj: &T) -> PorchResult<serde_json::Value> {
    Ok(serde_json::to_value(obj)?.get("spec").cloned().unwrap_or(serde_json::Value::Null))
}

impl<T: Object> ObjectStore<T> {
    pub fn new(history: usize) -> Self {
        Self { items: ArcSwap::from_pointee(FxHashMap::default()), log: EventLog::new(history), versions: AtomicU64::new(0) }
    }

    fn kind() -> String { T::kind(&()).into_owned() }

    fn next_version(&self) -> String { (self.versions.fetch_add(1, Ordering::SeqCst) + 1).to_string() }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<T>> { self.items.load().get(key).cloned() }

    /// Objects in `namespace` (all namespaces when `None`), ordered by key.
    pub fn list(&self, namespace: Option<&str>) -> Vec<Arc<T>> {
        let snap = self.items.load();
        let mut out: Vec<(&ObjectKey, &Arc<T>)> =
            snap.iter().filter(|(k, _)| namespace.map(|ns| k.namespace == ns).unwrap_or(true)).collect();
        out.sort_by(|a, b| a.0.cmp(b.0));
        out.into_iter().map(|(_, v)| Arc::clone(v)).collect()
    }

    pub fn len(&self) -> usize { self.items.load().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn publish(&self, outcome: Outcome<T>) -> Arc<T> {
        match outcome {
            Outcome::Written(kind, obj) => {
                debug!(kind = %Self::kind(), object = %ObjectKey::of(&*obj), event = ?kind, "object written");
                self.log.emit(kind, Arc::clone(&obj));
                obj
            }
            Outcome::Unchanged(obj) => obj,
        }
    }

    /// Insert a new object. Server-side metadata is assigned here.
    pub fn create(&self, mut obj: T) -> PorchResult<Arc<T>> {
        let kind = Self::kind();
        let meta = obj.meta_mut();
        if meta.name.as_deref().unwrap_or("").is_empty() {
            return Err(PorchError::validation(format!("{kind}: metadata.name is required")));
        }
        if meta.namespace.as_deref().unwrap_or("").is_empty() {
            meta.namespace = Some("default".into());
        }
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
        meta.creation_timestamp = Some(now());
        meta.deletion_timestamp = None;
        meta.generation = Some(1);
        meta.resource_version = Some(self.next_version());
        let key = ObjectKey::of(&obj);
        let obj = Arc::new(obj);
        let mut result = Ok(());
        self.items.rcu(|cur| {
            if cur.contains_key(&key) {
                result = Err(PorchError::AlreadyExists(format!("{kind} {key}")));
                return Arc::clone(cur);
            }
            result = Ok(());
            let mut next = (**cur).clone();
            next.insert(key.clone(), Arc::clone(&obj));
            Arc::new(next)
        });
        result?;
        Ok(self.publish(Outcome::Written(EventKind::Added, obj)))
    }

    /// Replace an object's metadata and spec. A set resource version must match the
    /// stored one. Status is carried over from the stored object unless `with_status`.
    fn replace(&self, obj: T, with_status: bool) -> PorchResult<Arc<T>> {
        let kind = Self::kind();
        let key = ObjectKey::of(&obj);
        let incoming_rv = obj.meta().resource_version.clone();
        let incoming_spec = spec_of(&obj)?;
        let incoming_status = serde_json::to_value(&obj)?.get("status").cloned();
        let mut result: PorchResult<Outcome<T>> = Err(PorchError::not_found(format!("{kind} {key}")));
        self.items.rcu(|cur| {
            result = self.next_state(cur, &key, &obj, incoming_rv.as_deref(), &incoming_spec, incoming_status.as_ref(), with_status);
            match &result {
                Ok(Outcome::Written(EventKind::Deleted, _)) => {
                    let mut next = (**cur).clone();
                    next.remove(&key);
                    Arc::new(next)
                }
                Ok(Outcome::Written(_, o)) => {
                    let mut next = (**cur).clone();
                    next.insert(key.clone(), Arc::clone(o));
                    Arc::new(next)
                }
                _ => Arc::clone(cur),
            }
        });
        Ok(self.publish(result?))
    }

    #[allow(clippy::too_many_arguments)]
    fn next_state(
        &self,
        cur: &Snapshot<T>,
        key: &ObjectKey,
        obj: &T,
        incoming_rv: Option<&str>,
        incoming_spec: &serde_json::Value,
        incoming_status: Option<&serde_json::Value>,
        with_status: bool,
    ) -> PorchResult<Outcome<T>> {
        let kind = Self::kind();
        let existing = cur.get(key).ok_or_else(|| PorchError::not_found(format!("{kind} {key}")))?;
        let stored = existing.meta();
        if let Some(rv) = incoming_rv {
            if Some(rv) != stored.resource_version.as_deref() {
                return Err(PorchError::conflict(format!(
                    "{kind} {key} was modified (have version {rv}, stored {})",
                    stored.resource_version.as_deref().unwrap_or("")
                )));
            }
        }
        let mut value = serde_json::to_value(obj)?;
        let old = serde_json::to_value(&**existing)?;
        let status = if with_status { incoming_status.cloned() } else { old.get("status").cloned() };
        match (value.as_object_mut(), status) {
            (Some(map), Some(s)) => {
                map.insert("status".into(), s);
            }
            (Some(map), None) => {
                map.remove("status");
            }
            _ => {}
        }
        let mut next: T = serde_json::from_value(value)?;
        {
            let meta = next.meta_mut();
            meta.uid = stored.uid.clone();
            meta.creation_timestamp = stored.creation_timestamp.clone();
            // deletion cannot be revoked by an update
            meta.deletion_timestamp = stored.deletion_timestamp.clone();
            meta.resource_version = stored.resource_version.clone();
            let generation = stored.generation.unwrap_or(1);
            meta.generation = Some(if *incoming_spec != spec_of(&**existing)? { generation + 1 } else { generation });
        }
        if serde_json::to_value(&next)? == old {
            return Ok(Outcome::Unchanged(Arc::clone(existing)));
        }
        next.meta_mut().resource_version = Some(self.next_version());
        let finalizers_left = next.meta().finalizers.as_ref().map(|f| !f.is_empty()).unwrap_or(false);
        if is_deleting(next.meta()) && !finalizers_left {
            return Ok(Outcome::Written(EventKind::Deleted, Arc::new(next)));
        }
        Ok(Outcome::Written(EventKind::Modified, Arc::new(next)))
    }

    /// Update metadata and spec; status is kept as stored.
    /// Removing the last finalizer of a deleting object removes it.
    pub fn update(&self, obj: T) -> PorchResult<Arc<T>> { self.replace(obj, false) }

    /// Write status only; everything else is taken from the stored object.
    /// Not version checked: status has a single writer per kind.
    pub fn update_status(&self, obj: &T) -> PorchResult<Arc<T>> {
        let key = ObjectKey::of(obj);
        let existing = self.get(&key).ok_or_else(|| PorchError::not_found(format!("{} {key}", Self::kind())))?;
        let mut base = serde_json::to_value(&*existing)?;
        let status = serde_json::to_value(obj)?.get("status").cloned();
        if let (Some(map), Some(s)) = (base.as_object_mut(), status) {
            map.insert("status".into(), s);
        }
        let mut next: T = serde_json::from_value(base)?;
        next.meta_mut().resource_version = existing.meta().resource_version.clone();
        self.replace(next, true)
    }

    /// Mark for deletion when finalizers remain, otherwise remove. Returns the
    /// object as it was last seen.
    pub fn delete(&self, key: &ObjectKey) -> PorchResult<Arc<T>> {
        let kind = Self::kind();
        let existing = self.get(key).ok_or_else(|| PorchError::not_found(format!("{kind} {key}")))?;
        let has_finalizers = existing.meta().finalizers.as_ref().map(|f| !f.is_empty()).unwrap_or(false);
        if has_finalizers {
            if is_deleting(existing.meta()) {
                return Ok(existing);
            }
            let mut marked = (*existing).clone();
            marked.meta_mut().deletion_timestamp = Some(now());
            marked.meta_mut().resource_version = Some(self.next_version());
            let marked = Arc::new(marked);
            let mut result = Ok(());
            self.items.rcu(|cur| {
                match cur.get(key) {
                    Some(o) if o.meta().resource_version == existing.meta().resource_version => {
                        result = Ok(());
                        let mut next = (**cur).clone();
                        next.insert(key.clone(), Arc::clone(&marked));
                        Arc::new(next)
                    }
                    _ => {
                        result = Err(PorchError::conflict(format!("{kind} {key} changed during delete")));
                        Arc::clone(cur)
                    }
                }
            });
            result?;
            return Ok(self.publish(Outcome::Written(EventKind::Modified, marked)));
        }
        let mut removed = None;
        self.items.rcu(|cur| {
            removed = cur.get(key).cloned();
            if removed.is_none() {
                return Arc::clone(cur);
            }
            let mut next = (**cur).clone();
            next.remove(key);
            Arc::new(next)
        });
        let obj = removed.ok_or_else(|| PorchError::not_found(format!("{kind} {key}")))?;
        Ok(self.publish(Outcome::Written(EventKind::Deleted, obj)))
    }

    /// Without `since`, the initial events are the current objects as `Added`.
    pub fn watch(&self, since: Option<u64>) -> PorchResult<Watch<T>> {
        let (replay, rx) = self.log.subscribe(since)?;
        let initial = match since {
            Some(_) => replay,
            None => {
                let seq = self.log.last_seq();
                self.list(None).into_iter().map(|object| WatchEvent { seq, kind: EventKind::Added, object }).collect()
            }
        };
        Ok(Watch { initial, rx })
    }

    pub fn last_seq(&self) -> u64 { self.log.last_seq() }
}
