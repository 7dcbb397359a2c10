use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::ResourceExt;
use metrics::counter;
use porch_controller::{Action, Reconciler};
use porch_core::condition::{is_condition_true, READY};
use porch_core::revision::compare_revisions;
use porch_core::variant::Upstream;
use porch_core::variantset::{PackageVariantSetStatus, PACKAGE_VARIANT_SET_FINALIZER, PACKAGE_VARIANT_SET_LABEL};
use porch_core::{
    add_finalizer, is_deleting, is_owned_by, remove_finalizer, Lifecycle, ObjectKey, PackageRevision, PackageVariant,
    PackageVariantSet, PorchError, PorchResult, Repository, RevisionFilter,
};
use porch_kubehub::ClusterSource;
use porch_store::{ObjectStore, PackageRevisionStore};
use tracing::{debug, info, warn};

use crate::expand::{expand, Expansion};
use crate::status::{self, REASON_EXPANSION, REASON_UPSTREAM_NOT_FOUND, REASON_VALIDATION};
use crate::targets::check_target;

/// Missing upstreams are looked for again after this long.
pub const NOT_FOUND_REQUEUE: Duration = Duration::from_secs(30);

pub fn validate(pvs: &PackageVariantSet) -> PorchResult<()> {
    let mut errs = Vec::new();
    match &pvs.spec.upstream {
        None => errs.push("missing required field spec.upstream".to_string()),
        Some(up) => {
            if up.repo.is_empty() {
                errs.push("missing required field spec.upstream.repo".to_string());
            }
            if up.package.is_empty() {
                errs.push("missing required field spec.upstream.package".to_string());
            }
        }
    }
    for (i, t) in pvs.spec.targets.iter().enumerate() {
        if let Err(PorchError::Validation(msg)) = check_target(i, t) {
            errs.push(msg);
        }
    }
    if errs.is_empty() { Ok(()) } else { Err(PorchError::validation(errs.join("; "))) }
}

#[derive(Debug, Default)]
struct Synced {
    total: usize,
    ready: usize,
    conflicts: Vec<String>,
}

/// Keeps the PackageVariants generated from each PackageVariantSet in line with its targets.
pub struct VariantSetReconciler {
    sets: Arc<ObjectStore<PackageVariantSet>>,
    variants: Arc<ObjectStore<PackageVariant>>,
    repositories: Arc<ObjectStore<Repository>>,
    revisions: Arc<PackageRevisionStore>,
    cluster: Arc<dyn ClusterSource>,
}

impl VariantSetReconciler {
    pub fn new(
        sets: Arc<ObjectStore<PackageVariantSet>>,
        variants: Arc<ObjectStore<PackageVariant>>,
        repositories: Arc<ObjectStore<Repository>>,
        revisions: Arc<PackageRevisionStore>,
        cluster: Arc<dyn ClusterSource>,
    ) -> Self {
        Self { sets, variants, repositories, revisions, cluster }
    }

    pub fn sets(&self) -> &Arc<ObjectStore<PackageVariantSet>> { &self.sets }

    fn write_status(&self, pvs: &PackageVariantSet, f: impl FnOnce(&mut PackageVariantSetStatus)) -> PorchResult<()> {
        let mut next = pvs.clone();
        f(&mut next.status);
        if next.status != pvs.status {
            self.sets.update_status(&next)?;
        }
        Ok(())
    }

    fn owned(&self, pvs: &PackageVariantSet) -> Vec<Arc<PackageVariant>> {
        let uid = pvs.uid().unwrap_or_default();
        self.variants.list(pvs.namespace().as_deref()).into_iter().filter(|pv| is_owned_by(&pv.metadata, &uid)).collect()
    }

    fn delete_variant(&self, pv: &PackageVariant) -> PorchResult<()> {
        if is_deleting(&pv.metadata) {
            return Ok(());
        }
        match self.variants.delete(&ObjectKey::of(pv)) {
            Ok(_) | Err(PorchError::NotFound(_)) => {
                info!(variant = %ObjectKey::of(pv), "generated package variant deleted");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn finalize(&self, mut pvs: PackageVariantSet) -> PorchResult<Action> {
        if !pvs.finalizers().iter().any(|f| f == PACKAGE_VARIANT_SET_FINALIZER) {
            return Ok(Action::Done);
        }
        for pv in self.owned(&pvs) {
            self.delete_variant(&pv)?;
        }
        let key = ObjectKey::of(&pvs);
        remove_finalizer(&mut pvs.metadata, PACKAGE_VARIANT_SET_FINALIZER);
        self.sets.update(pvs)?;
        info!(pvs = %key, "package variant set finalized");
        Ok(Action::Done)
    }

    /// The upstream with its revision pinned; an empty revision means the latest published one.
    fn resolve_upstream(&self, namespace: &str, up: &Upstream) -> Option<(Upstream, Arc<PackageRevision>)> {
        let pr = if up.revision.is_empty() {
            let filter = RevisionFilter::default().namespace(namespace).repository(&up.repo).package(&up.package).lifecycle(Lifecycle::Published);
            self.revisions.list(&filter).into_iter().max_by(|a, b| compare_revisions(&a.spec.revision, &b.spec.revision))?
        } else {
            self.revisions.find_published(namespace, &up.repo, &up.package, &up.revision)?
        };
        let pinned = Upstream { revision: pr.spec.revision.clone(), ..up.clone() };
        Some((pinned, pr))
    }

    /// Create and update generated variants; delete stale ones only when the
    /// expansion covered every target.
    fn sync(&self, pvs: &PackageVariantSet, expansion: &Expansion) -> PorchResult<Synced> {
        let set_key = ObjectKey::of(pvs);
        let uid = pvs.uid().unwrap_or_default();
        let mut out = Synced { total: expansion.variants.len(), ..Default::default() };
        let mut wanted = BTreeSet::new();
        for desired in &expansion.variants {
            let key = ObjectKey::of(desired);
            wanted.insert(key.clone());
            let Some(existing) = self.variants.get(&key) else {
                self.variants.create(desired.clone())?;
                counter!("porch_variants_generated_total", 1u64);
                info!(pvs = %set_key, variant = %key, "package variant generated");
                continue;
            };
            if !is_owned_by(&existing.metadata, &uid) {
                out.conflicts.push(format!("package variant {key} exists and is not owned by this set"));
                continue;
            }
            if is_deleting(&existing.metadata) {
                continue;
            }
            let mut next = (*existing).clone();
            next.spec = desired.spec.clone();
            next.metadata.labels.get_or_insert_with(Default::default).insert(PACKAGE_VARIANT_SET_LABEL.to_string(), pvs.name_any());
            if next != *existing {
                self.variants.update(next)?;
                info!(pvs = %set_key, variant = %key, "generated package variant updated");
            } else if is_condition_true(&existing.status.conditions, READY) {
                out.ready += 1;
            }
        }
        if expansion.is_complete() {
            for pv in self.owned(pvs) {
                if !wanted.contains(&ObjectKey::of(&*pv)) {
                    self.delete_variant(&pv)?;
                }
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Reconciler for VariantSetReconciler {
    fn name(&self) -> &'static str { "packagevariantset" }

    async fn reconcile(&self, key: &ObjectKey) -> PorchResult<Action> {
        let Some(current) = self.sets.get(key) else {
            debug!(pvs = %key, "package variant set gone");
            return Ok(Action::Done);
        };
        let mut pvs = (*current).clone();
        if is_deleting(&pvs.metadata) {
            return self.finalize(pvs);
        }
        if let Err(e) = validate(&pvs) {
            warn!(pvs = %key, error = %e, "invalid package variant set");
            self.write_status(&pvs, |s| status::stalled(s, REASON_VALIDATION, &e.to_string()))?;
            return Ok(Action::Done);
        }
        let Some(up) = pvs.spec.upstream.clone() else {
            return Ok(Action::Done);
        };
        if add_finalizer(&mut pvs.metadata, PACKAGE_VARIANT_SET_FINALIZER) {
            pvs = (*self.sets.update(pvs)?).clone();
        }

        let namespace = pvs.namespace().unwrap_or_default();
        let Some((pinned, upstream_pr)) = self.resolve_upstream(&namespace, &up) else {
            let rev = if up.revision.is_empty() { "latest" } else { up.revision.as_str() };
            let msg = format!("upstream package revision {}/{}@{rev} not found", up.repo, up.package);
            warn!(pvs = %key, "{msg}");
            self.write_status(&pvs, |s| status::stalled(s, REASON_UPSTREAM_NOT_FOUND, &msg))?;
            return Ok(Action::RequeueAfter(NOT_FOUND_REQUEUE));
        };

        let expansion = expand(&pvs, &pinned, &upstream_pr, &self.repositories, self.cluster.as_ref()).await;
        let synced = match self.sync(&pvs, &expansion) {
            Ok(s) => s,
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                warn!(pvs = %key, error = %e, "package variant set stalled");
                self.write_status(&pvs, |s| status::stalled(s, e.kind(), &e.to_string()))?;
                return Ok(Action::Done);
            }
        };

        let problems: Vec<String> = expansion.errors.iter().cloned().chain(synced.conflicts).collect();
        if !problems.is_empty() {
            let msg = problems.join("; ");
            warn!(pvs = %key, problems = problems.len(), "package variant set stalled");
            self.write_status(&pvs, |s| status::stalled(s, REASON_EXPANSION, &msg))?;
        } else if synced.ready == synced.total {
            self.write_status(&pvs, status::ready)?;
        } else {
            let msg = format!("{} of {} package variants ready", synced.ready, synced.total);
            self.write_status(&pvs, |s| status::waiting(s, &msg))?;
        }
        Ok(Action::Done)
    }
}
