use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use porch_controller::{Action, Reconciler};
use porch_core::revision::{compare_revisions, next_workspace};
use porch_core::variant::{
    AdoptionPolicy, DeletionPolicy, Downstream, DownstreamTarget, PackageVariantStatus, Upstream, PACKAGE_VARIANT_FINALIZER,
};
use porch_core::{
    add_finalizer, add_owner, is_deleting, owner_reference, owners_of_kind, remove_finalizer, remove_owner, Lifecycle, ObjectKey,
    PackageRevision, PackageRevisionKey, PackageVariant, PorchError, PorchResult, RevisionFilter, Task, UpstreamRef,
};
use porch_kubehub::ClusterSource;
use porch_store::{NewRevision, ObjectStore, PackageRevisionStore};
use tracing::{debug, info, warn};

use crate::mutate::{apply_mutations, Mutated};
use crate::status::{self, REASON_UPSTREAM_NOT_FOUND, REASON_VALIDATION};
use crate::validate::validate;

/// Missing repositories and upstreams are looked for again after this long.
pub const NOT_FOUND_REQUEUE: Duration = Duration::from_secs(30);

pub const REASON_INJECTION_PENDING: &str = "InjectionPending";

const KIND: &str = "PackageVariant";

/// How a revision relates to the variant being reconciled.
#[derive(Debug, PartialEq, Eq)]
enum Claim {
    Owned,
    /// Owned by an earlier variant of the same name that has since been deleted.
    Stale(String),
    /// Owned by a different variant.
    Foreign,
    Unowned,
}

fn claim(pr: &PackageRevision, name: &str, uid: &str) -> Claim {
    if pr.is_owned_by(uid) {
        return Claim::Owned;
    }
    let mut foreign = false;
    for o in owners_of_kind(&pr.metadata, KIND) {
        if o.name == name {
            return Claim::Stale(o.uid.clone());
        }
        foreign = true;
    }
    if foreign { Claim::Foreign } else { Claim::Unowned }
}

fn upstream_of(pr: &PackageRevision) -> Option<&UpstreamRef> {
    pr.upstream().or(pr.status.upstream_lock.as_ref())
}

fn merge_into(target: &mut Option<BTreeMap<String, String>>, from: &BTreeMap<String, String>) -> bool {
    if from.is_empty() {
        return false;
    }
    let map = target.get_or_insert_with(BTreeMap::new);
    let mut changed = false;
    for (k, v) in from {
        if map.get(k) != Some(v) {
            map.insert(k.clone(), v.clone());
            changed = true;
        }
    }
    changed
}

struct Converged {
    targets: Vec<DownstreamTarget>,
    /// Readiness gates of required injections that found nothing to inject.
    pending: Vec<String>,
}

/// Drives each PackageVariant's downstream revisions toward its upstream.
pub struct VariantReconciler {
    variants: Arc<ObjectStore<PackageVariant>>,
    revisions: Arc<PackageRevisionStore>,
    cluster: Arc<dyn ClusterSource>,
}

impl VariantReconciler {
    pub fn new(variants: Arc<ObjectStore<PackageVariant>>, revisions: Arc<PackageRevisionStore>, cluster: Arc<dyn ClusterSource>) -> Self {
        Self { variants, revisions, cluster }
    }

    pub fn variants(&self) -> &Arc<ObjectStore<PackageVariant>> { &self.variants }

    fn write_status(&self, pv: &PackageVariant, f: impl FnOnce(&mut PackageVariantStatus)) -> PorchResult<()> {
        let mut next = pv.clone();
        f(&mut next.status);
        if next.status != pv.status {
            self.variants.update_status(&next)?;
        }
        Ok(())
    }

    /// Apply the deletion policy to the variant's revisions, then let the variant go.
    async fn finalize(&self, mut pv: PackageVariant) -> PorchResult<Action> {
        if !pv.finalizers().iter().any(|f| f == PACKAGE_VARIANT_FINALIZER) {
            return Ok(Action::Done);
        }
        // an unparseable policy must not strand the finalizer
        let policy = pv.spec.deletion_policy().unwrap_or_default();
        let uid = pv.uid().unwrap_or_default();
        let namespace = pv.namespace().unwrap_or_default();
        for pr in self.revisions.list(&RevisionFilter::default().namespace(&namespace).owner(&uid)) {
            self.release(&pr, &uid, policy).await?;
        }
        let key = ObjectKey::of(&pv);
        remove_finalizer(&mut pv.metadata, PACKAGE_VARIANT_FINALIZER);
        self.variants.update(pv)?;
        info!(pv = %key, policy = ?policy, "package variant finalized");
        Ok(Action::Done)
    }

    async fn release(&self, pr: &PackageRevision, uid: &str, policy: DeletionPolicy) -> PorchResult<()> {
        let key = pr.key();
        match (policy, pr.lifecycle()) {
            (DeletionPolicy::Orphan, _) => {
                let mut next = pr.clone();
                if remove_owner(&mut next.metadata, uid) {
                    self.revisions.update_metadata(&next).await?;
                    info!(revision = %key, "package revision orphaned");
                }
            }
            (DeletionPolicy::Delete, Lifecycle::Draft | Lifecycle::Proposed) => {
                self.revisions.delete(pr).await?;
                info!(revision = %key, "package revision deleted");
            }
            (DeletionPolicy::Delete, Lifecycle::Published) => {
                self.revisions.set_lifecycle(pr, Lifecycle::DeletionProposed).await?;
                info!(revision = %key, "package revision proposed for deletion");
            }
            (DeletionPolicy::Delete, Lifecycle::DeletionProposed) => {}
        }
        Ok(())
    }

    async fn take_over(
        &self,
        pr: &PackageRevision,
        owner: &OwnerReference,
        stale_uid: Option<&str>,
        adopt_from: Option<&PackageVariant>,
    ) -> PorchResult<Arc<PackageRevision>> {
        let mut next = pr.clone();
        if let Some(old) = stale_uid {
            remove_owner(&mut next.metadata, old);
        }
        add_owner(&mut next.metadata, owner.clone());
        if let Some(pv) = adopt_from {
            merge_into(&mut next.metadata.labels, &pv.spec.labels);
            merge_into(&mut next.metadata.annotations, &pv.spec.annotations);
        }
        let out = self.revisions.update_metadata(&next).await?;
        info!(revision = %pr.key(), owner = %owner.name, adopted = adopt_from.is_some(), "package revision taken over");
        Ok(out)
    }

    fn next_workspace(&self, namespace: &str, down: &Downstream) -> String {
        let existing = self.revisions.list(&RevisionFilter::default().namespace(namespace).repository(&down.repo).package(&down.package));
        next_workspace(existing.iter().map(|pr| pr.spec.workspace_name.as_str()))
    }

    async fn is_up_to_date(&self, pv: &PackageVariant, pr: &PackageRevision, desired: &UpstreamRef) -> PorchResult<bool> {
        if upstream_of(pr) != Some(desired) {
            return Ok(false);
        }
        let current = self.revisions.resources(&pr.key()).await?;
        Ok(apply_mutations(pv, &current, self.cluster.as_ref()).await?.resources == current)
    }

    /// Move a draft onto `desired` and apply the variant's mutations. A
    /// draft that already matches is left untouched.
    async fn bring_up_to_date(&self, pv: &PackageVariant, pr: Arc<PackageRevision>, desired: &UpstreamRef) -> PorchResult<Mutated> {
        let key = pr.key();
        let needs_upstream = upstream_of(&pr) != Some(desired);
        let mut current = self.revisions.resources(&key).await?;
        let mut mutated = apply_mutations(pv, &current, self.cluster.as_ref()).await?;
        if !needs_upstream && mutated.resources == current {
            debug!(revision = %key, "downstream up to date");
            return Ok(mutated);
        }
        let mut pr = pr;
        if pr.lifecycle() == Lifecycle::Proposed {
            pr = self.revisions.set_lifecycle(&pr, Lifecycle::Draft).await?;
            info!(revision = %key, "proposal returned to draft for variant changes");
        }
        if needs_upstream {
            pr = self.revisions.update_upstream(&pr, desired.clone()).await?;
            current = self.revisions.resources(&key).await?;
            mutated = apply_mutations(pv, &current, self.cluster.as_ref()).await?;
        }
        if mutated.resources != current {
            self.revisions.update_resources(&pr, mutated.resources.clone(), None).await?;
            info!(revision = %key, "variant mutations applied");
        }
        Ok(mutated)
    }

    async fn converge(&self, pv: &PackageVariant, up: &Upstream, down: &Downstream) -> PorchResult<Converged> {
        let namespace = pv.namespace().unwrap_or_default();
        let name = pv.name_any();
        let uid = pv.uid().unwrap_or_default();
        let owner = owner_reference(pv).ok_or_else(|| PorchError::validation(format!("package variant {name} has no uid")))?;
        let adoption = pv.spec.adoption_policy()?;
        let deletion = pv.spec.deletion_policy()?;
        let desired = UpstreamRef { repository: up.repo.clone(), package: up.package.clone(), revision: up.revision.clone() };

        let mut mine = Vec::new();
        for pr in self.revisions.list(&RevisionFilter::default().namespace(&namespace)) {
            let matching = pr.key().same_package(&down.repo, &down.package);
            match claim(&pr, &name, &uid) {
                Claim::Owned if matching => mine.push(pr),
                Claim::Owned => self.release(&pr, &uid, deletion).await?,
                Claim::Stale(old) if matching => mine.push(self.take_over(&pr, &owner, Some(&old), None).await?),
                Claim::Unowned if matching && adoption == AdoptionPolicy::AdoptExisting => {
                    mine.push(self.take_over(&pr, &owner, None, Some(pv)).await?)
                }
                Claim::Foreign if matching => debug!(revision = %pr.key(), "matching revision owned by another variant"),
                _ => {}
            }
        }

        for pr in mine.iter_mut() {
            if pr.lifecycle() == Lifecycle::DeletionProposed {
                *pr = self.revisions.set_lifecycle(pr, Lifecycle::Published).await?;
                info!(revision = %pr.key(), "package revision revived");
            }
        }

        let drafts: Vec<Arc<PackageRevision>> = mine.iter().filter(|pr| pr.lifecycle().is_draft_like()).cloned().collect();
        let latest = mine
            .iter()
            .filter(|pr| pr.lifecycle().is_published())
            .max_by(|a, b| compare_revisions(&a.spec.revision, &b.spec.revision))
            .cloned();

        let mut pending = Vec::new();
        if !drafts.is_empty() {
            for draft in drafts {
                let m = self.bring_up_to_date(pv, draft, &desired).await?;
                pending.extend(m.missing_required().map(str::to_string));
            }
        } else if let Some(published) = latest {
            if !self.is_up_to_date(pv, &published, &desired).await? {
                let ws = self.next_workspace(&namespace, down);
                let draft = self.revisions.copy(&published, &ws, Some(owner.clone())).await?;
                info!(pv = %name, source = %published.key(), revision = %draft.key(), "published downstream copied for update");
                let m = self.bring_up_to_date(pv, draft, &desired).await?;
                pending.extend(m.missing_required().map(str::to_string));
            }
        } else {
            let ws = self.next_workspace(&namespace, down);
            let mut req = NewRevision::new(PackageRevisionKey::new(&namespace, &down.repo, &down.package, &ws), Task::Clone { upstream: desired.clone() });
            req.labels = pv.spec.labels.clone();
            req.annotations = pv.spec.annotations.clone();
            req.owner = Some(owner.clone());
            let draft = self.revisions.create(req).await?;
            info!(pv = %name, revision = %draft.key(), upstream = %desired, "downstream draft cloned");
            let m = self.bring_up_to_date(pv, draft, &desired).await?;
            pending.extend(m.missing_required().map(str::to_string));
        }

        let targets = self
            .revisions
            .list(&RevisionFilter::default().namespace(&namespace).repository(&down.repo).package(&down.package).owner(&uid))
            .iter()
            .map(|pr| DownstreamTarget { name: pr.name_any() })
            .collect();
        Ok(Converged { targets, pending })
    }
}

#[async_trait]
impl Reconciler for VariantReconciler {
    fn name(&self) -> &'static str { "packagevariant" }

    async fn reconcile(&self, key: &ObjectKey) -> PorchResult<Action> {
        let Some(current) = self.variants.get(key) else {
            debug!(pv = %key, "package variant gone");
            return Ok(Action::Done);
        };
        let mut pv = (*current).clone();
        if is_deleting(&pv.metadata) {
            return self.finalize(pv).await;
        }
        if let Err(e) = validate(&pv) {
            warn!(pv = %key, error = %e, "invalid package variant");
            self.write_status(&pv, |s| status::stalled(s, REASON_VALIDATION, &e.to_string()))?;
            return Ok(Action::Done);
        }
        let (Some(up), Some(down)) = (pv.spec.upstream.clone(), pv.spec.downstream.clone()) else {
            return Ok(Action::Done);
        };
        if add_finalizer(&mut pv.metadata, PACKAGE_VARIANT_FINALIZER) {
            pv = (*self.variants.update(pv)?).clone();
        }

        let namespace = pv.namespace().unwrap_or_default();
        if self.revisions.find_published(&namespace, &up.repo, &up.package, &up.revision).is_none() {
            let msg = format!("upstream package revision {}/{}@{} not found", up.repo, up.package, up.revision);
            warn!(pv = %key, "{msg}");
            self.write_status(&pv, |s| status::stalled(s, REASON_UPSTREAM_NOT_FOUND, &msg))?;
            return Ok(Action::RequeueAfter(NOT_FOUND_REQUEUE));
        }

        match self.converge(&pv, &up, &down).await {
            Ok(c) if c.pending.is_empty() => {
                self.write_status(&pv, |s| status::ready(s, c.targets))?;
                Ok(Action::Done)
            }
            Ok(c) => {
                let msg = format!("required injection not fulfilled: {}", c.pending.join(", "));
                self.write_status(&pv, |s| {
                    status::not_ready(s, REASON_INJECTION_PENDING, &msg);
                    s.downstream_targets = c.targets;
                })?;
                Ok(Action::Done)
            }
            Err(e) if e.is_retryable() => Err(e),
            Err(e @ PorchError::NotFound(_)) => {
                self.write_status(&pv, |s| status::stalled(s, e.kind(), &e.to_string()))?;
                Ok(Action::RequeueAfter(NOT_FOUND_REQUEUE))
            }
            Err(e) => {
                warn!(pv = %key, error = %e, "package variant stalled");
                self.write_status(&pv, |s| status::stalled(s, e.kind(), &e.to_string()))?;
                Ok(Action::Done)
            }
        }
    }
}
