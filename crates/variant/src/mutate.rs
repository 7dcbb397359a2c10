//! The variant's edits to a downstream package, applied in a fixed order:
//! package context, then pipeline, then injection.

use kube::ResourceExt;
use porch_core::{PackageVariant, PorchResult, ResourceMap};
use porch_kubehub::ClusterSource;
use porch_render::PackageResources;

use crate::context::apply_package_context;
use crate::injection::{inject, InjectionOutcome};
use crate::pipeline::apply_pipeline;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutated {
    pub resources: ResourceMap,
    pub injections: Vec<InjectionOutcome>,
}

impl Mutated {
    /// Required injection points nothing was injected into.
    pub fn missing_required(&self) -> impl Iterator<Item = &str> {
        self.injections.iter().filter(|o| o.required && o.injected.is_none()).map(|o| o.condition_type.as_str())
    }
}

/// Unchanged files come back byte-identical, so a second pass over the
/// output returns it unchanged.
pub async fn apply_mutations(pv: &PackageVariant, resources: &ResourceMap, cluster: &dyn ClusterSource) -> PorchResult<Mutated> {
    let mut res = PackageResources::parse(resources)?;
    apply_package_context(&mut res, pv.spec.package_context.as_ref())?;
    apply_pipeline(&mut res, &pv.name_any(), pv.spec.pipeline.as_ref())?;
    let namespace = pv.namespace().unwrap_or_default();
    let injections = inject(&mut res, &namespace, &pv.spec.injectors, cluster).await?;
    Ok(Mutated { resources: res.to_map()?, injections })
}
