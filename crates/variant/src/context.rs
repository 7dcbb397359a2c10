//! Package context mutation: `data` keys set and removed on the
//! `kptfile.kpt.dev` ConfigMap in `package-context.yaml`.

use porch_core::variant::PackageContext;
use porch_core::{PorchError, PorchResult};
use porch_render::kptfile::{PACKAGE_CONTEXT_FILE, PACKAGE_CONTEXT_NAME};
use porch_render::{KubeObject, PackageResources};
use serde_yaml::Value;

fn context_object(res: &mut PackageResources) -> Option<&mut KubeObject> {
    res.objects_mut()
        .find(|(path, o)| *path == PACKAGE_CONTEXT_FILE && o.kind() == "ConfigMap" && o.name() == PACKAGE_CONTEXT_NAME)
        .map(|(_, o)| o)
}

/// Keys the context does not mention are left alone, including keys set by
/// earlier versions of the same variant.
pub fn apply_package_context(res: &mut PackageResources, ctx: Option<&PackageContext>) -> PorchResult<()> {
    let Some(ctx) = ctx.filter(|c| !c.is_empty()) else { return Ok(()) };
    let obj = context_object(res).ok_or_else(|| {
        PorchError::validation(format!(
            "package has no ConfigMap {PACKAGE_CONTEXT_NAME:?} in {PACKAGE_CONTEXT_FILE}; cannot apply spec.packageContext"
        ))
    })?;
    for (k, v) in &ctx.data {
        obj.set(&["data", k.as_str()], Value::from(v.as_str()));
    }
    for k in &ctx.remove_keys {
        obj.remove(&["data", k.as_str()]);
    }
    Ok(())
}
