//! Initial contents for new drafts.

use porch_core::{PorchError, PorchResult, ResourceMap};
use porch_render::kptfile::{new_kptfile, package_context_file, KPTFILE, PACKAGE_CONTEXT_FILE};
use porch_render::{KptfileMut, PackageResources};

/// Last path segment of a package name.
pub fn package_base_name(package: &str) -> &str {
    package.rsplit('/').next().unwrap_or(package)
}

/// Resources of an `init` task: just the Kptfile.
pub fn init_resources(package: &str, description: &str) -> ResourceMap {
    let mut out = ResourceMap::new();
    out.insert(KPTFILE.to_string(), new_kptfile(package_base_name(package), description));
    out
}

/// Resources of a `clone` task.
///
/// The Kptfile is renamed after the downstream package; when `deployment` is
/// set a package context is generated unless the upstream already has one.
pub fn clone_resources(upstream: &ResourceMap, package: &str, deployment: bool) -> PorchResult<ResourceMap> {
    let mut res = PackageResources::parse(upstream)?;
    let name = package_base_name(package);
    match res.kptfile_mut() {
        Some(k) => KptfileMut::new(k).set_name(name),
        None => return Err(PorchError::validation(format!("upstream package has no {KPTFILE}"))),
    }
    if deployment && !res.contains_file(PACKAGE_CONTEXT_FILE) {
        res.insert_file(PACKAGE_CONTEXT_FILE, package_context_file(name, package))?;
    }
    res.to_map()
}
