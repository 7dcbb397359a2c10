//! Porch render seam: package resources, the Kptfile model and the [`Renderer`] trait.
//!
//! Function execution is external; the core only calls a renderer after a
//! draft's resources change.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use porch_core::{PorchResult, ResourceMap};
use tracing::debug;

pub mod kptfile;
pub mod resources;

pub use kptfile::KptfileMut;
pub use resources::{KubeObject, ObjectIdentity, PackageResources};

/// Runs a package's declared pipeline over its resources.
#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, resources: ResourceMap) -> PorchResult<ResourceMap>;
}

/// Checks that the package parses and returns it unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRenderer;

#[async_trait]
impl Renderer for NoopRenderer {
    async fn render(&self, resources: ResourceMap) -> PorchResult<ResourceMap> {
        let parsed = PackageResources::parse(&resources)?;
        debug!(files = resources.len(), objects = parsed.objects().count(), "render: noop");
        Ok(resources)
    }
}
