//! Porch PackageVariantSet reconciler.
//!
//! A PackageVariantSet fans one upstream package out to many downstream
//! targets: explicit repository lists, repositories chosen by label, or
//! arbitrary in-cluster objects. Each target is rendered through a
//! PackageVariant template whose fields may be CEL expressions, and the
//! resulting PackageVariants are created, updated and deleted so that they
//! match the set. Generated variants are owned by the set and labelled
//! with its name.

#![forbid(unsafe_code)]

pub mod expand;
pub mod reconciler;
pub mod status;
pub mod targets;
pub mod template;
pub mod triggers;

pub use expand::{expand, variant_name, Expansion};
pub use reconciler::{validate, VariantSetReconciler, NOT_FOUND_REQUEUE};
