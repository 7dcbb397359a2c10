//! Porch PackageVariant reconciler.
//!
//! A PackageVariant keeps one downstream package derived from one upstream
//! revision. [`VariantReconciler`] clones the upstream on first sight, moves
//! drafts onto new upstream revisions (copying published revisions first),
//! and applies the variant's own edits to every draft it manages:
//!
//! 1. [`context`]: keys in the `kptfile.kpt.dev` package context ConfigMap,
//! 2. [`pipeline`]: functions prepended to the Kptfile pipeline,
//! 3. [`injection`]: in-cluster configuration copied into marked resources.
//!
//! Deleting a variant deletes, proposes for deletion, or orphans its
//! revisions according to its deletion policy.

#![forbid(unsafe_code)]

pub mod context;
pub mod injection;
pub mod mutate;
pub mod pipeline;
pub mod reconciler;
pub mod status;
pub mod triggers;
pub mod validate;

pub use mutate::{apply_mutations, Mutated};
pub use reconciler::{VariantReconciler, NOT_FOUND_REQUEUE};
pub use validate::{validate, validate_spec};
