//! Porch in-RAM stores.
//!
//! - [`ObjectStore`]: Repository, PackageVariant and PackageVariantSet objects
//!   with resource-version compare-and-set, finalizers and watch.
//! - [`PackageRevisionStore`]: the revision catalogue across repositories.
//! - [`WorkQueue`]: the coalescing reconcile queue.
//!
//! Reads are lock-free snapshot loads (`ArcSwap`); every write emits a
//! sequenced [`WatchEvent`].

#![forbid(unsafe_code)]

pub mod events;
pub mod objects;
pub mod queue;
pub mod revisions;

pub use events::{EventKind, EventLog, Watch, WatchEvent};
pub use objects::ObjectStore;
pub use queue::WorkQueue;
pub use revisions::{NewRevision, PackageRevisionStore};

/// Default number of events kept for watch resume.
pub const DEFAULT_HISTORY: usize = 1024;
