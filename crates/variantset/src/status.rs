//! PackageVariantSet status conditions.

use porch_core::condition::{set_condition, READY, STALLED};
use porch_core::variantset::PackageVariantSetStatus;
use porch_core::{Condition, ConditionStatus};

pub const REASON_VALID: &str = "Valid";
pub const REASON_NO_ERRORS: &str = "NoErrors";
pub const REASON_VALIDATION: &str = "ValidationError";
pub const REASON_EXPANSION: &str = "ExpansionError";
pub const REASON_UPSTREAM_NOT_FOUND: &str = "UpstreamNotFound";
pub const REASON_WAITING: &str = "WaitingForVariants";

pub fn stalled(status: &mut PackageVariantSetStatus, reason: &str, message: &str) {
    set_condition(&mut status.conditions, Condition::new(STALLED, ConditionStatus::True, reason, message));
    set_condition(&mut status.conditions, Condition::new(READY, ConditionStatus::False, reason, message));
}

/// Every generated variant is ready.
pub fn ready(status: &mut PackageVariantSetStatus) {
    set_condition(&mut status.conditions, Condition::new(STALLED, ConditionStatus::False, REASON_VALID, ""));
    set_condition(&mut status.conditions, Condition::new(READY, ConditionStatus::True, REASON_NO_ERRORS, ""));
}

pub fn waiting(status: &mut PackageVariantSetStatus, message: &str) {
    set_condition(&mut status.conditions, Condition::new(STALLED, ConditionStatus::False, REASON_VALID, ""));
    set_condition(&mut status.conditions, Condition::new(READY, ConditionStatus::False, REASON_WAITING, message));
}
