//! PackageVariant status conditions.

use porch_core::condition::{set_condition, READY, STALLED};
use porch_core::variant::{DownstreamTarget, PackageVariantStatus};
use porch_core::{Condition, ConditionStatus};

pub const REASON_VALID: &str = "Valid";
pub const REASON_NO_ERRORS: &str = "NoErrors";
pub const REASON_VALIDATION: &str = "ValidationError";
pub const REASON_UPSTREAM_NOT_FOUND: &str = "UpstreamNotFound";

/// Needs user action; nothing is retried until the variant changes.
pub fn stalled(status: &mut PackageVariantStatus, reason: &str, message: &str) {
    set_condition(&mut status.conditions, Condition::new(STALLED, ConditionStatus::True, reason, message));
    set_condition(&mut status.conditions, Condition::new(READY, ConditionStatus::False, reason, message));
}

pub fn ready(status: &mut PackageVariantStatus, targets: Vec<DownstreamTarget>) {
    set_condition(&mut status.conditions, Condition::new(STALLED, ConditionStatus::False, REASON_VALID, ""));
    set_condition(&mut status.conditions, Condition::new(READY, ConditionStatus::True, REASON_NO_ERRORS, ""));
    status.downstream_targets = targets;
}

/// Valid intent whose last reconcile did not finish.
pub fn not_ready(status: &mut PackageVariantStatus, reason: &str, message: &str) {
    set_condition(&mut status.conditions, Condition::new(STALLED, ConditionStatus::False, REASON_VALID, ""));
    set_condition(&mut status.conditions, Condition::new(READY, ConditionStatus::False, reason, message));
}

#[cfg(test)]
mod tests {
    use super::*;
    use porch_core::condition::{find_condition, is_condition_true};

    #[test]
    fn stalled_then_ready() {
        let mut s = PackageVariantStatus::default();
        stalled(&mut s, REASON_VALIDATION, "missing required field spec.upstream");
        assert!(is_condition_true(&s.conditions, STALLED));
        assert!(!is_condition_true(&s.conditions, READY));
        ready(&mut s, vec![DownstreamTarget { name: "deployments.foo.packagevariant-1".into() }]);
        assert!(is_condition_true(&s.conditions, READY));
        assert_eq!(find_condition(&s.conditions, STALLED).map(|c| c.reason.as_str()), Some(REASON_VALID));
        assert_eq!(s.downstream_targets.len(), 1);
    }
}
