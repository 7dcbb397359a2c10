//! Object name rules (DNS-1123) and deterministic name derivation.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::{fnv1a64, PorchError, PorchResult};

/// Longest name accepted for generated objects.
pub const MAX_NAME_LEN: usize = 63;

static DNS1123_LABEL: Lazy<Result<Regex, regex::Error>> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$"));
static INVALID_RUN: Lazy<Result<Regex, regex::Error>> = Lazy::new(|| Regex::new(r"[^a-z0-9-]+"));

fn compiled(re: &'static Lazy<Result<Regex, regex::Error>>) -> PorchResult<&'static Regex> {
    Lazy::force(re).as_ref().map_err(|e| PorchError::Backend(format!("name pattern: {e}")))
}

pub fn is_dns1123_label(name: &str) -> PorchResult<bool> {
    Ok(name.len() <= MAX_NAME_LEN && compiled(&DNS1123_LABEL)?.is_match(name))
}

/// Join `parts` with `-`, coerce the result into a DNS-1123 label and
/// append a hash of the unsanitized parts.
///
/// The readable prefix is lossy (`-` may occur inside a part and runs of
/// invalid characters collapse), so the suffix is what tells inputs apart.
/// The prefix is cut to fit [`MAX_NAME_LEN`].
pub fn derive_name(parts: &[&str]) -> PorchResult<String> {
    let lowered = parts.join("-").to_ascii_lowercase();
    let cleaned = compiled(&INVALID_RUN)?.replace_all(&lowered, "-");
    let trimmed = cleaned.trim_matches('-');
    let suffix = format!("{:016x}", fnv1a64(parts.join("\0").as_bytes()));
    let keep = MAX_NAME_LEN - suffix.len() - 1;
    let prefix: String = trimmed.chars().take(keep).collect();
    let prefix = prefix.trim_end_matches('-');
    Ok(if prefix.is_empty() { suffix } else { format!("{prefix}-{suffix}") })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels() {
        assert!(is_dns1123_label("foo-bar1").unwrap());
        assert!(!is_dns1123_label("Foo").unwrap());
        assert!(!is_dns1123_label("-foo").unwrap());
        assert!(!is_dns1123_label(&"a".repeat(64)).unwrap());
    }

    #[test]
    fn derived_names_are_valid_and_stable() {
        let name = derive_name(&["set", "Deployments", "foo/bar"]).unwrap();
        assert!(name.starts_with("set-deployments-foo-bar-"), "{name}");
        assert!(is_dns1123_label(&name).unwrap());
        assert_eq!(name, derive_name(&["set", "Deployments", "foo/bar"]).unwrap());

        let long = "x".repeat(80);
        let a = derive_name(&["set", &long, "a"]).unwrap();
        let b = derive_name(&["set", &long, "b"]).unwrap();
        assert_ne!(a, b);
        assert!(is_dns1123_label(&a).unwrap());
        assert_eq!(a.len(), MAX_NAME_LEN);
    }

    #[test]
    fn parts_that_sanitize_alike_stay_distinct() {
        let split = derive_name(&["edge", "east", "foo-bar"]).unwrap();
        let shifted = derive_name(&["edge", "east-foo", "bar"]).unwrap();
        let slashed = derive_name(&["edge", "east", "foo/bar"]).unwrap();
        assert_ne!(split, shifted);
        assert_ne!(split, slashed);
        assert_ne!(shifted, slashed);
        for n in [&split, &shifted, &slashed] {
            assert!(n.starts_with("edge-east-foo-bar-"), "{n}");
        }
    }
}
