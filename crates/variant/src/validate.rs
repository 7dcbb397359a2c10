//! Static checks on a PackageVariant spec. All problems are reported at once.

use porch_core::variant::{Function, PackageVariantSpec, RESERVED_CONTEXT_KEYS};
use porch_core::{PackageVariant, PorchError};

fn check_function(list: &str, i: usize, f: &Function, errs: &mut Vec<String>) {
    if f.image.is_empty() {
        errs.push(format!("spec.pipeline.{list}[{i}].image is required"));
    }
    if f.name.is_empty() {
        errs.push(format!("spec.pipeline.{list}[{i}].name is required"));
    } else if f.name.contains('.') {
        errs.push(format!("spec.pipeline.{list}[{i}].name {:?} must not contain '.'", f.name));
    }
}

/// Human-readable problems with `spec`; empty when valid.
pub fn validate_spec(spec: &PackageVariantSpec) -> Vec<String> {
    let mut errs = Vec::new();
    match &spec.upstream {
        None => errs.push("missing required field spec.upstream".to_string()),
        Some(up) => {
            for (field, v) in [("repo", &up.repo), ("package", &up.package), ("revision", &up.revision)] {
                if v.is_empty() {
                    errs.push(format!("missing required field spec.upstream.{field}"));
                }
            }
        }
    }
    match &spec.downstream {
        None => errs.push("missing required field spec.downstream".to_string()),
        Some(down) => {
            for (field, v) in [("repo", &down.repo), ("package", &down.package)] {
                if v.is_empty() {
                    errs.push(format!("missing required field spec.downstream.{field}"));
                }
            }
        }
    }
    if let Err(e) = spec.adoption_policy() {
        errs.push(message(e));
    }
    if let Err(e) = spec.deletion_policy() {
        errs.push(message(e));
    }
    if let Some(ctx) = &spec.package_context {
        for key in RESERVED_CONTEXT_KEYS {
            if ctx.data.contains_key(key) {
                errs.push(format!("spec.packageContext.data cannot include the reserved key {key:?}"));
            }
            if ctx.remove_keys.iter().any(|k| k == key) {
                errs.push(format!("spec.packageContext.removeKeys cannot include the reserved key {key:?}"));
            }
        }
    }
    if let Some(p) = &spec.pipeline {
        for (i, f) in p.validators.iter().enumerate() {
            check_function("validators", i, f, &mut errs);
        }
        for (i, f) in p.mutators.iter().enumerate() {
            check_function("mutators", i, f, &mut errs);
        }
    }
    for (i, inj) in spec.injectors.iter().enumerate() {
        if inj.name.is_empty() {
            errs.push(format!("spec.injectors[{i}].name is required"));
        }
    }
    errs
}

fn message(e: PorchError) -> String {
    match e {
        PorchError::Validation(m) => m,
        other => other.to_string(),
    }
}

pub fn validate(pv: &PackageVariant) -> Result<(), PorchError> {
    let errs = validate_spec(&pv.spec);
    if errs.is_empty() {
        Ok(())
    } else {
        Err(PorchError::Validation(errs.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use porch_core::variant::{Downstream, PackageContext, Pipeline, Upstream};

    fn valid() -> PackageVariantSpec {
        PackageVariantSpec {
            upstream: Some(Upstream { repo: "blueprints".into(), package: "foo".into(), revision: "v1".into() }),
            downstream: Some(Downstream { repo: "deployments".into(), package: "foo".into() }),
            ..Default::default()
        }
    }

    #[test]
    fn accepts_minimal_spec() {
        assert!(validate_spec(&valid()).is_empty());
    }

    #[test]
    fn collects_every_problem() {
        let mut spec = valid();
        spec.upstream.as_mut().unwrap().revision.clear();
        spec.downstream = None;
        spec.adoption_policy = Some("adoptAll".into());
        spec.package_context = Some(PackageContext { data: [("name".to_string(), "x".to_string())].into(), remove_keys: vec!["package-path".into()] });
        spec.pipeline = Some(Pipeline {
            mutators: vec![Function { image: String::new(), name: "a.b".into(), ..Default::default() }],
            ..Default::default()
        });
        let errs = validate_spec(&spec);
        assert_eq!(errs.len(), 7, "{errs:#?}");
        assert!(errs.iter().any(|e| e.contains("spec.upstream.revision")));
        assert!(errs.iter().any(|e| e.contains("adoptionPolicy")));
        assert!(errs.iter().any(|e| e.contains("must not contain '.'")));
    }
}
