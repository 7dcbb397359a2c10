//! CEL evaluation of PackageVariant templates.
//!
//! Expressions see a fixed set of variables: `repoDefault`, `packageDefault`,
//! `upstream`, `target` and, once the downstream repository is known,
//! `repository`. Objects are reduced to `name`, `namespace`, `labels` and
//! `annotations` whatever their schema.

use std::collections::BTreeMap;

use cel_interpreter::{Context, Program, Value};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use porch_core::variant::{Downstream, Function, InjectionSelector, PackageContext, PackageVariantSpec, Pipeline, Upstream};
use porch_core::variantset::{FunctionTemplate, MapExpr, PackageVariantTemplate};
use porch_core::{PorchError, PorchResult, Repository};
use serde_json::{json, Value as Json};

/// The whitelisted view of an object.
pub fn object_view(meta: &ObjectMeta) -> Json {
    json!({
        "name": meta.name.clone().unwrap_or_default(),
        "namespace": meta.namespace.clone().unwrap_or_default(),
        "labels": meta.labels.clone().unwrap_or_default(),
        "annotations": meta.annotations.clone().unwrap_or_default(),
    })
}

/// Variables of one expansion candidate.
#[derive(Debug, Clone)]
pub struct Scope {
    vars: BTreeMap<&'static str, Json>,
}

impl Scope {
    pub fn new(repo_default: &str, package_default: &str, upstream: Json, target: Json) -> Self {
        let mut vars = BTreeMap::new();
        vars.insert("repoDefault", Json::from(repo_default));
        vars.insert("packageDefault", Json::from(package_default));
        vars.insert("upstream", upstream);
        vars.insert("target", target);
        Self { vars }
    }

    pub fn with_repository(mut self, repo: &Repository) -> Self {
        self.vars.insert("repository", object_view(&repo.metadata));
        self
    }

    fn default_of(&self, name: &str) -> String {
        self.vars.get(name).and_then(Json::as_str).unwrap_or_default().to_string()
    }

    /// Evaluate `expr` to a string. Numbers and booleans are formatted.
    pub fn eval(&self, expr: &str) -> PorchResult<String> {
        let program = Program::compile(expr).map_err(|e| PorchError::expansion(format!("compile {expr:?}: {e}")))?;
        let mut ctx = Context::default();
        for (name, value) in &self.vars {
            ctx.add_variable(*name, value.clone()).map_err(|e| PorchError::expansion(format!("variable {name}: {e}")))?;
        }
        let value = program.execute(&ctx).map_err(|e| PorchError::expansion(format!("evaluate {expr:?}: {e}")))?;
        match value {
            Value::String(s) => Ok(s.to_string()),
            Value::Int(i) => Ok(i.to_string()),
            Value::UInt(u) => Ok(u.to_string()),
            Value::Float(f) => Ok(f.to_string()),
            Value::Bool(b) => Ok(b.to_string()),
            other => Err(PorchError::expansion(format!("{expr:?} evaluated to {other:?}, expected a string"))),
        }
    }

    /// An expression takes precedence over its literal.
    fn pick(&self, literal: Option<&String>, expr: Option<&String>) -> PorchResult<Option<String>> {
        match (expr.filter(|e| !e.is_empty()), literal.filter(|l| !l.is_empty())) {
            (Some(e), _) => self.eval(e).map(Some),
            (None, Some(l)) => Ok(Some(l.clone())),
            (None, None) => Ok(None),
        }
    }

    fn map_exprs(&self, base: &BTreeMap<String, String>, exprs: &[MapExpr], field: &str) -> PorchResult<BTreeMap<String, String>> {
        let mut out = base.clone();
        for (i, e) in exprs.iter().enumerate() {
            let key = self
                .pick(e.key.as_ref(), e.key_expr.as_ref())?
                .ok_or_else(|| PorchError::expansion(format!("{field}[{i}]: key or keyExpr is required")))?;
            let value = self
                .pick(e.value.as_ref(), e.value_expr.as_ref())?
                .ok_or_else(|| PorchError::expansion(format!("{field}[{i}]: value or valueExpr is required")))?;
            out.insert(key, value);
        }
        Ok(out)
    }

    fn functions(&self, list: &[FunctionTemplate], field: &str) -> PorchResult<Vec<Function>> {
        list.iter()
            .enumerate()
            .map(|(i, f)| {
                let config_map = self.map_exprs(&f.function.config_map, &f.config_map_exprs, &format!("{field}[{i}].configMapExprs"))?;
                Ok(Function { config_map, ..f.function.clone() })
            })
            .collect()
    }
}

/// Downstream repository of a candidate. Evaluated before `repository` is known.
pub fn downstream_repo(template: Option<&PackageVariantTemplate>, scope: &Scope) -> PorchResult<String> {
    let down = template.and_then(|t| t.downstream.as_ref());
    let picked = scope.pick(down.and_then(|d| d.repo.as_ref()), down.and_then(|d| d.repo_expr.as_ref()))?;
    Ok(picked.unwrap_or_else(|| scope.default_of("repoDefault")))
}

/// Render the PackageVariant spec of one candidate. `scope` must already
/// carry the downstream repository.
pub fn render_spec(template: Option<&PackageVariantTemplate>, scope: &Scope, upstream: &Upstream, repo: &str) -> PorchResult<PackageVariantSpec> {
    let empty = PackageVariantTemplate::default();
    let t = template.unwrap_or(&empty);
    let down = t.downstream.as_ref();
    let package = scope
        .pick(down.and_then(|d| d.package.as_ref()), down.and_then(|d| d.package_expr.as_ref()))?
        .unwrap_or_else(|| scope.default_of("packageDefault"));

    let package_context = match &t.package_context {
        None => None,
        Some(pc) => {
            let data = scope.map_exprs(&pc.data, &pc.data_exprs, "packageContext.dataExprs")?;
            let mut remove_keys = pc.remove_keys.clone();
            for e in &pc.remove_key_exprs {
                remove_keys.push(scope.eval(e)?);
            }
            Some(PackageContext { data, remove_keys })
        }
    };
    let pipeline = match &t.pipeline {
        None => None,
        Some(p) => Some(Pipeline {
            validators: scope.functions(&p.validators, "pipeline.validators")?,
            mutators: scope.functions(&p.mutators, "pipeline.mutators")?,
        }),
    };
    let injectors = t
        .injectors
        .iter()
        .enumerate()
        .map(|(i, s)| {
            let name = scope
                .pick(s.name.as_ref(), s.name_expr.as_ref())?
                .ok_or_else(|| PorchError::expansion(format!("injectors[{i}]: name or nameExpr is required")))?;
            Ok(InjectionSelector { group: s.group.clone(), version: s.version.clone(), kind: s.kind.clone(), name })
        })
        .collect::<PorchResult<Vec<_>>>()?;

    Ok(PackageVariantSpec {
        upstream: Some(upstream.clone()),
        downstream: Some(Downstream { repo: repo.to_string(), package }),
        adoption_policy: t.adoption_policy.clone(),
        deletion_policy: t.deletion_policy.clone(),
        labels: scope.map_exprs(&t.labels, &t.label_exprs, "labelExprs")?,
        annotations: scope.map_exprs(&t.annotations, &t.annotation_exprs, "annotationExprs")?,
        package_context,
        pipeline,
        injectors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Scope {
        let upstream = json!({"name": "blueprints.foo.v1", "namespace": "default", "labels": {}, "annotations": {}});
        let target = json!({"name": "useast1", "namespace": "default", "labels": {"region": "us-east1"}, "annotations": {}});
        Scope::new("useast1", "foo", upstream, target)
    }

    fn repo() -> Repository {
        serde_json::from_value(json!({
            "metadata": {"name": "useast1", "namespace": "default", "labels": {"env": "prod"}},
            "spec": {"type": "git", "git": {"repo": "https://example.com/useast1.git"}, "deployment": true}
        }))
        .unwrap()
    }

    #[test]
    fn evaluates_strings_over_whitelisted_fields() {
        let s = scope();
        assert_eq!(s.eval("target.labels['region']").unwrap(), "us-east1");
        assert_eq!(s.eval("repoDefault + '-' + packageDefault").unwrap(), "useast1-foo");
        assert_eq!(s.eval("1 + 2").unwrap(), "3");
        assert!(matches!(s.eval("repository.name"), Err(PorchError::Expansion(_))));
        assert!(matches!(s.eval("target.labels["), Err(PorchError::Expansion(_))));
    }

    #[test]
    fn renders_literals_and_expressions() {
        let template: PackageVariantTemplate = serde_json::from_value(json!({
            "downstream": {"packageExpr": "packageDefault + '-' + target.labels['region']"},
            "deletionPolicy": "orphan",
            "labels": {"team": "edge"},
            "labelExprs": [{"key": "env", "valueExpr": "repository.labels['env']"}],
            "packageContext": {"data": {"a": "b"}, "dataExprs": [{"keyExpr": "'region'", "valueExpr": "target.labels['region']"}], "removeKeyExprs": ["'legacy'"]},
            "pipeline": {"mutators": [{"image": "set-labels:v1", "name": "labels", "configMapExprs": [{"key": "region", "valueExpr": "target.labels['region']"}]}]},
            "injectors": [{"kind": "ConfigMap", "nameExpr": "target.name + '-endpoints'"}]
        }))
        .unwrap();
        let upstream = Upstream { repo: "blueprints".into(), package: "foo".into(), revision: "v1".into() };
        let s = scope().with_repository(&repo());
        let repo_name = downstream_repo(Some(&template), &s).unwrap();
        assert_eq!(repo_name, "useast1");
        let spec = render_spec(Some(&template), &s, &upstream, &repo_name).unwrap();
        assert_eq!(spec.downstream.as_ref().map(|d| d.package.as_str()), Some("foo-us-east1"));
        assert_eq!(spec.deletion_policy.as_deref(), Some("orphan"));
        assert_eq!(spec.labels.get("env").map(String::as_str), Some("prod"));
        assert_eq!(spec.labels.get("team").map(String::as_str), Some("edge"));
        let pc = spec.package_context.unwrap();
        assert_eq!(pc.data.get("region").map(String::as_str), Some("us-east1"));
        assert_eq!(pc.remove_keys, vec!["legacy".to_string()]);
        let mutators = spec.pipeline.unwrap().mutators;
        assert_eq!(mutators[0].config_map.get("region").map(String::as_str), Some("us-east1"));
        assert_eq!(spec.injectors[0].name, "useast1-endpoints");
    }

    #[test]
    fn missing_template_uses_defaults() {
        let upstream = Upstream { repo: "blueprints".into(), package: "foo".into(), revision: "v1".into() };
        let s = scope();
        let repo_name = downstream_repo(None, &s).unwrap();
        let spec = render_spec(None, &s, &upstream, &repo_name).unwrap();
        assert_eq!(spec.downstream, Some(Downstream { repo: "useast1".into(), package: "foo".into() }));
        assert!(spec.labels.is_empty());
    }

    #[test]
    fn map_entries_need_a_key() {
        let template: PackageVariantTemplate = serde_json::from_value(json!({"annotationExprs": [{"value": "x"}]})).unwrap();
        let upstream = Upstream::default();
        let err = render_spec(Some(&template), &scope(), &upstream, "r").unwrap_err();
        assert_eq!(err, PorchError::expansion("annotationExprs[0]: key or keyExpr is required"));
    }
}
