//! Config injection: package resources annotated `kpt.dev/config-injection`
//! receive the `spec` (or ConfigMap `data`) of an in-cluster object picked by
//! the variant's injectors.
//!
//! Each injection point gets a `config.injection.<Kind>.<name>` condition in
//! the Kptfile; required points also get a readiness gate of the same type,
//! which keeps the revision from being published until the injection succeeds.

use std::collections::{BTreeMap, BTreeSet};

use kube::core::{DynamicObject, GroupVersionKind};
use metrics::counter;
use porch_core::annotations::{CONFIG_INJECTION, INJECTED_RESOURCE_NAME};
use porch_core::variant::InjectionSelector;
use porch_core::{Condition, ConditionStatus, PorchError, PorchResult};
use porch_kubehub::{gvk_key, ClusterSource};
use porch_render::{KptfileMut, PackageResources};
use tracing::debug;

pub const CONDITION_PREFIX: &str = "config.injection.";

pub const REASON_INJECTED: &str = "ConfigInjected";
pub const REASON_NO_RESOURCE: &str = "NoResourceSelected";

pub fn condition_type(kind: &str, name: &str) -> String {
    format!("{CONDITION_PREFIX}{kind}.{name}")
}

/// A package resource that wants in-cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionPoint {
    pub path: String,
    pub gvk: GroupVersionKind,
    pub name: String,
    pub required: bool,
}

impl InjectionPoint {
    pub fn condition_type(&self) -> String { condition_type(&self.gvk.kind, &self.name) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionOutcome {
    pub condition_type: String,
    pub required: bool,
    /// Name of the injected in-cluster object.
    pub injected: Option<String>,
}

pub fn injection_points(res: &PackageResources) -> PorchResult<Vec<InjectionPoint>> {
    let mut out = Vec::new();
    for (path, obj) in res.objects() {
        let Some(mode) = obj.annotation(CONFIG_INJECTION) else { continue };
        let required = match mode {
            "required" => true,
            "optional" => false,
            other => {
                return Err(PorchError::validation(format!(
                    "{path}: {}/{} has {CONFIG_INJECTION}={other:?}; expected \"required\" or \"optional\"",
                    obj.kind(),
                    obj.name()
                )))
            }
        };
        let (group, version) = obj.group_version();
        out.push(InjectionPoint {
            path: path.to_string(),
            gvk: GroupVersionKind::gvk(group, version, obj.kind()),
            name: obj.name().to_string(),
            required,
        });
    }
    Ok(out)
}

fn selector_matches_kind(sel: &InjectionSelector, gvk: &GroupVersionKind) -> bool {
    fn eq(want: &Option<String>, have: &str) -> bool {
        want.as_deref().map(|w| w == have).unwrap_or(true)
    }
    eq(&sel.group, &gvk.group) && eq(&sel.version, &gvk.version) && eq(&sel.kind, &gvk.kind)
}

/// First injector, in declared order, that names a listed object of the point's kind.
pub fn select<'a>(injectors: &[InjectionSelector], gvk: &GroupVersionKind, candidates: &'a [DynamicObject]) -> Option<&'a DynamicObject> {
    injectors
        .iter()
        .filter(|sel| selector_matches_kind(sel, gvk))
        .find_map(|sel| candidates.iter().find(|o| o.metadata.name.as_deref() == Some(sel.name.as_str())))
}

fn payload_field(gvk: &GroupVersionKind) -> &'static str {
    if gvk.group.is_empty() && gvk.kind == "ConfigMap" { "data" } else { "spec" }
}

fn copy_payload(res: &mut PackageResources, point: &InjectionPoint, from: &DynamicObject) -> PorchResult<String> {
    let field = payload_field(&point.gvk);
    let chosen = from.metadata.name.clone().unwrap_or_default();
    let payload = match from.data.get(field) {
        Some(v) => Some(serde_yaml::to_value(v).map_err(|e| PorchError::Injection(format!("converting {field} of {chosen}: {e}")))?),
        None => None,
    };
    let target = res
        .objects_mut()
        .find(|(path, o)| *path == point.path && o.kind() == point.gvk.kind && o.name() == point.name)
        .map(|(_, o)| o)
        .ok_or_else(|| PorchError::Injection(format!("injection point {}/{} disappeared", point.gvk.kind, point.name)))?;
    match payload {
        Some(v) => target.set(&[field], v),
        None => {
            target.remove(&[field]);
        }
    }
    target.set_annotation(INJECTED_RESOURCE_NAME, &chosen);
    Ok(chosen)
}

/// Inject into every injection point of `res`. Cluster objects are looked up
/// in `namespace`, each kind listed once per call.
pub async fn inject(
    res: &mut PackageResources,
    namespace: &str,
    injectors: &[InjectionSelector],
    cluster: &dyn ClusterSource,
) -> PorchResult<Vec<InjectionOutcome>> {
    let points = injection_points(res)?;
    let mut listed: BTreeMap<String, Vec<DynamicObject>> = BTreeMap::new();
    let mut outcomes = Vec::with_capacity(points.len());
    for point in &points {
        let key = gvk_key(&point.gvk);
        if !listed.contains_key(&key) {
            let objects = cluster.list(&point.gvk, namespace).await?;
            listed.insert(key.clone(), objects);
        }
        let candidates = listed.get(&key).map(Vec::as_slice).unwrap_or(&[]);
        let injected = match select(injectors, &point.gvk, candidates) {
            Some(obj) => Some(copy_payload(res, point, obj)?),
            None => None,
        };
        counter!("porch_injection_total", 1u64, "result" => if injected.is_some() { "injected" } else { "unmatched" });
        debug!(point = %point.condition_type(), injected = ?injected, required = point.required, "injection point resolved");
        outcomes.push(InjectionOutcome { condition_type: point.condition_type(), required: point.required, injected });
    }
    record_conditions(res, &outcomes)?;
    Ok(outcomes)
}

/// Stale `config.injection.*` gates and conditions go; gates a human added
/// for current points stay.
fn record_conditions(res: &mut PackageResources, outcomes: &[InjectionOutcome]) -> PorchResult<()> {
    let Some(obj) = res.kptfile_mut() else {
        if outcomes.is_empty() {
            return Ok(());
        }
        return Err(PorchError::Injection("package has no Kptfile to record injection conditions".into()));
    };
    let current: BTreeSet<&str> = outcomes.iter().map(|o| o.condition_type.as_str()).collect();
    let mut k = KptfileMut::new(obj);
    k.retain_readiness_gates(|g| !g.starts_with(CONDITION_PREFIX) || current.contains(g));
    k.retain_conditions(|c| !c.type_.starts_with(CONDITION_PREFIX) || current.contains(c.type_.as_str()))?;
    for o in outcomes {
        if o.required {
            k.add_readiness_gate(&o.condition_type);
        }
        let cond = match &o.injected {
            Some(name) => Condition::new(
                &o.condition_type,
                ConditionStatus::True,
                REASON_INJECTED,
                format!("injected resource {name:?} from cluster"),
            ),
            None => Condition::new(
                &o.condition_type,
                ConditionStatus::False,
                REASON_NO_RESOURCE,
                "no in-cluster resource matched any injector",
            ),
        };
        k.set_condition(cond)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use porch_core::ResourceMap;
    use porch_kubehub::MemoryClusterSource;
    use porch_render::kptfile::{gates_and_conditions, KPTFILE};

    const KPTFILE_TEXT: &str = "apiVersion: kpt.dev/v1\nkind: Kptfile\nmetadata:\n  name: foo\ninfo:\n  readinessGates:\n  - conditionType: config.injection.ConfigMap.gone\n  - conditionType: manual\n";
    const POINT: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: foo-cfg\n  annotations:\n    kpt.dev/config-injection: required\ndata:\n  endpoint: placeholder\n";
    const OPTIONAL: &str = "apiVersion: example.com/v1\nkind: Endpoints\nmetadata:\n  name: db\n  annotations:\n    kpt.dev/config-injection: optional\nspec:\n  host: localhost\n";

    fn package() -> PackageResources {
        let mut m = ResourceMap::new();
        m.insert(KPTFILE.into(), KPTFILE_TEXT.into());
        m.insert("cfg.yaml".into(), POINT.into());
        m.insert("db.yaml".into(), OPTIONAL.into());
        PackageResources::parse(&m).unwrap()
    }

    fn cluster() -> MemoryClusterSource {
        let c = MemoryClusterSource::new();
        for (name, endpoint) in [("uswest1-endpoints", "10.0.0.2"), ("useast1-endpoints", "10.0.0.1")] {
            c.apply(serde_json::json!({
                "apiVersion": "v1", "kind": "ConfigMap",
                "metadata": {"name": name, "namespace": "default"},
                "data": {"endpoint": endpoint}
            }))
            .unwrap();
        }
        c
    }

    fn sel(name: &str, kind: Option<&str>) -> InjectionSelector {
        InjectionSelector { kind: kind.map(str::to_string), name: name.into(), ..Default::default() }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn injects_first_matching_selector_and_records_gates() {
        let mut res = package();
        let injectors = [sel("missing", None), sel("useast1-endpoints", Some("ConfigMap")), sel("uswest1-endpoints", None)];
        let out = inject(&mut res, "default", &injectors, &cluster()).await.unwrap();
        assert_eq!(out.len(), 2);

        let map = res.to_map().unwrap();
        let cfg: serde_yaml::Value = serde_yaml::from_str(&map["cfg.yaml"]).unwrap();
        assert_eq!(cfg["data"]["endpoint"], serde_yaml::Value::from("10.0.0.1"));
        assert_eq!(cfg["metadata"]["annotations"][INJECTED_RESOURCE_NAME], serde_yaml::Value::from("useast1-endpoints"));
        assert_eq!(map["db.yaml"], OPTIONAL);

        let (gates, conds) = gates_and_conditions(&map).unwrap();
        assert_eq!(gates, vec!["manual", "config.injection.ConfigMap.foo-cfg"]);
        let cfg_cond = conds.iter().find(|c| c.type_ == "config.injection.ConfigMap.foo-cfg").unwrap();
        assert!(cfg_cond.is_true());
        assert_eq!(cfg_cond.reason, REASON_INJECTED);
        let db_cond = conds.iter().find(|c| c.type_ == "config.injection.Endpoints.db").unwrap();
        assert_eq!((db_cond.is_true(), db_cond.reason.as_str()), (false, REASON_NO_RESOURCE));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn second_pass_changes_nothing() {
        let c = cluster();
        let injectors = [sel("useast1-endpoints", None)];
        let mut res = package();
        inject(&mut res, "default", &injectors, &c).await.unwrap();
        let once = res.to_map().unwrap();
        let mut again = PackageResources::parse(&once).unwrap();
        inject(&mut again, "default", &injectors, &c).await.unwrap();
        assert!(!again.is_changed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn selector_kind_filter_and_bad_annotation() {
        let mut res = package();
        let out = inject(&mut res, "default", &[sel("useast1-endpoints", Some("Secret"))], &cluster()).await.unwrap();
        assert!(out.iter().all(|o| o.injected.is_none()));

        let mut m = ResourceMap::new();
        m.insert("x.yaml".into(), POINT.replace("required", "sometimes"));
        let mut bad = PackageResources::parse(&m).unwrap();
        let err = inject(&mut bad, "default", &[], &cluster()).await.unwrap_err();
        assert!(matches!(err, PorchError::Validation(_)));
    }
}
