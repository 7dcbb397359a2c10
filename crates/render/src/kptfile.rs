//! The package manifest (Kptfile) and the package context ConfigMap.
//!
//! Readiness gates live under `info.readinessGates[].conditionType` and
//! conditions under `status.conditions`, so both travel with the resource map.

use porch_core::{Condition, PorchError, PorchResult, ResourceMap};
use serde_yaml::Value;

use crate::resources::{parse_documents, KubeObject};

pub const KPTFILE: &str = "Kptfile";
pub const KPTFILE_KIND: &str = "Kptfile";
pub const KPTFILE_API_VERSION: &str = "kpt.dev/v1";

pub const PACKAGE_CONTEXT_FILE: &str = "package-context.yaml";
pub const PACKAGE_CONTEXT_NAME: &str = "kptfile.kpt.dev";

pub const MUTATORS: &str = "mutators";
pub const VALIDATORS: &str = "validators";

pub fn new_kptfile(name: &str, description: &str) -> String {
    let mut out = format!("apiVersion: {KPTFILE_API_VERSION}\nkind: {KPTFILE_KIND}\nmetadata:\n  name: {name}\n");
    if !description.is_empty() {
        out.push_str(&format!("info:\n  description: {}\n", yaml_scalar(description)));
    }
    out
}

/// The context ConfigMap generated for packages in deployment repositories.
pub fn package_context_file(name: &str, package_path: &str) -> String {
    format!(
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {PACKAGE_CONTEXT_NAME}\n  annotations:\n    config.kubernetes.io/local-config: \"true\"\ndata:\n  name: {}\n  package-path: {}\n",
        yaml_scalar(name),
        yaml_scalar(package_path),
    )
}

fn yaml_scalar(s: &str) -> String {
    serde_yaml::to_string(s).map(|v| v.trim_end().to_string()).unwrap_or_else(|_| format!("{s:?}"))
}

pub fn readiness_gates(kptfile: &KubeObject) -> Vec<String> {
    kptfile
        .get(&["info", "readinessGates"])
        .and_then(Value::as_sequence)
        .map(|seq| seq.iter().filter_map(|g| g.get("conditionType")?.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

pub fn conditions(kptfile: &KubeObject) -> PorchResult<Vec<Condition>> {
    match kptfile.get(&["status", "conditions"]) {
        Some(v) => serde_yaml::from_value(v.clone()).map_err(|e| PorchError::Render(format!("Kptfile status.conditions: {e}"))),
        None => Ok(Vec::new()),
    }
}

/// Gates and conditions declared by the Kptfile of `resources`, if any.
pub fn gates_and_conditions(resources: &ResourceMap) -> PorchResult<(Vec<String>, Vec<Condition>)> {
    let Some(text) = resources.get(KPTFILE) else { return Ok((Vec::new(), Vec::new())) };
    let docs = parse_documents(text).map_err(|e| PorchError::Render(format!("{KPTFILE}: {e}")))?;
    match docs.into_iter().map(KubeObject::new).find(|o| o.kind() == KPTFILE_KIND) {
        Some(k) => Ok((readiness_gates(&k), conditions(&k)?)),
        None => Ok((Vec::new(), Vec::new())),
    }
}

/// Mutable view over a Kptfile document.
pub struct KptfileMut<'a> {
    obj: &'a mut KubeObject,
}

impl<'a> KptfileMut<'a> {
    pub fn new(obj: &'a mut KubeObject) -> Self { Self { obj } }

    pub fn set_name(&mut self, name: &str) {
        self.obj.set(&["metadata", "name"], Value::from(name));
    }

    pub fn add_readiness_gate(&mut self, condition_type: &str) -> bool {
        let mut gates = self.gate_values();
        if gates.iter().any(|g| g.get("conditionType").and_then(Value::as_str) == Some(condition_type)) {
            return false;
        }
        let mut entry = serde_yaml::Mapping::new();
        entry.insert("conditionType".into(), condition_type.into());
        gates.push(Value::Mapping(entry));
        self.obj.set(&["info", "readinessGates"], Value::Sequence(gates));
        true
    }

    /// Remove gates whose condition type satisfies `pred`.
    pub fn retain_readiness_gates(&mut self, mut keep: impl FnMut(&str) -> bool) -> bool {
        let gates = self.gate_values();
        let before = gates.len();
        let kept: Vec<Value> = gates
            .into_iter()
            .filter(|g| g.get("conditionType").and_then(Value::as_str).map(&mut keep).unwrap_or(true))
            .collect();
        if kept.len() == before {
            return false;
        }
        if kept.is_empty() {
            self.obj.remove(&["info", "readinessGates"]);
            self.obj.prune_empty(&["info"]);
        } else {
            self.obj.set(&["info", "readinessGates"], Value::Sequence(kept));
        }
        true
    }

    /// Upsert a condition by type; Kptfile conditions carry no timestamps.
    pub fn set_condition(&mut self, cond: Condition) -> PorchResult<bool> {
        let mut conds = conditions(self.obj)?;
        let cond = Condition { last_transition_time: None, ..cond };
        match conds.iter_mut().find(|c| c.type_ == cond.type_) {
            Some(existing) if *existing == cond => return Ok(false),
            Some(existing) => *existing = cond,
            None => conds.push(cond),
        }
        self.write_conditions(conds)?;
        Ok(true)
    }

    pub fn retain_conditions(&mut self, mut keep: impl FnMut(&Condition) -> bool) -> PorchResult<bool> {
        let conds = conditions(self.obj)?;
        let before = conds.len();
        let kept: Vec<Condition> = conds.into_iter().filter(|c| keep(c)).collect();
        if kept.len() == before {
            return Ok(false);
        }
        self.write_conditions(kept)?;
        Ok(true)
    }

    fn write_conditions(&mut self, conds: Vec<Condition>) -> PorchResult<()> {
        if conds.is_empty() {
            self.obj.remove(&["status", "conditions"]);
            self.obj.prune_empty(&["status"]);
            return Ok(());
        }
        let v = serde_yaml::to_value(&conds).map_err(|e| PorchError::Render(format!("encoding conditions: {e}")))?;
        self.obj.set(&["status", "conditions"], v);
        Ok(())
    }

    fn gate_values(&self) -> Vec<Value> {
        self.obj.get(&["info", "readinessGates"]).and_then(Value::as_sequence).cloned().unwrap_or_default()
    }

    /// Function entries of `pipeline.<list>` (`mutators` or `validators`).
    pub fn functions(&self, list: &str) -> Vec<Value> {
        self.obj.get(&["pipeline", list]).and_then(Value::as_sequence).cloned().unwrap_or_default()
    }

    /// Replace `pipeline.<list>`; an empty list removes the key.
    pub fn set_functions(&mut self, list: &str, functions: Vec<Value>) {
        if functions.is_empty() {
            self.obj.remove(&["pipeline", list]);
            self.obj.prune_empty(&["pipeline"]);
        } else {
            self.obj.set(&["pipeline", list], Value::Sequence(functions));
        }
    }
}
