//! Pipeline mutation: a variant's functions go in front of the package's own,
//! under names that identify the variant so they can be replaced later.

use porch_core::variant::{Function, Pipeline};
use porch_core::{PorchError, PorchResult};
use porch_render::kptfile::{MUTATORS, VALIDATORS};
use porch_render::{KptfileMut, PackageResources};
use serde_yaml::{Mapping, Value};

const NAME_PREFIX: &str = "PackageVariant";

/// `PackageVariant.<pv>.<function>.<index>`
pub fn generated_name(pv: &str, function: &str, index: usize) -> String {
    format!("{NAME_PREFIX}.{pv}.{function}.{index}")
}

/// Function names are dot-free, so the rest after `PackageVariant.<pv>.`
/// must be exactly `<function>.<index>`; a variant named `a` does not
/// claim the entries of `a.b`.
fn is_generated_by(entry: &Value, pv: &str) -> bool {
    let own = format!("{NAME_PREFIX}.{pv}.");
    let Some(rest) = entry.get("name").and_then(Value::as_str).and_then(|n| n.strip_prefix(&own)) else {
        return false;
    };
    match rest.split_once('.') {
        Some((function, index)) => !function.is_empty() && !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}

fn entry(pv: &str, index: usize, f: &Function) -> Value {
    let mut m = Mapping::new();
    m.insert("image".into(), f.image.as_str().into());
    m.insert("name".into(), generated_name(pv, &f.name, index).into());
    if !f.config_map.is_empty() {
        let cm: Mapping = f.config_map.iter().map(|(k, v)| (Value::from(k.as_str()), Value::from(v.as_str()))).collect();
        m.insert("configMap".into(), Value::Mapping(cm));
    }
    Value::Mapping(m)
}

/// Drop this variant's earlier entries and prepend the current ones. Entries
/// added by anyone else keep their order behind ours.
pub fn apply_pipeline(res: &mut PackageResources, pv: &str, pipeline: Option<&Pipeline>) -> PorchResult<()> {
    let empty = Pipeline::default();
    let pipeline = pipeline.unwrap_or(&empty);
    let Some(obj) = res.kptfile_mut() else {
        if pipeline.is_empty() {
            return Ok(());
        }
        return Err(PorchError::validation("package has no Kptfile; cannot apply spec.pipeline"));
    };
    let mut k = KptfileMut::new(obj);
    for (list, functions) in [(VALIDATORS, &pipeline.validators), (MUTATORS, &pipeline.mutators)] {
        let existing = k.functions(list);
        let mut next: Vec<Value> = functions.iter().enumerate().map(|(i, f)| entry(pv, i, f)).collect();
        next.extend(existing.iter().filter(|e| !is_generated_by(e, pv)).cloned());
        if next != existing {
            k.set_functions(list, next);
        }
    }
    Ok(())
}
