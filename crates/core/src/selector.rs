//! Label selector evaluation (matchLabels + matchExpressions).

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

use crate::{PorchError, PorchResult};

/// An empty selector matches everything.
pub fn labels_match(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> PorchResult<bool> {
    if let Some(ml) = &selector.match_labels {
        if ml.iter().any(|(k, v)| labels.get(k) != Some(v)) {
            return Ok(false);
        }
    }
    for req in selector.match_expressions.iter().flatten() {
        if !requirement_matches(req, labels)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn requirement_matches(req: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> PorchResult<bool> {
    let values = req.values.as_deref().unwrap_or(&[]);
    let current = labels.get(&req.key);
    match req.operator.as_str() {
        "In" => Ok(current.map(|v| values.contains(v)).unwrap_or(false)),
        "NotIn" => Ok(current.map(|v| !values.contains(v)).unwrap_or(true)),
        "Exists" => Ok(current.is_some()),
        "DoesNotExist" => Ok(current.is_none()),
        other => Err(PorchError::validation(format!("unsupported label selector operator {other:?}"))),
    }
}
