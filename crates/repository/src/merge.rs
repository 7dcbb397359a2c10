//! Structural three-way merge of package resources.
//!
//! Files are merged by content; YAML files are merged per document, with
//! documents matched by [`ObjectIdentity`] and merged key by key. When both
//! sides changed the same scalar, the local (downstream) value wins.

use std::collections::BTreeSet;

use porch_core::{PorchResult, ResourceMap};
use porch_render::resources::{is_yaml_path, parse_documents, write_documents, KubeObject, ObjectIdentity};
use serde_yaml::{Mapping, Value};
use tracing::warn;

/// Merge upstream changes (`base` -> `upstream`) into `local`.
pub fn three_way(base: &ResourceMap, upstream: &ResourceMap, local: &ResourceMap) -> PorchResult<ResourceMap> {
    let paths: BTreeSet<&String> = base.keys().chain(upstream.keys()).chain(local.keys()).collect();
    let mut out = ResourceMap::new();
    for path in paths {
        let (b, u, l) = (base.get(path), upstream.get(path), local.get(path));
        let merged = if l == b {
            u.cloned()
        } else if u == b {
            l.cloned()
        } else {
            match (b, u, l) {
                (b, Some(u), Some(l)) if is_yaml_path(path) => Some(merge_yaml_file(path, b.map(String::as_str).unwrap_or(""), u, l)?),
                _ => {
                    warn!(path = %path, "merge conflict on file; keeping local");
                    l.cloned()
                }
            }
        };
        if let Some(text) = merged {
            out.insert(path.clone(), text);
        }
    }
    Ok(out)
}

fn merge_yaml_file(path: &str, base: &str, upstream: &str, local: &str) -> PorchResult<String> {
    let (Ok(b), Ok(u), Ok(l)) = (parse_documents(base), parse_documents(upstream), parse_documents(local)) else {
        warn!(path = %path, "unparsable YAML in merge; keeping local");
        return Ok(local.to_string());
    };
    let keyed = |docs: &[Value]| -> Vec<(DocKey, Value)> {
        docs.iter().enumerate().map(|(i, v)| (doc_key(v, i), v.clone())).collect()
    };
    let (b, u, l) = (keyed(&b), keyed(&u), keyed(&l));
    let find = |set: &[(DocKey, Value)], k: &DocKey| set.iter().find(|(key, _)| key == k).map(|(_, v)| v.clone());

    // local order first, then documents new in upstream
    let mut order: Vec<DocKey> = l.iter().map(|(k, _)| k.clone()).collect();
    for (k, _) in &u {
        if !order.contains(k) && find(&b, k).is_none() {
            order.push(k.clone());
        }
    }

    let mut merged = Vec::new();
    for k in &order {
        let at = format!("{path}:{k}");
        if let Some(v) = merge_opt(&at, find(&b, k), find(&u, k), find(&l, k)) {
            merged.push(v);
        }
    }
    let original: Vec<Value> = l.into_iter().map(|(_, v)| v).collect();
    if merged == original {
        return Ok(local.to_string());
    }
    write_documents(merged.iter())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DocKey {
    Object(ObjectIdentity),
    Index(usize),
}

impl std::fmt::Display for DocKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DocKey::Object(id) => write!(f, "{}/{}/{}", id.kind, id.namespace, id.name),
            DocKey::Index(i) => write!(f, "#{i}"),
        }
    }
}

fn doc_key(v: &Value, index: usize) -> DocKey {
    let obj = KubeObject::new(v.clone());
    if obj.has_identity() { DocKey::Object(obj.identity()) } else { DocKey::Index(index) }
}

fn merge_opt(at: &str, base: Option<Value>, upstream: Option<Value>, local: Option<Value>) -> Option<Value> {
    if local == base {
        return upstream;
    }
    if upstream == base || upstream == local {
        return local;
    }
    match (base, upstream, local) {
        (base, Some(Value::Mapping(u)), Some(Value::Mapping(l))) => {
            let b = match base {
                Some(Value::Mapping(b)) => b,
                _ => Mapping::new(),
            };
            Some(Value::Mapping(merge_mapping(at, &b, &u, &l)))
        }
        (_, _, local) => {
            warn!(at = %at, "merge conflict; keeping local value");
            local
        }
    }
}

fn merge_mapping(at: &str, base: &Mapping, upstream: &Mapping, local: &Mapping) -> Mapping {
    let mut out = Mapping::new();
    let mut keys: Vec<&Value> = local.keys().collect();
    for k in upstream.keys() {
        if !keys.contains(&k) && !base.contains_key(k) {
            keys.push(k);
        }
    }
    for k in keys {
        let sub = format!("{at}.{}", k.as_str().unwrap_or("?"));
        if let Some(v) = merge_opt(&sub, base.get(k).cloned(), upstream.get(k).cloned(), local.get(k).cloned()) {
            out.insert(k.clone(), v);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> ResourceMap {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    const BASE: &str = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\ndata:\n  a: \"1\"\n  b: \"1\"\n";

    #[test]
    fn upstream_and_local_edits_combine() {
        let up = BASE.replace("a: \"1\"", "a: \"2\"");
        let local = BASE.replace("b: \"1\"", "b: \"local\"");
        let out = three_way(&map(&[("cm.yaml", BASE)]), &map(&[("cm.yaml", &up)]), &map(&[("cm.yaml", &local)])).unwrap();
        let docs = parse_documents(&out["cm.yaml"]).unwrap();
        assert_eq!(docs[0]["data"]["a"], Value::from("2"));
        assert_eq!(docs[0]["data"]["b"], Value::from("local"));
    }

    #[test]
    fn conflicting_scalar_keeps_local() {
        let up = BASE.replace("a: \"1\"", "a: \"up\"");
        let local = BASE.replace("a: \"1\"", "a: \"down\"");
        let out = three_way(&map(&[("cm.yaml", BASE)]), &map(&[("cm.yaml", &up)]), &map(&[("cm.yaml", &local)])).unwrap();
        assert_eq!(parse_documents(&out["cm.yaml"]).unwrap()[0]["data"]["a"], Value::from("down"));
    }

    #[test]
    fn file_level_adds_and_deletes() {
        let base = map(&[("old.yaml", BASE), ("keep.txt", "x")]);
        let up = map(&[("new.yaml", BASE), ("keep.txt", "x")]);
        let local = map(&[("old.yaml", BASE), ("keep.txt", "x"), ("mine.txt", "m")]);
        let out = three_way(&base, &up, &local).unwrap();
        assert!(out.contains_key("new.yaml"));
        assert!(!out.contains_key("old.yaml"));
        assert_eq!(out["mine.txt"], "m");
        assert_eq!(out["keep.txt"], "x");
    }

    #[test]
    fn empty_base_adds_upstream_documents_without_clobbering_local() {
        let local = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: mine\n";
        let out = three_way(&ResourceMap::new(), &map(&[("cm.yaml", BASE)]), &map(&[("cm.yaml", local)])).unwrap();
        let docs = parse_documents(&out["cm.yaml"]).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["metadata"]["name"], Value::from("mine"));
        assert_eq!(docs[1]["metadata"]["name"], Value::from("cfg"));
    }
}
