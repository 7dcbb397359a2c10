//! Package resources as structured KRM objects.
//!
//! A [`ResourceMap`] is parsed once into per-file documents; mutations act on
//! the documents and [`PackageResources::to_map`] re-serializes only the files
//! whose documents actually changed, so untouched files stay byte-identical.

use std::collections::BTreeMap;

use porch_core::{annotations, PorchError, PorchResult, ResourceMap};
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use smallvec::SmallVec;

/// `(apiVersion, kind, namespace, name)`; documents are matched by this across revisions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectIdentity {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

/// One KRM document held as an untyped YAML tree.
#[derive(Debug, Clone, PartialEq)]
pub struct KubeObject {
    value: Value,
}

impl KubeObject {
    pub fn new(value: Value) -> Self { Self { value } }
    pub fn value(&self) -> &Value { &self.value }
    pub fn into_value(self) -> Value { self.value }

    pub fn api_version(&self) -> &str { self.str_at(&["apiVersion"]).unwrap_or("") }
    pub fn kind(&self) -> &str { self.str_at(&["kind"]).unwrap_or("") }
    pub fn name(&self) -> &str { self.str_at(&["metadata", "name"]).unwrap_or("") }
    pub fn namespace(&self) -> &str { self.str_at(&["metadata", "namespace"]).unwrap_or("") }

    /// `("", "v1")` for core kinds, `("apps", "v1")` otherwise.
    pub fn group_version(&self) -> (&str, &str) {
        split_api_version(self.api_version())
    }

    pub fn identity(&self) -> ObjectIdentity {
        // the Kptfile is renamed on clone; there is only ever one per package
        let name = if self.kind() == crate::kptfile::KPTFILE_KIND { "" } else { self.name() };
        ObjectIdentity {
            api_version: self.api_version().to_string(),
            kind: self.kind().to_string(),
            namespace: self.namespace().to_string(),
            name: name.to_string(),
        }
    }

    pub fn has_identity(&self) -> bool {
        !self.kind().is_empty() && !self.api_version().is_empty()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.get(&["metadata", "annotations"])?.get(key)?.as_str()
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.set(&["metadata", "annotations", key], Value::from(value));
    }

    pub fn is_local_config(&self) -> bool {
        self.annotation(annotations::LOCAL_CONFIG).map(|v| v == "true").unwrap_or(false)
    }

    pub fn get(&self, path: &[&str]) -> Option<&Value> {
        let mut cur = &self.value;
        for key in path {
            cur = cur.get(*key)?;
        }
        Some(cur)
    }

    pub fn str_at(&self, path: &[&str]) -> Option<&str> {
        self.get(path)?.as_str()
    }

    /// Set `value` at `path`, creating (or replacing non-mapping) intermediates.
    pub fn set(&mut self, path: &[&str], value: Value) {
        let Some((last, parents)) = path.split_last() else { return };
        let mut cur = &mut self.value;
        for key in parents {
            if !cur.is_mapping() {
                *cur = Value::Mapping(Mapping::new());
            }
            let Value::Mapping(map) = cur else { return };
            cur = map.entry(Value::from(*key)).or_insert_with(|| Value::Mapping(Mapping::new()));
        }
        if !cur.is_mapping() {
            *cur = Value::Mapping(Mapping::new());
        }
        if let Value::Mapping(map) = cur {
            map.insert(Value::from(*last), value);
        }
    }

    pub fn remove(&mut self, path: &[&str]) -> Option<Value> {
        let (last, parents) = path.split_last()?;
        let mut cur = &mut self.value;
        for key in parents {
            cur = cur.get_mut(*key)?;
        }
        cur.as_mapping_mut()?.remove(*last)
    }

    /// Drop the mapping at `path` if it has become empty.
    pub fn prune_empty(&mut self, path: &[&str]) {
        if self.get(path).and_then(Value::as_mapping).map(Mapping::is_empty).unwrap_or(false) {
            self.remove(path);
        }
    }
}

pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.rsplit_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

#[derive(Debug, Clone)]
struct ResourceFile {
    original: String,
    /// `None` for files that are not YAML.
    docs: Option<Docs>,
}

#[derive(Debug, Clone)]
struct Docs {
    parsed: SmallVec<[Value; 1]>,
    objects: SmallVec<[KubeObject; 1]>,
}

/// A package's files with every YAML document parsed.
#[derive(Debug, Clone, Default)]
pub struct PackageResources {
    files: BTreeMap<String, ResourceFile>,
}

pub fn is_yaml_path(path: &str) -> bool {
    let file = path.rsplit('/').next().unwrap_or(path);
    file == crate::kptfile::KPTFILE || file.ends_with(".yaml") || file.ends_with(".yml")
}

/// Split a multi-document YAML stream; empty documents are skipped.
pub fn parse_documents(text: &str) -> Result<SmallVec<[Value; 1]>, serde_yaml::Error> {
    let mut out = SmallVec::new();
    for de in serde_yaml::Deserializer::from_str(text) {
        let v = Value::deserialize(de)?;
        if !v.is_null() {
            out.push(v);
        }
    }
    Ok(out)
}

pub fn write_documents<'a>(docs: impl IntoIterator<Item = &'a Value>) -> PorchResult<String> {
    let mut parts = Vec::new();
    for doc in docs {
        parts.push(serde_yaml::to_string(doc).map_err(|e| PorchError::Render(format!("serializing document: {e}")))?);
    }
    Ok(parts.join("---\n"))
}

impl PackageResources {
    pub fn parse(map: &ResourceMap) -> PorchResult<Self> {
        let mut files = BTreeMap::new();
        for (path, text) in map {
            let docs = if is_yaml_path(path) {
                let parsed = parse_documents(text).map_err(|e| PorchError::Render(format!("{path}: {e}")))?;
                let objects = parsed.iter().cloned().map(KubeObject::new).collect();
                Some(Docs { parsed, objects })
            } else {
                None
            };
            files.insert(path.clone(), ResourceFile { original: text.clone(), docs });
        }
        Ok(Self { files })
    }

    pub fn contains_file(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Add or replace a whole file.
    pub fn insert_file(&mut self, path: &str, text: String) -> PorchResult<()> {
        let mut single = ResourceMap::new();
        single.insert(path.to_string(), text);
        let parsed = Self::parse(&single)?;
        self.files.extend(parsed.files.into_iter().map(|(p, mut f)| {
            // force a rewrite even if the text matches what was parsed
            f.original.clear();
            (p, f)
        }));
        Ok(())
    }

    pub fn objects(&self) -> impl Iterator<Item = (&str, &KubeObject)> {
        self.files
            .iter()
            .filter_map(|(p, f)| f.docs.as_ref().map(|d| (p, d)))
            .flat_map(|(p, d)| d.objects.iter().map(move |o| (p.as_str(), o)))
    }

    pub fn objects_mut(&mut self) -> impl Iterator<Item = (&str, &mut KubeObject)> {
        self.files
            .iter_mut()
            .filter_map(|(p, f)| f.docs.as_mut().map(|d| (p, d)))
            .flat_map(|(p, d)| d.objects.iter_mut().map(move |o| (p.as_str(), o)))
    }

    pub fn find_mut(&mut self, kind: &str, name: &str) -> Option<&mut KubeObject> {
        self.objects_mut().map(|(_, o)| o).find(|o| o.kind() == kind && o.name() == name)
    }

    pub fn kptfile(&self) -> Option<&KubeObject> {
        let docs = self.files.get(crate::kptfile::KPTFILE)?.docs.as_ref()?;
        docs.objects.iter().find(|o| o.kind() == crate::kptfile::KPTFILE_KIND)
    }

    pub fn kptfile_mut(&mut self) -> Option<&mut KubeObject> {
        let docs = self.files.get_mut(crate::kptfile::KPTFILE)?.docs.as_mut()?;
        docs.objects.iter_mut().find(|o| o.kind() == crate::kptfile::KPTFILE_KIND)
    }

    pub fn is_changed(&self) -> bool {
        self.files.values().any(ResourceFile::is_changed)
    }

    pub fn to_map(&self) -> PorchResult<ResourceMap> {
        let mut out = ResourceMap::new();
        for (path, file) in &self.files {
            let text = match &file.docs {
                Some(docs) if file.is_changed() => write_documents(docs.objects.iter().map(KubeObject::value))?,
                _ => file.original.clone(),
            };
            out.insert(path.clone(), text);
        }
        Ok(out)
    }
}

impl ResourceFile {
    fn is_changed(&self) -> bool {
        match &self.docs {
            Some(d) => {
                self.original.is_empty()
                    || d.parsed.len() != d.objects.len()
                    || d.parsed.iter().zip(d.objects.iter()).any(|(p, o)| p != o.value())
            }
            None => false,
        }
    }
}
