//! Multi-document YAML manifests: parse, order and apply through the API.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use kube::{Resource, ResourceExt};
use porch_api::{ApiError, PorchApi};
use porch_core::revision::PackageRevisionResources;
use porch_core::{Lifecycle, PackageRevision, PackageVariant, PackageVariantSet, Repository};
use porch_kubehub::MemoryClusterSource;
use serde::Deserialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub enum Manifest {
    Repository(Repository),
    Revision(PackageRevision),
    Resources(PackageRevisionResources),
    Variant(PackageVariant),
    VariantSet(PackageVariantSet),
    /// Anything else goes to the cluster object source.
    Cluster(serde_json::Value),
}

impl Manifest {
    /// Apply order: repositories, then revision content, then the cluster
    /// objects injection reads, then intents.
    fn rank(&self) -> u8 {
        match self {
            Manifest::Repository(_) => 0,
            Manifest::Revision(_) => 1,
            Manifest::Resources(_) => 2,
            Manifest::Cluster(_) => 3,
            Manifest::Variant(_) => 4,
            Manifest::VariantSet(_) => 5,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    pub repositories: usize,
    pub revisions: usize,
    pub variants: usize,
    pub sets: usize,
    pub cluster_objects: usize,
}

fn is<K: Resource<DynamicType = ()>>(api_version: &str, kind: &str) -> bool {
    api_version == K::api_version(&()) && kind == K::kind(&())
}

fn classify(doc: serde_json::Value) -> Result<Manifest> {
    let api_version = doc.get("apiVersion").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let kind = doc.get("kind").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    if kind.is_empty() {
        anyhow::bail!("document has no kind");
    }
    let m = if is::<Repository>(&api_version, &kind) {
        Manifest::Repository(serde_json::from_value(doc)?)
    } else if is::<PackageRevision>(&api_version, &kind) {
        Manifest::Revision(serde_json::from_value(doc)?)
    } else if is::<PackageRevisionResources>(&api_version, &kind) {
        Manifest::Resources(serde_json::from_value(doc)?)
    } else if is::<PackageVariant>(&api_version, &kind) {
        Manifest::Variant(serde_json::from_value(doc)?)
    } else if is::<PackageVariantSet>(&api_version, &kind) {
        Manifest::VariantSet(serde_json::from_value(doc)?)
    } else {
        Manifest::Cluster(doc)
    };
    Ok(m)
}

/// Every non-empty document of `text`, in file order.
pub fn parse(text: &str, source: &str) -> Result<Vec<Manifest>> {
    let mut out = Vec::new();
    for (i, de) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let doc = serde_json::Value::deserialize(de).with_context(|| format!("{source}: document {i}"))?;
        if doc.is_null() {
            continue;
        }
        out.push(classify(doc).with_context(|| format!("{source}: document {i}"))?);
    }
    Ok(out)
}

fn expand(path: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    if path.is_dir() {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(path)
            .with_context(|| format!("reading {}", path.display()))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        entries.sort();
        for p in entries {
            let yaml = p.extension().and_then(|e| e.to_str()).map(|e| e == "yaml" || e == "yml").unwrap_or(false);
            if p.is_dir() || yaml {
                expand(&p, files)?;
            }
        }
    } else {
        files.push(path.to_path_buf());
    }
    Ok(())
}

/// Load files and directories (`*.yaml`/`*.yml`, recursively, sorted by path).
pub fn load(paths: &[PathBuf]) -> Result<Vec<Manifest>> {
    let mut files = Vec::new();
    for p in paths {
        expand(p, &mut files)?;
    }
    let mut out = Vec::new();
    for f in files {
        let text = std::fs::read_to_string(&f).with_context(|| format!("reading {}", f.display()))?;
        let docs = parse(&text, &f.display().to_string())?;
        debug!(file = %f.display(), documents = docs.len(), "manifests loaded");
        out.extend(docs);
    }
    Ok(out)
}

/// Lifecycle moves that take a revision from `from` to `to`.
fn steps(from: Lifecycle, to: Lifecycle) -> Vec<Lifecycle> {
    use Lifecycle::*;
    match (from, to) {
        (a, b) if a == b => vec![],
        (Draft, Published) => vec![Proposed, Published],
        (Draft, DeletionProposed) => vec![Proposed, Published, DeletionProposed],
        (Proposed, DeletionProposed) => vec![Published, DeletionProposed],
        (_, b) => vec![b],
    }
}

async fn promote(api: &dyn PorchApi, namespace: &str, name: &str, to: Lifecycle) -> Result<()> {
    let mut pr = api.get_revision(namespace, name).await?;
    for next in steps(pr.lifecycle(), to) {
        pr.spec.lifecycle = next;
        pr = api.update_revision(pr).await.with_context(|| format!("moving {namespace}/{name} to {next}"))?;
    }
    Ok(())
}

fn namespace_of<K: Resource>(obj: &K) -> String {
    obj.namespace().filter(|n| !n.is_empty()).unwrap_or_else(|| "default".into())
}

/// Apply manifests in dependency order. Existing revisions are left alone;
/// existing variants and sets get the manifest's spec. Cluster objects go
/// to `cluster` when given and are skipped otherwise.
pub async fn apply(api: &dyn PorchApi, cluster: Option<&MemoryClusterSource>, mut manifests: Vec<Manifest>) -> Result<Applied> {
    manifests.sort_by_key(Manifest::rank);
    let mut applied = Applied::default();
    let mut promotions = Vec::new();
    for m in manifests {
        match m {
            Manifest::Repository(repo) => {
                let name = repo.name_any();
                api.apply_repository(repo).await.with_context(|| format!("repository {name}"))?;
                applied.repositories += 1;
            }
            Manifest::Revision(mut pr) => {
                let ns = namespace_of(&pr);
                pr.metadata.namespace = Some(ns.clone());
                let target = pr.lifecycle();
                let created = match api.create_revision(pr.clone()).await {
                    Ok(created) => created,
                    Err(ApiError::AlreadyExists(_)) => {
                        info!(revision = %pr.key(), "revision exists; left as is");
                        continue;
                    }
                    Err(e) => return Err(e).with_context(|| format!("revision {}", pr.key())),
                };
                applied.revisions += 1;
                promotions.push((ns, created.name_any(), target));
            }
            Manifest::Resources(mut res) => {
                let ns = namespace_of(&res);
                let name = res.name_any();
                let current = api.get_resources(&ns, &name).await.with_context(|| format!("resources of {ns}/{name}"))?;
                res.metadata.namespace = Some(ns.clone());
                res.metadata.resource_version = current.metadata.resource_version;
                match api.update_resources(res).await {
                    Ok(_) => {}
                    Err(ApiError::Immutable(m)) => warn!(revision = %format!("{ns}/{name}"), reason = %m, "resources not applied"),
                    Err(e) => return Err(e).with_context(|| format!("resources of {ns}/{name}")),
                }
            }
            Manifest::Cluster(doc) => match cluster {
                Some(c) => {
                    c.apply(doc)?;
                    applied.cluster_objects += 1;
                }
                None => {
                    let kind = doc.get("kind").and_then(|k| k.as_str()).unwrap_or_default().to_string();
                    warn!(kind = %kind, "cluster object skipped; the live cluster is the source");
                }
            },
            Manifest::Variant(pv) => {
                let ns = namespace_of(&pv);
                let name = pv.name_any();
                match api.create_variant(pv.clone()).await {
                    Ok(_) => {}
                    Err(ApiError::AlreadyExists(_)) => {
                        let mut cur = api.get_variant(&ns, &name).await?;
                        cur.spec = pv.spec;
                        api.update_variant(cur).await.with_context(|| format!("package variant {ns}/{name}"))?;
                    }
                    Err(e) => return Err(e).with_context(|| format!("package variant {ns}/{name}")),
                }
                applied.variants += 1;
            }
            Manifest::VariantSet(pvs) => {
                let ns = namespace_of(&pvs);
                let name = pvs.name_any();
                match api.create_variant_set(pvs.clone()).await {
                    Ok(_) => {}
                    Err(ApiError::AlreadyExists(_)) => {
                        let mut cur = api.get_variant_set(&ns, &name).await?;
                        cur.spec = pvs.spec;
                        api.update_variant_set(cur).await.with_context(|| format!("package variant set {ns}/{name}"))?;
                    }
                    Err(e) => return Err(e).with_context(|| format!("package variant set {ns}/{name}")),
                }
                applied.sets += 1;
            }
        }
    }
    // revisions move through their lifecycle once their resources are in
    for (ns, name, to) in promotions {
        promote(api, &ns, &name, to).await?;
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCS: &str = r#"
apiVersion: config.porch.kpt.dev/v1alpha1
kind: PackageVariant
metadata:
  name: foo
spec:
  upstream: {repo: blueprints, package: foo, revision: v1}
  downstream: {repo: deployments, package: foo}
---
apiVersion: config.porch.kpt.dev/v1alpha1
kind: Repository
metadata:
  name: blueprints
spec:
  type: git
  git: {repo: "https://example.com/blueprints.git"}
---
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: env
data:
  region: east
"#;

    #[test]
    fn parses_and_orders_documents() {
        let mut docs = parse(DOCS, "test.yaml").unwrap();
        assert_eq!(docs.len(), 3);
        docs.sort_by_key(Manifest::rank);
        assert!(matches!(&docs[0], Manifest::Repository(r) if r.name_any() == "blueprints"));
        assert!(matches!(&docs[1], Manifest::Cluster(v) if v["kind"] == "ConfigMap"));
        assert!(matches!(&docs[2], Manifest::Variant(pv) if pv.spec.upstream.as_ref().map(|u| u.revision.as_str()) == Some("v1")));
    }

    #[test]
    fn rejects_documents_without_kind() {
        let err = parse("apiVersion: v1\nmetadata: {name: x}\n", "bad.yaml").unwrap_err();
        assert!(format!("{err:#}").contains("bad.yaml: document 0"));
    }

    #[test]
    fn lifecycle_steps() {
        use Lifecycle::*;
        assert!(steps(Draft, Draft).is_empty());
        assert_eq!(steps(Draft, Published), vec![Proposed, Published]);
        assert_eq!(steps(Draft, DeletionProposed), vec![Proposed, Published, DeletionProposed]);
        assert_eq!(steps(Proposed, Draft), vec![Draft]);
    }
}
