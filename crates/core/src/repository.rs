//! Repository registration objects.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use crate::Condition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryType {
    #[default]
    Git,
    Oci,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum RepositoryContent {
    #[default]
    Package,
    Function,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitSpec {
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub directory: String,
}

fn default_branch() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciSpec {
    pub registry: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySpec {
    #[serde(rename = "type", default)]
    pub type_: RepositoryType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci: Option<OciSpec>,
    #[serde(default)]
    pub content: RepositoryContent,
    /// Packages in deployment repositories are ready to apply to a cluster.
    #[serde(default)]
    pub deployment: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RepositoryStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Repository {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: RepositorySpec,
    #[serde(default)]
    pub status: RepositoryStatus,
}

impl_resource!(Repository, "config.porch.kpt.dev", "v1alpha1", "Repository", "repositories");

impl Repository {
    /// Human-readable backend location (`git:<url>@<branch>` or `oci:<registry>`).
    pub fn location(&self) -> String {
        match self.spec.type_ {
            RepositoryType::Git => match &self.spec.git {
                Some(g) if g.directory.is_empty() => format!("git:{}@{}", g.repo, g.branch),
                Some(g) => format!("git:{}@{}/{}", g.repo, g.branch, g.directory),
                None => "git:(unset)".to_string(),
            },
            RepositoryType::Oci => match &self.spec.oci {
                Some(o) => format!("oci:{}", o.registry),
                None => "oci:(unset)".to_string(),
            },
        }
    }
}
