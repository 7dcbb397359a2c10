//! PackageVariant: derive one downstream package from one upstream revision.

use std::collections::BTreeMap;
use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use crate::{Condition, PorchError};

pub const PACKAGE_VARIANT_FINALIZER: &str = "config.porch.kpt.dev/packagevariants";

/// Package context keys that only the system may set.
pub const RESERVED_CONTEXT_KEYS: [&str; 2] = ["name", "package-path"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdoptionPolicy {
    #[default]
    AdoptNone,
    AdoptExisting,
}

impl FromStr for AdoptionPolicy {
    type Err = PorchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "adoptNone" => Ok(Self::AdoptNone),
            "adoptExisting" => Ok(Self::AdoptExisting),
            other => Err(PorchError::validation(format!(
                "spec.adoptionPolicy field can only be \"adoptNone\" or \"adoptExisting\", got {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeletionPolicy {
    #[default]
    Delete,
    Orphan,
}

impl FromStr for DeletionPolicy {
    type Err = PorchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "delete" => Ok(Self::Delete),
            "orphan" => Ok(Self::Orphan),
            other => Err(PorchError::validation(format!(
                "spec.deletionPolicy can only be \"delete\" or \"orphan\", got {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Upstream {
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub package: String,
    #[serde(default)]
    pub revision: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Downstream {
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub package: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageContext {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_keys: Vec<String>,
}

impl PackageContext {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.remove_keys.is_empty()
    }
}

/// A KRM function entry in a render pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Function {
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config_map: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Pipeline {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validators: Vec<Function>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mutators: Vec<Function>,
}

impl Pipeline {
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty() && self.mutators.is_empty()
    }
}

/// Selects an in-cluster object to inject; GVK fields are optional filters.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectionSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageVariantSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream: Option<Upstream>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downstream: Option<Downstream>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adoption_policy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_policy: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_context: Option<PackageContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<Pipeline>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub injectors: Vec<InjectionSelector>,
}

impl PackageVariantSpec {
    /// Unset means `adoptNone`.
    pub fn adoption_policy(&self) -> Result<AdoptionPolicy, PorchError> {
        self.adoption_policy.as_deref().filter(|s| !s.is_empty()).map(str::parse::<AdoptionPolicy>).unwrap_or(Ok(AdoptionPolicy::default()))
    }

    /// Unset means `delete`.
    pub fn deletion_policy(&self) -> Result<DeletionPolicy, PorchError> {
        self.deletion_policy.as_deref().filter(|s| !s.is_empty()).map(str::parse::<DeletionPolicy>).unwrap_or(Ok(DeletionPolicy::default()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DownstreamTarget {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageVariantStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub downstream_targets: Vec<DownstreamTarget>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PackageVariant {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub spec: PackageVariantSpec,
    #[serde(default)]
    pub status: PackageVariantStatus,
}

impl_resource!(PackageVariant, "config.porch.kpt.dev", "v1alpha1", "PackageVariant", "packagevariants");
