//! fnview core types: the function entity edited by the view, the deployment snapshot
//! observed through the watch stream, and the filter that scopes that stream.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub mod filter;
pub mod snapshot;

pub use filter::{FilterError, WatchFilter, WatchResource};
pub use snapshot::{DecodeError, DeploymentSnapshot, RolloutCondition, RolloutStatus};

/// Identity of the function a view is mounted for.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FunctionTarget {
    pub namespace: String,
    pub name: String,
}

impl FunctionTarget {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for FunctionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FunctionMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, rename = "resourceVersion", skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Function spec. Fields the view does not model are kept in `extra` so an update
/// never drops them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FunctionSpec {
    #[serde(default)]
    pub runtime: String,
    /// Source text shown in the editor.
    #[serde(default)]
    pub function: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub handler: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deps: Option<String>,
    #[serde(default, rename = "function-content-type", skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A serverless function as returned by the function API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FunctionEntity {
    #[serde(default, rename = "apiVersion", skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub metadata: FunctionMeta,
    pub spec: FunctionSpec,
}

impl FunctionEntity {
    pub fn name(&self) -> &str { &self.metadata.name }
    pub fn namespace(&self) -> &str { &self.metadata.namespace }
    pub fn source(&self) -> &str { &self.spec.function }

    pub fn target(&self) -> FunctionTarget {
        FunctionTarget::new(self.metadata.namespace.clone(), self.metadata.name.clone())
    }

    /// Copy of this entity with the source text replaced; every other field is kept.
    pub fn with_source(&self, source: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.spec.function = source.into();
        next
    }
}

pub mod prelude {
    pub use super::{
        DeploymentSnapshot, FunctionEntity, FunctionMeta, FunctionSpec, FunctionTarget, RolloutStatus,
        WatchFilter, WatchResource,
    };
}
