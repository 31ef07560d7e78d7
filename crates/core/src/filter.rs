//! Watch filter: which resource collection to watch, in which namespace, for which function.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Label key the function controller stamps on every object it owns.
pub const FUNCTION_LABEL: &str = "function";

// Kubernetes label value: at most 63 chars, alphanumeric at both ends.
static LABEL_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9])?$").expect("label value regex"));
static NAMESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("namespace regex"));

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FilterError {
    #[error("invalid namespace: {0:?}")]
    Namespace(String),
    #[error("invalid function name for label selector: {0:?}")]
    FunctionName(String),
    #[error("invalid api version: {0:?} (expect v1 or group/v1)")]
    ApiVersion(String),
}

/// Resource collection the watch is opened against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct WatchResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
}

impl WatchResource {
    pub fn deployments() -> Self {
        Self { group: "apps".into(), version: "v1".into(), kind: "Deployment".into(), plural: "deployments".into() }
    }

    /// Build from an `apiVersion` string such as `apps/v1` or `v1`.
    pub fn from_api_version(api_version: &str, kind: &str, plural: &str) -> Result<Self, FilterError> {
        let parts: Vec<_> = api_version.split('/').collect();
        let (group, version) = match parts.as_slice() {
            [version] if !version.is_empty() => (String::new(), (*version).to_string()),
            [group, version] if !group.is_empty() && !version.is_empty() => ((*group).to_string(), (*version).to_string()),
            _ => return Err(FilterError::ApiVersion(api_version.to_string())),
        };
        Ok(Self { group, version, kind: kind.to_string(), plural: plural.to_string() })
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    fn api_prefix(&self) -> String {
        if self.group.is_empty() { format!("/api/{}", self.version) } else { format!("/apis/{}/{}", self.group, self.version) }
    }
}

impl Default for WatchResource {
    fn default() -> Self { Self::deployments() }
}

/// One (namespace, label selector) pair. A subscription is bound to exactly one filter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct WatchFilter {
    pub namespace: String,
    pub function: String,
    pub resource: WatchResource,
}

impl WatchFilter {
    /// Filter selecting the deployments labelled `function=<name>` in `namespace`.
    pub fn for_function(namespace: &str, name: &str) -> Result<Self, FilterError> {
        if !NAMESPACE.is_match(namespace) || namespace.len() > 63 {
            return Err(FilterError::Namespace(namespace.to_string()));
        }
        if name.is_empty() || name.len() > 63 || !LABEL_VALUE.is_match(name) {
            return Err(FilterError::FunctionName(name.to_string()));
        }
        Ok(Self { namespace: namespace.to_string(), function: name.to_string(), resource: WatchResource::deployments() })
    }

    pub fn with_resource(mut self, resource: WatchResource) -> Self {
        self.resource = resource;
        self
    }

    pub fn label_selector(&self) -> String {
        format!("{}={}", FUNCTION_LABEL, self.function)
    }

    pub fn collection_path(&self) -> String {
        format!("{}/namespaces/{}/{}", self.resource.api_prefix(), self.namespace, self.resource.plural)
    }

    /// Path and query of the streaming watch request.
    pub fn watch_url(&self) -> String {
        format!(
            "{}?watch=true&labelSelector={}%3D{}",
            self.collection_path(),
            FUNCTION_LABEL,
            self.function
        )
    }

    /// Stable key, handy for logs and bookkeeping.
    pub fn key(&self) -> String {
        format!("{}|{}", self.namespace, self.label_selector())
    }
}
