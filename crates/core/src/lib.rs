//! xtrack core types: inventory records, snapshot envelope and configuration.

#![forbid(unsafe_code)]

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod config;
pub mod telemetry;

pub use config::{
    parse_gvr, parse_gvrs, parse_namespace_source, ConfigError, ConvertKeys, KeyDefaults,
    NamespaceSourceConfig, TrackerConfig,
};
pub use telemetry::TrackerMetrics;

/// Resource-type identifier: `(group, version, plural resource)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Gvr {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl Gvr {
    pub fn new(group: impl Into<String>, version: impl Into<String>, resource: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), resource: resource.into() }
    }

    /// `group/version`, as used in `apiVersion`.
    pub fn api_version(&self) -> String {
        format!("{}/{}", self.group, self.version)
    }
}

impl fmt::Display for Gvr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.version, self.resource)
    }
}

impl std::str::FromStr for Gvr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_gvr(s)
    }
}

/// Where the configuration that produced a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    #[default]
    Central,
    Namespace,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Central => "central",
            Origin::Namespace => "namespace",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A namespace-scoped claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRecord {
    /// `group/version/resource` of the partition that produced this record.
    pub gvr: String,
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    /// Filled by enrichment from the referenced composite.
    #[serde(default)]
    pub composition: String,
    pub source: Origin,
    pub ready: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// `spec.resourceRef.name`
    #[serde(default)]
    pub xr_ref: String,
}

impl ClaimRecord {
    pub fn key(&self) -> String {
        object_key(&self.namespace, &self.name)
    }
}

/// A cluster-scoped composite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositeRecord {
    pub gvr: String,
    pub group: String,
    pub kind: String,
    /// Informational; usually empty.
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub composition: String,
    pub source: Origin,
    pub ready: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl CompositeRecord {
    pub fn key(&self) -> String {
        object_key(&self.namespace, &self.name)
    }
}

/// Identity key: `name` for cluster-scoped objects, `namespace/name` otherwise.
pub fn object_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", namespace, name)
    }
}

/// Durable envelope written after each successful cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default)]
    pub claims: Vec<ClaimRecord>,
    #[serde(default, alias = "xrs")]
    pub composites: Vec<CompositeRecord>,
    pub persisted_at: DateTime<Utc>,
}

pub mod prelude {
    pub use super::{ClaimRecord, CompositeRecord, Gvr, Origin, Snapshot};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_cluster_scoped_is_name() {
        assert_eq!(object_key("", "xr-1"), "xr-1");
        assert_eq!(object_key("team-a", "db"), "team-a/db");
    }

    #[test]
    fn snapshot_accepts_legacy_xrs_field() {
        let raw = serde_json::json!({
            "claims": [],
            "xrs": [{
                "gvr": "g/v1/xwidgets", "group": "g", "kind": "XWidget", "name": "x1",
                "composition": "prod", "source": "central", "ready": true
            }],
            "persistedAt": "2024-05-01T10:00:00Z"
        });
        let snap: Snapshot = serde_json::from_value(raw).unwrap();
        assert_eq!(snap.composites.len(), 1);
        assert_eq!(snap.composites[0].composition, "prod");
        assert_eq!(snap.composites[0].namespace, "");
    }

    #[test]
    fn origin_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Origin::Namespace).unwrap(), "\"namespace\"");
        assert_eq!(Origin::Central.to_string(), "central");
    }
}
