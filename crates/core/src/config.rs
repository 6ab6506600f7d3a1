//! Central configuration, GVR list parsing and per-namespace source parsing.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{Gvr, Origin};

/// Label selecting per-namespace configuration ConfigMaps.
pub const CONFIG_LABEL_KEY: &str = "xp-tracker.kanzi.io/config";
pub const CONFIG_LABEL_VALUE: &str = "gvrs";

pub const DEFAULT_COMPOSITION_LABEL_KEY: &str = "crossplane.io/composition-name";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

// ConfigMap data keys
pub const CLAIM_GVRS_KEY: &str = "CLAIM_GVRS";
pub const XR_GVRS_KEY: &str = "XR_GVRS";
pub const CREATOR_ANNOTATION_KEY: &str = "CREATOR_ANNOTATION_KEY";
pub const TEAM_ANNOTATION_KEY: &str = "TEAM_ANNOTATION_KEY";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("empty GVR list")]
    EmptyGvrList,
    #[error("invalid GVR {0:?}: expected format group/version/resource")]
    GvrFormat(String),
    #[error("invalid GVR {input:?}: segment {segment} is empty")]
    GvrSegment { input: String, segment: usize },
    #[error("invalid {field} in ConfigMap {namespace}/{name}: {source}")]
    NamespaceField {
        field: &'static str,
        namespace: String,
        name: String,
        #[source]
        source: Box<ConfigError>,
    },
    #[error("ConfigMap {namespace}/{name} must specify at least one of CLAIM_GVRS or XR_GVRS")]
    NoGvrs { namespace: String, name: String },
    #[error("poll interval must be a positive number of seconds")]
    PollInterval,
}

/// Parse a single `group/version/resource` entry; segments are trimmed.
pub fn parse_gvr(s: &str) -> Result<Gvr, ConfigError> {
    let segments: Vec<&str> = s.splitn(3, '/').map(str::trim).collect();
    if segments.len() != 3 {
        return Err(ConfigError::GvrFormat(s.to_string()));
    }
    if let Some(idx) = segments.iter().position(|seg| seg.is_empty()) {
        return Err(ConfigError::GvrSegment { input: s.to_string(), segment: idx + 1 });
    }
    Ok(Gvr::new(segments[0], segments[1], segments[2]))
}

/// Parse a comma separated GVR list. Duplicates are dropped (first wins).
pub fn parse_gvrs(raw: &str) -> Result<Vec<Gvr>, ConfigError> {
    let parts = split_and_trim(raw);
    if parts.is_empty() {
        return Err(ConfigError::EmptyGvrList);
    }
    let mut seen = HashSet::with_capacity(parts.len());
    let mut out = Vec::with_capacity(parts.len());
    for p in parts {
        let gvr = parse_gvr(&p)?;
        if !seen.insert(gvr.clone()) {
            warn!(gvr = %gvr, "duplicate GVR ignored");
            continue;
        }
        out.push(gvr);
    }
    Ok(out)
}

/// Split on commas, trim, and drop empty entries.
pub fn split_and_trim(s: &str) -> Vec<String> {
    s.split(',').map(str::trim).filter(|p| !p.is_empty()).map(str::to_string).collect()
}

/// Annotation/label keys used when converting listed objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyDefaults {
    pub creator_annotation_key: Option<String>,
    pub team_annotation_key: Option<String>,
    pub composition_label_key: String,
}

/// Central, statically supplied configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerConfig {
    pub claim_gvrs: Vec<Gvr>,
    pub xr_gvrs: Vec<Gvr>,
    /// Namespace filter for central polling; empty means all namespaces.
    pub namespaces: Vec<String>,
    pub keys: KeyDefaults,
    pub poll_interval: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            claim_gvrs: Vec::new(),
            xr_gvrs: Vec::new(),
            namespaces: Vec::new(),
            keys: KeyDefaults {
                creator_annotation_key: None,
                team_annotation_key: None,
                composition_label_key: DEFAULT_COMPOSITION_LABEL_KEY.to_string(),
            },
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval.is_zero() {
            return Err(ConfigError::PollInterval);
        }
        Ok(())
    }
}

/// Parsed per-namespace configuration discovered from a labeled ConfigMap.
///
/// Claims are polled only within `namespace`; composites are polled cluster-wide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceSourceConfig {
    pub namespace: String,
    pub config_map: String,
    pub claim_gvrs: Vec<Gvr>,
    pub xr_gvrs: Vec<Gvr>,
    /// Already resolved against the central defaults.
    pub creator_annotation_key: Option<String>,
    pub team_annotation_key: Option<String>,
}

impl NamespaceSourceConfig {
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.config_map)
    }

    /// Conversion keys for records listed on behalf of this config. The
    /// composition label key is never overridable per namespace.
    pub fn convert_keys(&self, central: &KeyDefaults) -> ConvertKeys {
        ConvertKeys {
            creator_annotation_key: self.creator_annotation_key.clone(),
            team_annotation_key: self.team_annotation_key.clone(),
            composition_label_key: central.composition_label_key.clone(),
            origin: Origin::Namespace,
        }
    }
}

/// Keys plus origin tag handed to the resource converter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertKeys {
    pub creator_annotation_key: Option<String>,
    pub team_annotation_key: Option<String>,
    pub composition_label_key: String,
    pub origin: Origin,
}

impl ConvertKeys {
    pub fn central(keys: &KeyDefaults) -> Self {
        Self {
            creator_annotation_key: keys.creator_annotation_key.clone(),
            team_annotation_key: keys.team_annotation_key.clone(),
            composition_label_key: keys.composition_label_key.clone(),
            origin: Origin::Central,
        }
    }
}

/// Parse ConfigMap data into a [`NamespaceSourceConfig`]. Annotation keys that
/// are absent or empty inherit from `defaults`.
pub fn parse_namespace_source(
    namespace: &str,
    name: &str,
    data: Option<&BTreeMap<String, String>>,
    defaults: &KeyDefaults,
) -> Result<NamespaceSourceConfig, ConfigError> {
    let empty = BTreeMap::new();
    let data = data.unwrap_or(&empty);
    let non_empty = |k: &str| data.get(k).map(|v| v.trim()).filter(|v| !v.is_empty());

    let field_list = |field: &'static str| -> Result<Vec<Gvr>, ConfigError> {
        match non_empty(field) {
            Some(raw) => parse_gvrs(raw).map_err(|e| ConfigError::NamespaceField {
                field,
                namespace: namespace.to_string(),
                name: name.to_string(),
                source: Box::new(e),
            }),
            None => Ok(Vec::new()),
        }
    };
    let claim_gvrs = field_list(CLAIM_GVRS_KEY)?;
    let xr_gvrs = field_list(XR_GVRS_KEY)?;

    if claim_gvrs.is_empty() && xr_gvrs.is_empty() {
        return Err(ConfigError::NoGvrs { namespace: namespace.to_string(), name: name.to_string() });
    }

    let cfg = NamespaceSourceConfig {
        namespace: namespace.to_string(),
        config_map: name.to_string(),
        claim_gvrs,
        xr_gvrs,
        creator_annotation_key: non_empty(CREATOR_ANNOTATION_KEY)
            .map(str::to_string)
            .or_else(|| defaults.creator_annotation_key.clone()),
        team_annotation_key: non_empty(TEAM_ANNOTATION_KEY)
            .map(str::to_string)
            .or_else(|| defaults.team_annotation_key.clone()),
    };
    info!(
        namespace = %cfg.namespace,
        configmap = %cfg.config_map,
        claim_gvrs = cfg.claim_gvrs.len(),
        xr_gvrs = cfg.xr_gvrs.len(),
        "parsed namespace config"
    );
    Ok(cfg)
}
