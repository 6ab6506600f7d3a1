//! Listed object -> inventory record.

use kube::core::DynamicObject;
use serde_json::Value;
use xtrack_core::{ClaimRecord, CompositeRecord, ConvertKeys, Gvr};

pub fn claim_from(obj: &DynamicObject, gvr: &Gvr, keys: &ConvertKeys) -> ClaimRecord {
    let (ready, reason) = ready_condition(&obj.data);
    ClaimRecord {
        gvr: gvr.to_string(),
        group: gvr.group.clone(),
        kind: kind_of(obj, gvr),
        namespace: obj.metadata.namespace.clone().unwrap_or_default(),
        name: obj.metadata.name.clone().unwrap_or_default(),
        creator: annotation(obj, keys.creator_annotation_key.as_deref()),
        team: annotation(obj, keys.team_annotation_key.as_deref()),
        // Filled by enrichment.
        composition: String::new(),
        source: keys.origin,
        ready,
        reason,
        created_at: obj.metadata.creation_timestamp.as_ref().map(|t| t.0),
        xr_ref: nested_str(&obj.data, &["spec", "resourceRef", "name"]).unwrap_or_default().to_string(),
    }
}

pub fn composite_from(obj: &DynamicObject, gvr: &Gvr, keys: &ConvertKeys) -> CompositeRecord {
    let (ready, reason) = ready_condition(&obj.data);
    let composition = if keys.composition_label_key.is_empty() {
        String::new()
    } else {
        obj.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(&keys.composition_label_key))
            .cloned()
            .unwrap_or_default()
    };
    CompositeRecord {
        gvr: gvr.to_string(),
        group: gvr.group.clone(),
        kind: kind_of(obj, gvr),
        namespace: obj.metadata.namespace.clone().unwrap_or_default(),
        name: obj.metadata.name.clone().unwrap_or_default(),
        composition,
        source: keys.origin,
        ready,
        reason,
        created_at: obj.metadata.creation_timestamp.as_ref().map(|t| t.0),
    }
}

fn annotation(obj: &DynamicObject, key: Option<&str>) -> Option<String> {
    let key = key.filter(|k| !k.is_empty())?;
    obj.metadata.annotations.as_ref()?.get(key).filter(|v| !v.is_empty()).cloned()
}

/// List responses often omit `kind` on items; fall back to the plural name.
fn kind_of(obj: &DynamicObject, gvr: &Gvr) -> String {
    obj.types
        .as_ref()
        .map(|t| t.kind.clone())
        .filter(|k| !k.is_empty())
        .unwrap_or_else(|| resource_to_kind(&gvr.resource))
}

/// `postgresqlinstances` -> `Postgresqlinstance`. Rough; the server's kind wins when present.
pub fn resource_to_kind(resource: &str) -> String {
    let singular = resource.strip_suffix('s').unwrap_or(resource);
    let mut chars = singular.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// `(ready, reason)` from the `Ready` entry of `status.conditions`.
fn ready_condition(data: &Value) -> (bool, String) {
    let Some(conditions) = data.pointer("/status/conditions").and_then(Value::as_array) else {
        return (false, String::new());
    };
    conditions
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some("Ready"))
        .map(|c| {
            let status = c.get("status").and_then(Value::as_str).unwrap_or("");
            let reason = c.get("reason").and_then(Value::as_str).unwrap_or("");
            (status.eq_ignore_ascii_case("true"), reason.to_string())
        })
        .unwrap_or((false, String::new()))
}

fn nested_str<'a>(v: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter().try_fold(v, |cur, seg| cur.get(seg))?.as_str()
}
