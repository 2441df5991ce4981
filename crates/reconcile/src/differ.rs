//! Backend-service diffing.
//!
//! Scalars are compared field by field, `healthChecks` by serialized value
//! (order matters) and `backends` by the sorted list of group links (order does
//! not). Any other array in the desired record is ignored.

use serde_json::{Map, Value as Json};

fn groups(record: &Json) -> Vec<String> {
    let mut g: Vec<String> = record
        .get("backends")
        .and_then(|b| b.as_array())
        .into_iter()
        .flatten()
        .map(|b| b.get("group").map(|g| g.as_str().map(str::to_string).unwrap_or_else(|| g.to_string())).unwrap_or_default())
        .collect();
    g.sort();
    g
}

/// Names of the desired fields that differ from `existing`.
pub fn changed_fields(desired: &Json, existing: &Json) -> Vec<String> {
    let empty = Map::new();
    let want = desired.as_object().unwrap_or(&empty);
    let mut out: Vec<String> = want
        .iter()
        .filter(|(_, v)| !v.is_array())
        .filter(|(k, v)| existing.get(k.as_str()) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect();
    if desired.get("healthChecks") != existing.get("healthChecks") {
        out.push("healthChecks".into());
    }
    if groups(desired) != groups(existing) {
        out.push("backends".into());
    }
    out
}

/// `None` when `existing` already matches; otherwise `existing` overlaid with
/// every desired field, ready to submit as a full update body.
pub fn backend_update(desired: &Json, existing: &Json) -> Option<Json> {
    if changed_fields(desired, existing).is_empty() {
        return None;
    }
    let mut merged = existing.as_object().cloned().unwrap_or_default();
    if let Some(want) = desired.as_object() {
        for (k, v) in want.iter() {
            merged.insert(k.clone(), v.clone());
        }
    }
    Some(Json::Object(merged))
}
