//! User-defined server tags (`tag` mixin)

use crate::Result;
use fleet_config::interpolate::interpolate;
use indexmap::IndexMap;
use serde_json::Value;
use std::collections::HashMap;

/// Interpolate every tag value; non-string values are stringified
pub fn resolve_tags(data: &Value, vars: &HashMap<String, String>) -> Result<IndexMap<String, String>> {
    let Some(map) = data.as_object() else {
        return Ok(IndexMap::new());
    };
    map.iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(key, value)| {
            let raw = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Ok((key.clone(), interpolate(&raw, vars)?))
        })
        .collect()
}
