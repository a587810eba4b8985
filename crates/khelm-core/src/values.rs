//! Chart values with deep merge support

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::path::Path;

use crate::error::{CoreError, Result};

/// Values container with deep merge capability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Values(pub JsonValue);

impl Values {
    pub fn new() -> Self {
        Self(JsonValue::Object(serde_json::Map::new()))
    }

    /// Load values from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse values from a YAML string; an empty document yields empty values
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let Some(document) = serde_yaml::Deserializer::from_str(yaml).next() else {
            return Ok(Self::new());
        };
        match JsonValue::deserialize(document)? {
            JsonValue::Null => Ok(Self::new()),
            v @ JsonValue::Object(_) => Ok(Self(v)),
            _ => Err(CoreError::Values {
                message: "values must be a YAML mapping".to_string(),
            }),
        }
    }

    /// Deep merge `overlay` into these values
    ///
    /// Objects merge recursively; scalars and arrays are replaced.
    pub fn merge(&mut self, overlay: &Values) {
        deep_merge(&mut self.0, &overlay.0);
    }

    /// Set a value by dotted path (e.g. "image.tag")
    pub fn set(&mut self, path: &str, value: JsonValue) {
        let parts: Vec<&str> = path.split('.').collect();
        set_nested(&mut self.0, &parts, value);
    }

    /// Get a value by dotted path
    pub fn get(&self, path: &str) -> Option<&JsonValue> {
        path.split('.')
            .try_fold(&self.0, |current, key| current.get(key))
    }

    pub fn inner(&self) -> &JsonValue {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        match &self.0 {
            JsonValue::Object(map) => map.is_empty(),
            JsonValue::Null => true,
            _ => false,
        }
    }

    /// Values seen by a sub-chart: its own section plus `global`
    pub fn scope_for_subchart(&self, subchart_name: &str) -> Values {
        let mut scoped = serde_json::Map::new();

        if let JsonValue::Object(parent) = &self.0 {
            if let Some(JsonValue::Object(own)) = parent.get(subchart_name) {
                scoped.extend(own.clone());
            }
            if let Some(global) = parent.get("global") {
                scoped.insert("global".to_string(), global.clone());
            }
        }

        Values(JsonValue::Object(scoped))
    }

    /// Evaluate a dot-path condition such as `redis.enabled`
    ///
    /// Multiple comma-separated paths are checked in order; the first one
    /// present decides. Returns `None` when no path is present.
    pub fn condition(&self, condition: &str) -> Option<bool> {
        condition
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .find_map(|path| self.get(path).and_then(JsonValue::as_bool))
    }
}

fn deep_merge(base: &mut JsonValue, overlay: &JsonValue) {
    match (base, overlay) {
        (JsonValue::Object(base_map), JsonValue::Object(overlay_map)) => {
            for (key, overlay_value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => {
                        base_map.insert(key.clone(), overlay_value.clone());
                    }
                }
            }
        }
        (base, overlay) => {
            *base = overlay.clone();
        }
    }
}

fn set_nested(value: &mut JsonValue, path: &[&str], new_value: JsonValue) {
    let Some((key, remaining)) = path.split_first() else {
        *value = new_value;
        return;
    };

    if !value.is_object() {
        *value = JsonValue::Object(serde_json::Map::new());
    }
    if let JsonValue::Object(map) = value {
        let entry = map
            .entry(key.to_string())
            .or_insert_with(|| JsonValue::Object(serde_json::Map::new()));
        set_nested(entry, remaining, new_value);
    }
}

/// Parse `--set key=value` arguments
pub fn parse_set_values(set_args: &[String]) -> Result<Values> {
    let mut values = Values::new();

    for arg in set_args {
        let (key, val) = arg.split_once('=').ok_or_else(|| CoreError::Values {
            message: format!("Invalid --set format: '{}'. Expected key=value", arg),
        })?;

        let json_value = match val {
            "true" => JsonValue::Bool(true),
            "false" => JsonValue::Bool(false),
            "null" => JsonValue::Null,
            _ => match val.parse::<i64>() {
                Ok(num) => JsonValue::Number(num.into()),
                Err(_) => JsonValue::String(val.to_string()),
            },
        };

        values.set(key, json_value);
    }

    Ok(values)
}
