//! Decoded Kubernetes resources

use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{CoreError, Result};

/// Identity tuple used for matching, sorting and error reporting
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ResourceId {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.api_version, self.kind, self.name)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Identity {
    #[serde(default)]
    api_version: String,
    #[serde(default)]
    kind: String,
    #[serde(default)]
    metadata: Option<IdentityMetadata>,
}

#[derive(Deserialize, Default)]
struct IdentityMetadata {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: Option<String>,
}

/// A single Kubernetes object decoded from the renderer's output
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestResource {
    object: Mapping,
    id: ResourceId,
    template: String,
}

impl ManifestResource {
    /// Build a resource from one decoded YAML document.
    ///
    /// Returns `None` for empty documents. Documents whose identity metadata
    /// cannot be read fail with an error naming `template`.
    pub fn from_value(value: Value, template: &str) -> Result<Option<Self>> {
        let object = match value {
            Value::Null => return Ok(None),
            Value::Mapping(m) if m.is_empty() => return Ok(None),
            Value::Mapping(m) => m,
            other => {
                return Err(CoreError::ManifestDecode {
                    template: template.to_string(),
                    message: format!("expected a YAML mapping but got {}", type_name(&other)),
                });
            }
        };

        let identity: Identity = serde_yaml::from_value(Value::Mapping(object.clone()))
            .map_err(|e| CoreError::ManifestDecode {
                template: template.to_string(),
                message: e.to_string(),
            })?;
        let metadata = identity.metadata.unwrap_or_default();

        Ok(Some(Self {
            id: ResourceId {
                api_version: identity.api_version,
                kind: identity.kind,
                namespace: metadata.namespace.unwrap_or_default(),
                name: metadata.name,
            },
            object,
            template: template.to_string(),
        }))
    }

    /// Parse a single-document YAML string
    pub fn from_yaml(yaml: &str, template: &str) -> Result<Option<Self>> {
        let Some(document) = serde_yaml::Deserializer::from_str(yaml).next() else {
            return Ok(None);
        };
        let value = Value::deserialize(document).map_err(|e| CoreError::ManifestDecode {
            template: template.to_string(),
            message: e.to_string(),
        })?;
        Self::from_value(value, template)
    }

    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    pub fn api_version(&self) -> &str {
        &self.id.api_version
    }

    pub fn kind(&self) -> &str {
        &self.id.kind
    }

    pub fn name(&self) -> &str {
        &self.id.name
    }

    pub fn namespace(&self) -> Option<&str> {
        Some(self.id.namespace.as_str()).filter(|ns| !ns.is_empty())
    }

    /// Template file the resource was rendered from
    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn set_namespace(&mut self, namespace: &str) {
        let metadata = child_mapping(&mut self.object, "metadata");
        metadata.insert(Value::from("namespace"), Value::from(namespace));
        self.id.namespace = namespace.to_string();
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        self.object
            .get("metadata")
            .and_then(|m| m.get("annotations"))
            .and_then(|a| a.as_mapping())
            .map(|a| {
                a.iter()
                    .filter_map(|(k, v)| Some((k.as_str()?.to_string(), v.as_str()?.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.object
            .get("metadata")
            .and_then(|m| m.get("annotations"))
            .and_then(|a| a.get(key))
            .and_then(|v| v.as_str())
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        let metadata = child_mapping(&mut self.object, "metadata");
        let annotations = child_mapping(metadata, "annotations");
        annotations.insert(Value::from(key), Value::from(value));
    }

    pub fn as_mapping(&self) -> &Mapping {
        &self.object
    }

    pub fn into_value(self) -> Value {
        Value::Mapping(self.object)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.object)?)
    }
}

/// Render resources as a multi-document YAML stream
pub fn to_yaml_stream(resources: &[ManifestResource]) -> Result<String> {
    let mut out = String::new();
    for resource in resources {
        out.push_str("---\n");
        out.push_str(&resource.to_yaml()?);
    }
    Ok(out)
}

/// Get a nested mapping, replacing a missing or non-mapping value
fn child_mapping<'a>(parent: &'a mut Mapping, key: &str) -> &'a mut Mapping {
    let entry = parent
        .entry(Value::from(key))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if !entry.is_mapping() {
        *entry = Value::Mapping(Mapping::new());
    }
    match entry {
        Value::Mapping(m) => m,
        _ => unreachable!("entry was replaced with a mapping"),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a sequence",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_yaml_identity() {
        let res = ManifestResource::from_yaml(
            r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: myconfig
  namespace: apps
data:
  key: value
"#,
            "templates/cm.yaml",
        )
        .unwrap()
        .unwrap();

        assert_eq!(res.api_version(), "v1");
        assert_eq!(res.kind(), "ConfigMap");
        assert_eq!(res.name(), "myconfig");
        assert_eq!(res.namespace(), Some("apps"));
        assert_eq!(res.template(), "templates/cm.yaml");
        assert_eq!(res.id().to_string(), "v1/ConfigMap/myconfig");
    }

    #[test]
    fn test_empty_documents_are_skipped() {
        assert!(ManifestResource::from_yaml("", "t.yaml").unwrap().is_none());
        assert!(ManifestResource::from_yaml("# only a comment\n", "t.yaml").unwrap().is_none());
        assert!(ManifestResource::from_yaml("{}", "t.yaml").unwrap().is_none());
    }

    #[test]
    fn test_invalid_identity_names_template() {
        let err = ManifestResource::from_yaml("kind: [a, b]\n", "templates/broken.yaml").unwrap_err();
        assert!(err.to_string().contains("templates/broken.yaml"));

        let err = ManifestResource::from_yaml("- a\n- b\n", "templates/list.yaml").unwrap_err();
        assert!(err.to_string().contains("templates/list.yaml"));
    }

    #[test]
    fn test_set_namespace_without_metadata() {
        let mut res = ManifestResource::from_yaml("apiVersion: v1\nkind: Secret\n", "t.yaml")
            .unwrap()
            .unwrap();
        assert_eq!(res.namespace(), None);

        res.set_namespace("prod");
        assert_eq!(res.namespace(), Some("prod"));
        assert!(res.to_yaml().unwrap().contains("namespace: prod"));
    }

    #[test]
    fn test_annotations() {
        let mut res = ManifestResource::from_yaml(
            "apiVersion: v1\nkind: Service\nmetadata:\n  name: svc\n  annotations:\n    a: b\n",
            "t.yaml",
        )
        .unwrap()
        .unwrap();

        assert_eq!(res.annotation("a"), Some("b"));
        res.set_annotation("config.kubernetes.io/index", "3");
        assert_eq!(res.annotation("config.kubernetes.io/index"), Some("3"));
        assert_eq!(res.annotations().len(), 2);
    }
}
