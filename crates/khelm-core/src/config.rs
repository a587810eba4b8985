//! Chart render request configuration
//!
//! A `ChartConfig` is built once per invocation, either from CLI flags or
//! from a generator document like:
//!
//! ```yaml
//! apiVersion: khelm.mgoltzsche.github.com/v2
//! kind: ChartRenderer
//! metadata:
//!   name: cert-manager
//! repository: https://charts.jetstack.io
//! chart: cert-manager
//! version: 1.14.x
//! namespace: cert-manager
//! valueFiles:
//! - values.yaml
//! exclude:
//! - kind: Secret
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CoreError, Result};
use crate::selector::ResourceSelector;
use crate::values::Values;

pub const GENERATOR_API_VERSION: &str = "khelm.mgoltzsche.github.com/v2";
pub const GENERATOR_KIND: &str = "ChartRenderer";

/// Where to get the chart from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoaderConfig {
    /// Repository URL, `@alias` or `alias:name`; empty for a local chart
    #[serde(default)]
    pub repository: String,

    /// Chart name within the repository, or a local chart path
    #[serde(default)]
    pub chart: String,

    /// Version or version constraint; empty selects the latest version
    #[serde(default)]
    pub version: String,

    /// Verify the downloaded chart's signature
    #[serde(default)]
    pub verify: bool,

    /// Public key used for verification
    #[serde(default)]
    pub keyring: String,
}

/// How to render and post-process the chart
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RendererConfig {
    /// Release name
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub value_files: Vec<String>,

    /// Inline values, merged after the value files
    #[serde(default)]
    pub values: Values,

    #[serde(default)]
    pub api_versions: Vec<String>,

    #[serde(default)]
    pub kube_version: String,

    #[serde(default)]
    pub exclude: Vec<ResourceSelector>,

    #[serde(default)]
    pub include: Vec<ResourceSelector>,

    /// Fail on cluster-scoped resources
    #[serde(default)]
    pub namespaced_only: bool,

    /// Set this namespace on every namespaced resource
    #[serde(default)]
    pub force_namespace: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChartConfig {
    #[serde(flatten)]
    pub loader: LoaderConfig,

    #[serde(flatten)]
    pub renderer: RendererConfig,

    /// Directory relative paths are resolved against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl ChartConfig {
    /// Fill in derived defaults; call before [`ChartConfig::validate`]
    pub fn apply_defaults(&mut self) {
        if self.renderer.namespace.is_empty() {
            self.renderer.namespace = self.renderer.force_namespace.clone();
        }
        if self.renderer.name.is_empty() {
            self.renderer.name = default_release_name(&self.loader.chart);
        }
    }

    /// Check the configuration before any I/O, reporting every problem at once
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.loader.chart.is_empty() {
            errors.push("chart not specified".to_string());
        }
        if self.loader.verify && self.loader.repository.is_empty() {
            errors.push("verify is only supported for charts from a repository".to_string());
        }
        if self.loader.verify && self.loader.keyring.is_empty() {
            errors.push("verify requires a keyring".to_string());
        }
        if !self.renderer.namespace.is_empty()
            && !self.renderer.force_namespace.is_empty()
            && self.renderer.namespace != self.renderer.force_namespace
        {
            errors.push(format!(
                "namespace {:?} conflicts with forceNamespace {:?}",
                self.renderer.namespace, self.renderer.force_namespace
            ));
        }
        for (i, file) in self.renderer.value_files.iter().enumerate() {
            if file.trim().is_empty() {
                errors.push(format!("valueFiles[{}] is empty", i));
            }
        }
        for (set, selectors) in [
            ("exclude", &self.renderer.exclude),
            ("include", &self.renderer.include),
        ] {
            for (i, selector) in selectors.iter().enumerate() {
                if selector.is_empty() {
                    errors.push(format!("{}[{}] selector has no fields set", set, i));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CoreError::InvalidConfig { errors })
        }
    }

    pub fn is_local_chart(&self) -> bool {
        self.loader.repository.is_empty()
    }

    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.base_dir.join(p)
        }
    }

    /// Merge the value files, in order, followed by the inline values
    pub fn load_values(&self) -> Result<Values> {
        let mut values = Values::new();
        for file in &self.renderer.value_files {
            let path = self.resolve_path(file);
            let file_values = Values::from_file(&path).map_err(|e| CoreError::Values {
                message: format!("{}: {}", path.display(), e),
            })?;
            values.merge(&file_values);
        }
        if !self.renderer.values.is_empty() {
            values.merge(&self.renderer.values);
        }
        Ok(values)
    }
}

fn default_release_name(chart: &str) -> String {
    let base = chart
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    base.strip_suffix(".tgz").unwrap_or(base).to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneratorMetadata {
    #[serde(default)]
    pub name: String,
}

/// A `ChartRenderer` document as used by the kustomize plugin and kpt function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratorConfig {
    pub api_version: String,

    pub kind: String,

    #[serde(default)]
    pub metadata: GeneratorMetadata,

    /// Output file or directory (ending with `/`) for the kpt function
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,

    #[serde(flatten)]
    pub chart: ChartConfig,
}

impl GeneratorConfig {
    pub fn from_yaml(yaml: &str, base_dir: &Path) -> Result<Self> {
        let mut config: GeneratorConfig = serde_yaml::from_str(yaml).map_err(|e| {
            CoreError::InvalidConfig {
                errors: vec![format!("invalid {} document: {}", GENERATOR_KIND, e)],
            }
        })?;
        config.check_type()?;
        config.chart.base_dir = base_dir.to_path_buf();
        if config.chart.renderer.name.is_empty() {
            config.chart.renderer.name = config.metadata.name.clone();
        }
        Ok(config)
    }

    /// Read a generator file; relative paths resolve against its directory
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_yaml(&content, base_dir)
    }

    /// Parse an already decoded document (a kpt `functionConfig`)
    pub fn from_value(value: serde_yaml::Value, base_dir: &Path) -> Result<Self> {
        let yaml = serde_yaml::to_string(&value)?;
        Self::from_yaml(&yaml, base_dir)
    }

    fn check_type(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.api_version != GENERATOR_API_VERSION {
            errors.push(format!(
                "unsupported apiVersion {:?}, expected {:?}",
                self.api_version, GENERATOR_API_VERSION
            ));
        }
        if self.kind != GENERATOR_KIND {
            errors.push(format!(
                "unsupported kind {:?}, expected {:?}",
                self.kind, GENERATOR_KIND
            ));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CoreError::InvalidConfig { errors })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const GENERATOR: &str = r#"
apiVersion: khelm.mgoltzsche.github.com/v2
kind: ChartRenderer
metadata:
  name: my-release
repository: https://charts.example.com
chart: nginx
version: 1.x
forceNamespace: web
valueFiles:
- values/prod.yaml
values:
  replicas: 2
exclude:
- kind: Secret
  name: tls
outputPath: out/
"#;

    #[test]
    fn test_parse_generator() {
        let config = GeneratorConfig::from_yaml(GENERATOR, Path::new("/work")).unwrap();
        assert_eq!(config.output_path.as_deref(), Some("out/"));

        let mut chart = config.chart;
        chart.apply_defaults();
        assert_eq!(chart.loader.repository, "https://charts.example.com");
        assert_eq!(chart.loader.chart, "nginx");
        assert_eq!(chart.loader.version, "1.x");
        assert_eq!(chart.renderer.name, "my-release");
        assert_eq!(chart.renderer.namespace, "web");
        assert_eq!(chart.renderer.exclude[0].kind, "Secret");
        assert_eq!(chart.renderer.values.get("replicas").unwrap(), 2);
        assert_eq!(chart.resolve_path("values/prod.yaml"), Path::new("/work/values/prod.yaml"));
        chart.validate().unwrap();
    }

    #[test]
    fn test_wrong_kind_rejected() {
        let yaml = "apiVersion: v1\nkind: ConfigMap\nchart: x\n";
        let err = GeneratorConfig::from_yaml(yaml, Path::new(".")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        let msg = err.to_string();
        assert!(msg.contains("apiVersion"));
        assert!(msg.contains("kind"));
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let config = ChartConfig {
            loader: LoaderConfig {
                verify: true,
                ..Default::default()
            },
            renderer: RendererConfig {
                namespace: "a".into(),
                force_namespace: "b".into(),
                value_files: vec!["".into()],
                exclude: vec![ResourceSelector::default()],
                ..Default::default()
            },
            ..Default::default()
        };

        match config.validate().unwrap_err() {
            CoreError::InvalidConfig { errors } => {
                assert_eq!(errors.len(), 6, "{:?}", errors);
                assert!(errors[0].contains("chart not specified"));
                assert!(errors.iter().any(|e| e == "verify requires a keyring"));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_defaults() {
        let mut config = ChartConfig {
            loader: LoaderConfig {
                chart: "./charts/my-app/".into(),
                ..Default::default()
            },
            renderer: RendererConfig {
                force_namespace: "ns".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        config.apply_defaults();
        assert_eq!(config.renderer.name, "my-app");
        assert_eq!(config.renderer.namespace, "ns");
        assert!(config.is_local_chart());
        config.validate().unwrap();

        assert_eq!(default_release_name("dist/app-1.0.0.tgz"), "app-1.0.0");
    }

    #[test]
    fn test_load_values_order() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.yaml"), "x: 1\ny: 1\n").unwrap();
        std::fs::write(dir.path().join("b.yaml"), "y: 2\n").unwrap();

        let mut config = ChartConfig {
            base_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        config.renderer.value_files = vec!["a.yaml".into(), "b.yaml".into()];
        config.renderer.values = Values::from_yaml("x: 3\n").unwrap();

        let values = config.load_values().unwrap();
        assert_eq!(values.get("x").unwrap(), 3);
        assert_eq!(values.get("y").unwrap(), 2);
    }
}
