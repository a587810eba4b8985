//! The template renderer seam

use indexmap::IndexMap;
use serde::Serialize;

use khelm_core::config::RendererConfig;
use khelm_core::{LoadedChart, Values};

use crate::error::Result;

/// Kubernetes version reported to templates unless configured
pub const DEFAULT_KUBE_VERSION: &str = "v1.30.0";

/// Rendered text by template path, e.g. `app/templates/deployment.yaml`
pub type RenderedTemplates = IndexMap<String, String>;

/// Release information handed to the renderer
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseOptions {
    pub name: String,
    pub namespace: String,
    pub api_versions: Vec<String>,
    pub kube_version: String,
}

impl ReleaseOptions {
    pub fn from_config(config: &RendererConfig) -> Self {
        Self {
            name: config.name.clone(),
            namespace: config.namespace.clone(),
            api_versions: config.api_versions.clone(),
            kube_version: config.kube_version.clone(),
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        let version = if self.kube_version.is_empty() {
            DEFAULT_KUBE_VERSION.to_string()
        } else if self.kube_version.starts_with('v') {
            self.kube_version.clone()
        } else {
            format!("v{}", self.kube_version)
        };
        let mut parts = version.trim_start_matches('v').split('.');
        let major = parts.next().unwrap_or_default().to_string();
        let minor = parts.next().unwrap_or_default().to_string();

        let mut api_versions = vec!["v1".to_string()];
        api_versions.extend(self.api_versions.iter().cloned());
        Capabilities {
            kube_version: KubeVersion {
                version,
                major,
                minor,
            },
            api_versions,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub kube_version: KubeVersion,
    pub api_versions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KubeVersion {
    pub version: String,
    pub major: String,
    pub minor: String,
}

/// Converts a chart and its values into rendered manifest text
///
/// `values` are the user supplied values; chart defaults are applied by the
/// renderer.
pub trait Renderer: Send + Sync {
    fn render(
        &self,
        chart: &LoadedChart,
        values: &Values,
        release: &ReleaseOptions,
    ) -> Result<RenderedTemplates>;
}
