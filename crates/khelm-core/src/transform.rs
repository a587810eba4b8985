//! Post-processing of rendered manifests
//!
//! The renderer returns one text blob per template file. The transformer
//! decodes each blob into resources and applies, per document:
//!
//! 1. empty documents are dropped
//! 2. exclude selectors drop matching resources
//! 3. include selectors (when configured) drop everything they don't match
//! 4. the namespace policy forces a namespace or records a scope violation
//!
//! Violations and unmatched selectors are collected over the whole pass and
//! reported together by [`ManifestTransformer::finish`].

use indexmap::IndexMap;
use serde::Deserialize;
use std::path::Path;

use crate::config::RendererConfig;
use crate::error::{CoreError, Result};
use crate::kinds::{KindScope, sort_by_install_order};
use crate::resource::{ManifestResource, ResourceId};
use crate::selector::{ResourceMatchers, ResourceSelector};

/// Whether a rendered template is an auxiliary file rather than manifests
///
/// Covers NOTES.txt, `_` partials and output that is only whitespace.
pub fn is_auxiliary_template(name: &str, content: &str) -> bool {
    let file_name = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    file_name.eq_ignore_ascii_case("NOTES.txt")
        || file_name.starts_with('_')
        || content.trim().is_empty()
}

#[derive(Debug)]
pub struct ManifestTransformer {
    force_namespace: Option<String>,
    namespaced_only: bool,
    exclude: ResourceMatchers,
    include: ResourceMatchers,
    violations: Vec<ResourceId>,
}

impl ManifestTransformer {
    pub fn new(
        force_namespace: Option<String>,
        namespaced_only: bool,
        exclude: Vec<ResourceSelector>,
        include: Vec<ResourceSelector>,
    ) -> Self {
        Self {
            force_namespace: force_namespace.filter(|ns| !ns.is_empty()),
            namespaced_only,
            exclude: ResourceMatchers::exclude(exclude),
            include: ResourceMatchers::include(include),
            violations: Vec::new(),
        }
    }

    pub fn from_config(config: &RendererConfig) -> Self {
        Self::new(
            Some(config.force_namespace.clone()),
            config.namespaced_only,
            config.exclude.clone(),
            config.include.clone(),
        )
    }

    /// Decode a multi-document YAML stream rendered from `template`
    pub fn transform_stream(
        &mut self,
        template: &str,
        manifest: &str,
    ) -> Result<Vec<ManifestResource>> {
        let mut out = Vec::new();
        for document in serde_yaml::Deserializer::from_str(manifest) {
            let value = serde_yaml::Value::deserialize(document).map_err(|e| {
                CoreError::ManifestDecode {
                    template: template.to_string(),
                    message: e.to_string(),
                }
            })?;
            let Some(resource) = ManifestResource::from_value(value, template)? else {
                continue;
            };
            if let Some(resource) = self.apply(resource) {
                out.push(resource);
            }
        }
        Ok(out)
    }

    fn apply(&mut self, mut resource: ManifestResource) -> Option<ManifestResource> {
        if self.exclude.matches(resource.id()) {
            tracing::debug!("excluding {}", resource.id());
            return None;
        }
        if !self.include.is_empty() && !self.include.matches(resource.id()) {
            tracing::debug!("{} is not included", resource.id());
            return None;
        }

        let scope = KindScope::of(resource.api_version(), resource.kind());
        match &self.force_namespace {
            Some(namespace) if scope != KindScope::Cluster => {
                resource.set_namespace(namespace);
            }
            _ if self.namespaced_only
                && scope != KindScope::Namespaced
                && resource.namespace().is_none() =>
            {
                self.violations.push(resource.id().clone());
                return None;
            }
            _ => {}
        }
        Some(resource)
    }

    /// Report everything collected during the pass
    pub fn finish(&self) -> Result<()> {
        if !self.violations.is_empty() {
            return Err(CoreError::ClusterScopedResources {
                resources: self.violations.iter().map(ToString::to_string).collect(),
            });
        }
        self.exclude.require_all_matched()?;
        self.include.require_all_matched()?;
        Ok(())
    }

    /// Transform all rendered templates into an install-ordered resource list
    pub fn transform(
        mut self,
        rendered: &IndexMap<String, String>,
    ) -> Result<Vec<ManifestResource>> {
        let mut resources = Vec::new();
        for (template, content) in rendered {
            if is_auxiliary_template(template, content) {
                continue;
            }
            resources.extend(self.transform_stream(template, content)?);
        }
        self.finish()?;
        sort_by_install_order(&mut resources);
        Ok(resources)
    }
}
