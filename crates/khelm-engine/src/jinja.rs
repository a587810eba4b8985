//! MiniJinja based chart renderer
//!
//! Each chart gets its own environment holding all of its template files, so
//! `_` helpers can be imported by name. Templates see:
//!
//! - `values`: chart defaults merged with the values passed down to the chart
//! - `release`: name, namespace, service, revision
//! - `chart`: the chart's `Chart.yaml`
//! - `capabilities`: Kubernetes version and API versions
//! - `template`: name and base path of the template being rendered
//!
//! Sub-charts receive their own section of the parent's values plus `global`.
//! A dependency whose `condition` or `tags` evaluate to false is skipped.

use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;

use khelm_core::chart::ChartDependency;
use khelm_core::{LoadedChart, Values};

use crate::error::{EngineError, Result, TemplateError};
use crate::filters;
use crate::renderer::{Capabilities, ReleaseOptions, RenderedTemplates, Renderer};

#[derive(Debug, Clone, Default)]
pub struct JinjaRenderer {
    strict: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReleaseContext<'a> {
    name: &'a str,
    namespace: &'a str,
    service: &'static str,
    revision: u32,
    is_install: bool,
    is_upgrade: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TemplateContext {
    name: String,
    base_path: String,
}

impl JinjaRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail on undefined values instead of rendering them empty
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    fn environment(&self) -> Environment<'static> {
        let mut env = Environment::new();
        env.set_undefined_behavior(if self.strict {
            UndefinedBehavior::Strict
        } else {
            UndefinedBehavior::Chainable
        });
        env.set_keep_trailing_newline(true);
        filters::register(&mut env);
        env
    }

    fn render_chart(
        &self,
        chart: &LoadedChart,
        overrides: &Values,
        release: &ReleaseContext<'_>,
        capabilities: &Capabilities,
        prefix: &str,
        out: &mut RenderedTemplates,
    ) -> Result<()> {
        let mut values = chart.values.clone();
        values.merge(overrides);

        if chart.metadata().chart_type.as_deref() == Some("library") {
            tracing::debug!("not rendering library chart {}", chart.name());
        } else {
            self.render_templates(chart, &values, release, capabilities, prefix, out)?;
        }

        for subchart in &chart.subcharts {
            let dependency = chart.dependency_for(subchart);
            let scope = dependency
                .map(ChartDependency::effective_name)
                .unwrap_or(subchart.name());
            if let Some(dep) = dependency
                && !is_enabled(dep, &values)
            {
                tracing::debug!("sub-chart {} of {} is disabled", scope, chart.name());
                continue;
            }
            let scoped = values.scope_for_subchart(scope);
            let sub_prefix = format!("{}/charts/{}", prefix, scope);
            self.render_chart(subchart, &scoped, release, capabilities, &sub_prefix, out)?;
        }
        Ok(())
    }

    fn render_templates(
        &self,
        chart: &LoadedChart,
        values: &Values,
        release: &ReleaseContext<'_>,
        capabilities: &Capabilities,
        prefix: &str,
        out: &mut RenderedTemplates,
    ) -> Result<()> {
        let templates_dir = chart.templates_dir();
        let mut env = self.environment();
        let mut sources = Vec::new();

        for path in chart.template_files()? {
            let rel = path
                .strip_prefix(&templates_dir)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            let source = std::fs::read_to_string(&path)?;
            let full_name = format!("{}/templates/{}", prefix, rel);
            env.add_template_owned(rel.clone(), source.clone())
                .map_err(|e| TemplateError::from_minijinja(&e, &full_name, &source))?;
            sources.push((rel, full_name, source));
        }

        for (rel, full_name, source) in sources {
            let file_name = rel.rsplit('/').next().unwrap_or(&rel);
            if file_name.starts_with('_') {
                continue;
            }
            let ctx = minijinja::context! {
                values => values,
                release => release,
                chart => chart.metadata(),
                capabilities => capabilities,
                template => TemplateContext {
                    name: full_name.clone(),
                    base_path: format!("{}/templates", prefix),
                },
            };
            let rendered = env
                .get_template(&rel)
                .and_then(|t| t.render(ctx))
                .map_err(|e| TemplateError::from_minijinja(&e, &full_name, &source))?;
            out.insert(full_name, rendered);
        }
        Ok(())
    }
}

impl Renderer for JinjaRenderer {
    fn render(
        &self,
        chart: &LoadedChart,
        values: &Values,
        release: &ReleaseOptions,
    ) -> Result<RenderedTemplates> {
        let release_ctx = ReleaseContext {
            name: &release.name,
            namespace: &release.namespace,
            service: "Helm",
            revision: 1,
            is_install: true,
            is_upgrade: false,
        };
        let mut out = RenderedTemplates::new();
        self.render_chart(
            chart,
            values,
            &release_ctx,
            &release.capabilities(),
            chart.name(),
            &mut out,
        )
        .map_err(|e| match e {
            e @ EngineError::Template(_) => e,
            e => e.context(format!("render chart {} {}", chart.name(), chart.version())),
        })?;
        Ok(out)
    }
}

/// Whether a dependency is enabled by the parent's values
///
/// A condition that resolves to a boolean wins over tags. Without one, the
/// dependency is enabled when any of its tags is true or none is set.
fn is_enabled(dep: &ChartDependency, values: &Values) -> bool {
    if let Some(enabled) = dep.condition.as_deref().and_then(|c| values.condition(c)) {
        return enabled;
    }
    let tags: Vec<bool> = dep
        .tags
        .iter()
        .filter_map(|tag| values.get(&format!("tags.{}", tag)).and_then(|v| v.as_bool()))
        .collect();
    tags.is_empty() || tags.contains(&true)
}
