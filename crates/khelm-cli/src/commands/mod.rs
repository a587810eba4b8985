//! CLI commands

pub mod kpt;
pub mod kustomize;
pub mod template;

use tokio_util::sync::CancellationToken;

use khelm_core::{ChartConfig, ManifestResource, Settings};
use khelm_engine::{ChartRenderer, JinjaRenderer};

use crate::error::{CliError, Result};

/// Render a chart config with settings taken from the environment
///
/// With `strict` set, templates fail on undefined values.
pub async fn render(
    config: &ChartConfig,
    strict: bool,
    cancel: &CancellationToken,
    debug: bool,
) -> Result<Vec<ManifestResource>> {
    let settings = Settings::from_env().map_err(|e| CliError::from_core(e, debug))?;
    tracing::debug!(
        "repository config {}, cache {}",
        settings.repository_config.display(),
        settings.cache_home.display()
    );
    let renderer = ChartRenderer::new(settings)
        .map_err(|e| CliError::from_engine(e, debug))?
        .with_renderer(JinjaRenderer::new().strict(strict));
    renderer
        .render(config, cancel)
        .await
        .map_err(|e| CliError::from_engine(e, debug))
}
