//! The chart render pipeline
//!
//! validate config → locate or build the chart → render → transform → sort

use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use khelm_core::{ChartConfig, LoadedChart, ManifestResource, ManifestTransformer, Settings};
use khelm_repo::{
    ChartDownloader, ChartLocator, Getters, IndexFetcher, LocalChartDependencyResolver,
    RepositoryIndexCache,
};

use crate::error::{EngineError, Result};
use crate::jinja::JinjaRenderer;
use crate::renderer::{ReleaseOptions, Renderer};

/// Renders one chart config into an install-ordered list of resources
pub struct ChartRenderer {
    settings: Settings,
    fetcher: Arc<dyn IndexFetcher>,
    downloader: Arc<dyn ChartDownloader>,
    renderer: Box<dyn Renderer>,
}

impl ChartRenderer {
    /// A pipeline with the getters enabled by `settings` and the bundled renderer
    pub fn new(settings: Settings) -> Result<Self> {
        let getters = Arc::new(Getters::new(&settings)?);
        Ok(Self::with_transport(settings, getters.clone(), getters))
    }

    pub fn with_transport(
        settings: Settings,
        fetcher: Arc<dyn IndexFetcher>,
        downloader: Arc<dyn ChartDownloader>,
    ) -> Self {
        Self {
            settings,
            fetcher,
            downloader,
            renderer: Box::new(JinjaRenderer::new()),
        }
    }

    pub fn with_renderer(mut self, renderer: impl Renderer + 'static) -> Self {
        self.renderer = Box::new(renderer);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub async fn render(
        &self,
        config: &ChartConfig,
        cancel: &CancellationToken,
    ) -> Result<Vec<ManifestResource>> {
        let mut config = config.clone();
        config.apply_defaults();
        config.validate()?;

        let chart = self.load_chart(&config, cancel).await?;
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let values = config.load_values()?;
        let release = ReleaseOptions::from_config(&config.renderer);
        tracing::debug!(
            "rendering chart {} {} as release {} in namespace {:?}",
            chart.name(),
            chart.version(),
            release.name,
            release.namespace
        );
        let rendered = self.renderer.render(&chart, &values, &release)?;

        let resources = ManifestTransformer::from_config(&config.renderer)
            .transform(&rendered)
            .map_err(|e| {
                EngineError::from(e).context(format!(
                    "process manifests of chart {} {}",
                    chart.name(),
                    chart.version()
                ))
            })?;
        Ok(resources)
    }

    async fn load_chart(&self, config: &ChartConfig, cancel: &CancellationToken) -> Result<LoadedChart> {
        let loader = &config.loader;
        let mut index = RepositoryIndexCache::new(&self.settings, self.fetcher.clone())?;
        let locator = ChartLocator::new(self.settings.chart_cache_dir(), self.downloader.clone());

        if config.is_local_chart() {
            let path = config.resolve_path(&loader.chart);
            if path.is_dir() {
                return Ok(LocalChartDependencyResolver::new(&mut index, &locator)
                    .load(&path, cancel)
                    .await?);
            }
            return LoadedChart::load(&path)
                .map_err(|e| EngineError::from(e).context(format!("load chart {}", path.display())));
        }

        let keyring = self.keyring(config);
        let resolved = index
            .resolve_chart_version(&loader.chart, &loader.version, &loader.repository, cancel)
            .await?;
        let path = locator.locate(&resolved, keyring.as_deref(), cancel).await?;
        LoadedChart::load(&path).map_err(|e| {
            EngineError::from(e).context(format!(
                "load chart {} {}",
                resolved.chart.name, resolved.chart.version
            ))
        })
    }

    /// Keyring for signature verification; presence is checked by `validate`
    fn keyring(&self, config: &ChartConfig) -> Option<PathBuf> {
        config
            .loader
            .verify
            .then(|| config.resolve_path(&config.loader.keyring))
    }
}
