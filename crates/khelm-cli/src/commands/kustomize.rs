//! Kustomize exec plugin - render the chart described by a generator file

use std::path::Path;
use tokio_util::sync::CancellationToken;

use khelm_core::GeneratorConfig;
use khelm_core::resource::to_yaml_stream;

use crate::error::{CliError, Result};

pub async fn run(generator: &Path, cancel: &CancellationToken, debug: bool) -> Result<()> {
    let generator = if generator.is_absolute() {
        generator.to_path_buf()
    } else {
        std::env::current_dir()?.join(generator)
    };
    let config = GeneratorConfig::load(&generator).map_err(|e| CliError::from_core(e, debug))?;
    tracing::debug!(
        "rendering generator {} from {}",
        config.metadata.name,
        generator.display()
    );

    let resources = super::render(&config.chart, false, cancel, debug).await?;
    let yaml = to_yaml_stream(&resources).map_err(|e| CliError::from_core(e, debug))?;
    print!("{}", yaml);
    Ok(())
}
