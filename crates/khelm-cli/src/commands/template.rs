//! Template command - render a chart like `helm template`

use clap::Args;
use console::style;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use khelm_core::resource::to_yaml_stream;
use khelm_core::values::parse_set_values;
use khelm_core::{ChartConfig, ManifestResource, OutputPathAnnotator, ResourceSelector};

use crate::error::{CliError, Result};

#[derive(Args, Debug)]
pub struct TemplateArgs {
    /// Chart name within the repository, or path to a local chart directory or archive
    pub chart: String,

    /// Repository URL or @alias of a registered repository
    #[arg(long = "repo", env = "KHELM_REPO")]
    pub repository: Option<String>,

    /// Chart version or constraint (latest when empty)
    #[arg(long)]
    pub version: Option<String>,

    /// Verify the chart signature
    #[arg(long)]
    pub verify: bool,

    /// Public key to verify the chart signature with
    #[arg(long)]
    pub keyring: Option<String>,

    /// Release name (defaults to the chart name)
    #[arg(long)]
    pub name: Option<String>,

    /// Release namespace
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Values file(s) to merge, in order
    #[arg(short = 'f', long = "values")]
    pub value_files: Vec<String>,

    /// Set values on the command line (key=value)
    #[arg(long = "set")]
    pub set: Vec<String>,

    /// Kubernetes API versions reported to templates
    #[arg(short = 'a', long = "api-versions", value_delimiter = ',')]
    pub api_versions: Vec<String>,

    /// Kubernetes version reported to templates
    #[arg(long)]
    pub kube_version: Option<String>,

    /// Drop resources matching apiVersion/kind/namespace/name (empty fields match any)
    #[arg(long)]
    pub exclude: Vec<String>,

    /// Keep only resources matching apiVersion/kind/namespace/name
    #[arg(long)]
    pub include: Vec<String>,

    /// Fail on cluster-scoped resources
    #[arg(long)]
    pub namespaced_only: bool,

    /// Set this namespace on all namespaced resources
    #[arg(long)]
    pub force_namespace: Option<String>,

    /// Fail on undefined template values
    #[arg(long)]
    pub strict: bool,

    /// Output file, or directory when ending with `/` (defaults to stdout)
    #[arg(short, long)]
    pub output: Option<String>,
}

impl TemplateArgs {
    pub fn to_config(&self, base_dir: PathBuf, debug: bool) -> Result<ChartConfig> {
        let selectors = |specs: &[String]| -> Result<Vec<ResourceSelector>> {
            specs
                .iter()
                .map(|s| ResourceSelector::parse(s).map_err(|e| CliError::from_core(e, debug)))
                .collect()
        };

        let mut config = ChartConfig {
            base_dir,
            ..Default::default()
        };
        config.loader.chart = self.chart.clone();
        config.loader.repository = self.repository.clone().unwrap_or_default();
        config.loader.version = self.version.clone().unwrap_or_default();
        config.loader.verify = self.verify;
        config.loader.keyring = self.keyring.clone().unwrap_or_default();

        let renderer = &mut config.renderer;
        renderer.name = self.name.clone().unwrap_or_default();
        renderer.namespace = self.namespace.clone().unwrap_or_default();
        renderer.value_files = self.value_files.clone();
        renderer.api_versions = self.api_versions.clone();
        renderer.kube_version = self.kube_version.clone().unwrap_or_default();
        renderer.exclude = selectors(&self.exclude)?;
        renderer.include = selectors(&self.include)?;
        renderer.namespaced_only = self.namespaced_only;
        renderer.force_namespace = self.force_namespace.clone().unwrap_or_default();
        if !self.set.is_empty() {
            renderer.values = parse_set_values(&self.set).map_err(|e| CliError::from_core(e, debug))?;
        }
        Ok(config)
    }
}

pub async fn run(args: TemplateArgs, cancel: &CancellationToken, debug: bool) -> Result<()> {
    let config = args.to_config(std::env::current_dir()?, debug)?;
    let resources = super::render(&config, args.strict, cancel, debug).await?;

    match &args.output {
        None => {
            let yaml = to_yaml_stream(&resources).map_err(|e| CliError::from_core(e, debug))?;
            print!("{}", yaml);
        }
        Some(output) => {
            write_output(output, &resources, debug)?;
            eprintln!(
                "{} Wrote {} resources to {}",
                style("✓").green().bold(),
                resources.len(),
                output
            );
        }
    }
    Ok(())
}

/// Write resources to a file, or one file per resource below a directory
fn write_output(output: &str, resources: &[ManifestResource], debug: bool) -> Result<()> {
    let annotator = OutputPathAnnotator::new(output);
    let mut files: BTreeMap<String, Vec<ManifestResource>> = BTreeMap::new();
    for resource in resources {
        files
            .entry(annotator.path_for(resource))
            .or_default()
            .push(resource.clone());
    }

    for (path, resources) in files {
        let path = Path::new(&path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let yaml = to_yaml_stream(&resources).map_err(|e| CliError::from_core(e, debug))?;
        std::fs::write(path, yaml)?;
        tracing::debug!("wrote {}", path.display());
    }
    Ok(())
}
