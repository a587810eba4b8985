//! kpt function - render into a `ResourceList` read from stdin

use serde::{Deserialize, Serialize};
use std::io::Read;
use tokio_util::sync::CancellationToken;

use khelm_core::{GeneratorConfig, ManifestResource, OutputPathAnnotator};

use crate::error::{CliError, Result};

const RESOURCE_LIST_API_VERSION: &str = "config.kubernetes.io/v1";
const RESOURCE_LIST_KIND: &str = "ResourceList";
const DEFAULT_OUTPUT_PATH: &str = "generated-manifests/";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceList {
    #[serde(default)]
    api_version: String,

    #[serde(default)]
    kind: String,

    #[serde(default)]
    items: Vec<serde_yaml::Value>,

    #[serde(default)]
    function_config: serde_yaml::Value,
}

pub async fn run(cancel: &CancellationToken, debug: bool) -> Result<()> {
    let mut input = String::new();
    std::io::stdin().read_to_string(&mut input)?;
    let output = process(&input, cancel, debug).await?;
    print!("{}", output);
    Ok(())
}

async fn process(input: &str, cancel: &CancellationToken, debug: bool) -> Result<String> {
    let list: ResourceList = serde_yaml::from_str(input)
        .map_err(|e| CliError::input(format!("read {}: {}", RESOURCE_LIST_KIND, e)))?;
    if list.kind != RESOURCE_LIST_KIND {
        return Err(CliError::input(format!(
            "expected kind {} on stdin but got {:?}",
            RESOURCE_LIST_KIND, list.kind
        )));
    }
    if list.function_config.is_null() {
        return Err(CliError::input("no functionConfig specified"));
    }

    let config = GeneratorConfig::from_value(list.function_config.clone(), &std::env::current_dir()?)
        .map_err(|e| CliError::from_core(e, debug))?;
    let output_path = config
        .output_path
        .clone()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| DEFAULT_OUTPUT_PATH.to_string());
    let annotator = OutputPathAnnotator::new(output_path);

    let mut existing = Vec::with_capacity(list.items.len());
    for item in list.items {
        if let Some(resource) =
            ManifestResource::from_value(item, "").map_err(|e| CliError::from_core(e, debug))?
        {
            existing.push(resource);
        }
    }

    let mut generated = super::render(&config.chart, false, cancel, debug).await?;
    annotator.annotate(&mut generated);
    tracing::debug!(
        "generated {} resources for {}",
        generated.len(),
        config.metadata.name
    );

    let items = annotator
        .merge(existing, generated)
        .into_iter()
        .map(ManifestResource::into_value)
        .collect();
    let list = ResourceList {
        api_version: RESOURCE_LIST_API_VERSION.to_string(),
        kind: RESOURCE_LIST_KIND.to_string(),
        items,
        function_config: list.function_config,
    };
    serde_yaml::to_string(&list).map_err(|e| CliError::Io {
        message: format!("write {}: {}", RESOURCE_LIST_KIND, e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit_codes;

    #[tokio::test]
    async fn test_rejects_other_kinds() {
        let cancel = CancellationToken::new();
        let err = process("apiVersion: v1\nkind: ConfigMap\n", &cancel, false)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), exit_codes::USAGE_ERROR);
    }

    #[tokio::test]
    async fn test_requires_function_config() {
        let cancel = CancellationToken::new();
        let input = "apiVersion: config.kubernetes.io/v1\nkind: ResourceList\nitems: []\n";
        let err = process(input, &cancel, false).await.unwrap_err();
        assert!(err.to_string().contains("functionConfig"));
    }
}
