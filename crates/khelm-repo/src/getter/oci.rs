//! OCI registry getter
//!
//! OCI repositories (`oci://registry/path`) have no index: versions are tags
//! of `registry/path/<chart>`, and the chart archive is the Helm content
//! layer of the tag's manifest.

use async_trait::async_trait;
use oci_distribution::Reference;
use oci_distribution::client::{Client, ClientConfig, ClientProtocol};
use oci_distribution::secrets::RegistryAuth;
use tokio_util::sync::CancellationToken;

use super::{Getter, with_cancel};
use crate::error::{RepoError, Result};
use crate::index::{ChartVersion, VersionConstraint, is_version_range, parse_version};
use crate::repositories::RepositoryEntry;

/// Media types for Helm charts in OCI
pub mod media_types {
    pub const HELM_CONFIG: &str = "application/vnd.cncf.helm.config.v1+json";
    pub const HELM_CONTENT: &str = "application/vnd.cncf.helm.chart.content.v1.tar+gzip";
}

pub struct OciGetter {
    client: Client,
}

impl Default for OciGetter {
    fn default() -> Self {
        Self::new()
    }
}

impl OciGetter {
    pub fn new() -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            ..Default::default()
        };
        Self {
            client: Client::new(config),
        }
    }

    fn auth(repo: &RepositoryEntry) -> RegistryAuth {
        match (&repo.username, &repo.password) {
            (Some(user), password) => {
                RegistryAuth::Basic(user.clone(), password.clone().unwrap_or_default())
            }
            _ => RegistryAuth::Anonymous,
        }
    }

    /// Resolve a chart version to a tag and its manifest digest
    pub async fn resolve(
        &self,
        repo: &RepositoryEntry,
        name: &str,
        constraint: &str,
        cancel: &CancellationToken,
    ) -> Result<ChartVersion> {
        with_cancel(cancel, self.resolve_inner(repo, name, constraint)).await
    }

    async fn resolve_inner(
        &self,
        repo: &RepositoryEntry,
        name: &str,
        constraint: &str,
    ) -> Result<ChartVersion> {
        let auth = Self::auth(repo);
        let version = if is_version_range(constraint) {
            let reference = chart_reference(&repo.url, name, "latest")?;
            let tags = self
                .client
                .list_tags(&reference, &auth, None, None)
                .await
                .map_err(|e| RepoError::Oci {
                    message: format!("Failed to list tags of {}: {}", reference, e),
                })?;
            highest_matching_tag(&tags.tags, constraint)?.ok_or_else(|| {
                RepoError::ChartNotFound {
                    name: name.to_string(),
                    version: constraint.to_string(),
                    repo: repo.url.clone(),
                }
            })?
        } else {
            constraint.to_string()
        };

        let reference = chart_reference(&repo.url, name, &version)?;
        let digest = self
            .client
            .fetch_manifest_digest(&reference, &auth)
            .await
            .map_err(|e| {
                let message = e.to_string();
                if message.to_lowercase().contains("not found")
                    || message.to_lowercase().contains("manifest unknown")
                {
                    RepoError::ChartNotFound {
                        name: name.to_string(),
                        version: version.clone(),
                        repo: repo.url.clone(),
                    }
                } else {
                    RepoError::Oci { message }
                }
            })?;

        Ok(ChartVersion {
            name: name.to_string(),
            version: version.clone(),
            urls: vec![format!(
                "{}/{}:{}",
                repo.url.trim_end_matches('/'),
                name,
                version.replace('+', "_")
            )],
            digest: Some(digest),
            ..Default::default()
        })
    }

    async fn pull(&self, url: &str, repo: &RepositoryEntry) -> Result<Vec<u8>> {
        let reference = parse_reference(url)?;
        let image = self
            .client
            .pull(
                &reference,
                &Self::auth(repo),
                vec![media_types::HELM_CONFIG, media_types::HELM_CONTENT],
            )
            .await
            .map_err(|e| RepoError::Oci {
                message: format!("Failed to pull {}: {}", reference, e),
            })?;

        image
            .layers
            .into_iter()
            .find(|l| l.media_type == media_types::HELM_CONTENT)
            .map(|l| l.data)
            .ok_or_else(|| RepoError::Oci {
                message: format!("No chart content layer found in {}", reference),
            })
    }
}

#[async_trait]
impl Getter for OciGetter {
    async fn get(
        &self,
        url: &str,
        repo: &RepositoryEntry,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        with_cancel(cancel, self.pull(url, repo)).await
    }
}

/// `oci://registry/path/name:tag` as a reference
pub fn parse_reference(url: &str) -> Result<Reference> {
    let clean = url.trim_start_matches("oci://");
    Reference::try_from(clean).map_err(|e| RepoError::InvalidRepositoryUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })
}

/// Reference of a chart tag; OCI tags cannot contain `+`
pub fn chart_reference(repo_url: &str, name: &str, version: &str) -> Result<Reference> {
    parse_reference(&format!(
        "{}/{}:{}",
        repo_url.trim_end_matches('/'),
        name,
        version.replace('+', "_")
    ))
}

fn highest_matching_tag(tags: &[String], constraint: &str) -> Result<Option<String>> {
    let constraint = VersionConstraint::parse(constraint)?;
    Ok(tags
        .iter()
        .filter_map(|tag| {
            let version = tag.replace('_', "+");
            parse_version(&version).map(|v| (v, version))
        })
        .filter(|(v, _)| constraint.matches(v))
        .max_by(|a, b| a.0.cmp(&b.0))
        .map(|(_, version)| version))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chart_reference() {
        let reference = chart_reference("oci://ghcr.io/org/charts/", "app", "1.0.0+build.1").unwrap();
        assert_eq!(reference.registry(), "ghcr.io");
        assert_eq!(reference.repository(), "org/charts/app");
        assert_eq!(reference.tag(), Some("1.0.0_build.1"));
    }

    #[test]
    fn test_highest_matching_tag() {
        let tags: Vec<String> = ["0.9.0", "1.0.0", "1.4.2", "2.0.0", "latest", "1.5.0_build.2"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            highest_matching_tag(&tags, "^1.0.0").unwrap().as_deref(),
            Some("1.5.0+build.2")
        );
        assert_eq!(highest_matching_tag(&tags, "").unwrap().as_deref(), Some("2.0.0"));
        assert_eq!(highest_matching_tag(&tags, "3.x").unwrap(), None);
    }
}
