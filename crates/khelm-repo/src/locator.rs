//! Chart download with a content-addressed cache
//!
//! A resolved chart version is cached at
//! `<chart cache>/<repo host>/<repo path>/<name>-<version>-<digest[..16]>.tgz`,
//! so a changed archive behind the same version never hits a stale entry.

use minisign::{PublicKeyBox, SignatureBox};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

use khelm_core::archive;

use crate::error::{RepoError, Result, ResultExt};
use crate::getter::ChartDownloader;
use crate::getter::http::write_atomic;
use crate::index_cache::ResolvedChart;

const DIGEST_KEY_LEN: usize = 16;
const SIGNATURE_SUFFIX: &str = ".minisig";

pub struct ChartLocator {
    cache_dir: PathBuf,
    downloader: Arc<dyn ChartDownloader>,
}

impl ChartLocator {
    pub fn new(cache_dir: PathBuf, downloader: Arc<dyn ChartDownloader>) -> Self {
        Self {
            cache_dir,
            downloader,
        }
    }

    /// Cache file of a resolved chart
    ///
    /// Fails when the chart has no digest of at least 16 hex characters.
    pub fn cache_path(&self, resolved: &ResolvedChart) -> Result<PathBuf> {
        let chart = &resolved.chart;
        let digest = archive::normalize_digest(chart.digest.as_deref().unwrap_or_default());
        let key = digest.get(..DIGEST_KEY_LEN).filter(|k| k.chars().all(|c| c.is_ascii_hexdigit()));
        let Some(key) = key else {
            return Err(RepoError::InvalidDigest {
                name: chart.name.clone(),
                version: chart.version.clone(),
                digest: chart.digest.clone().unwrap_or_default(),
            });
        };

        let repo_url = Url::parse(&resolved.repository.url).map_err(|e| {
            RepoError::InvalidRepositoryUrl {
                url: resolved.repository.url.clone(),
                reason: e.to_string(),
            }
        })?;

        let mut path = self.cache_dir.join(sanitize(repo_url.host_str().unwrap_or("local")));
        for segment in repo_url.path().split('/').filter(|s| !s.is_empty() && *s != "..") {
            path.push(sanitize(segment));
        }
        path.push(format!(
            "{}-{}-{}.tgz",
            sanitize(&chart.name),
            sanitize(&chart.version),
            key
        ));
        Ok(path)
    }

    /// Return the local path of a chart archive, downloading it if necessary
    ///
    /// With a keyring the archive's `.minisig` signature is verified, both
    /// for fresh downloads and cache hits.
    pub async fn locate(
        &self,
        resolved: &ResolvedChart,
        keyring: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let chart = &resolved.chart;
        let path = self.cache_path(resolved)?;
        let sig_path = signature_path(&path);

        if path.is_file() {
            tracing::debug!("chart cache hit for {} {}", chart.name, chart.version);
            if let Some(keyring) = keyring {
                let data = std::fs::read(&path)?;
                let signature = match std::fs::read_to_string(&sig_path) {
                    Ok(s) => s,
                    Err(_) => {
                        let sig = self.download_signature(resolved, cancel).await?;
                        write_atomic(&sig_path, sig.as_bytes())?;
                        sig
                    }
                };
                verify_signature(&chart.name, &data, &signature, keyring)?;
            }
            return Ok(path);
        }

        let url = self.download_url(resolved)?;
        tracing::info!("downloading chart {} {} from {}", chart.name, chart.version, url);
        let data = self
            .downloader
            .download(&url, &resolved.repository, cancel)
            .await
            .with_context(|| format!("download chart {} {}", chart.name, chart.version))?;

        // OCI digests address the manifest, not the archive
        if !resolved.repository.is_oci() {
            let expected = chart.digest.as_deref().unwrap_or_default();
            let actual = archive::sha256_digest(&data);
            if !archive::digest_matches(expected, &actual) {
                return Err(RepoError::IntegrityCheckFailed {
                    name: format!("{} {}", chart.name, chart.version),
                    expected: expected.to_string(),
                    actual,
                });
            }
        }

        if let Some(keyring) = keyring {
            let signature = self.download_signature(resolved, cancel).await?;
            verify_signature(&chart.name, &data, &signature, keyring)?;
            write_atomic(&sig_path, signature.as_bytes())?;
        }

        write_atomic(&path, &data)?;
        tracing::debug!("cached chart {} {} at {}", chart.name, chart.version, path.display());
        Ok(path)
    }

    fn download_url(&self, resolved: &ResolvedChart) -> Result<String> {
        let url = resolved.chart.urls.first().ok_or_else(|| RepoError::ChartNotFound {
            name: resolved.chart.name.clone(),
            version: resolved.chart.version.clone(),
            repo: resolved.repository.url.clone(),
        })?;
        resolve_chart_url(&resolved.repository.url, url)
    }

    async fn download_signature(
        &self,
        resolved: &ResolvedChart,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let url = format!("{}{}", self.download_url(resolved)?, SIGNATURE_SUFFIX);
        let data = self
            .downloader
            .download(&url, &resolved.repository, cancel)
            .await
            .with_context(|| {
                format!(
                    "download signature of chart {} {}",
                    resolved.chart.name, resolved.chart.version
                )
            })?;
        String::from_utf8(data).map_err(|e| RepoError::SignatureVerification {
            name: resolved.chart.name.clone(),
            message: e.to_string(),
        })
    }
}

fn signature_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(SIGNATURE_SUFFIX);
    PathBuf::from(name)
}

fn sanitize(segment: &str) -> String {
    segment.replace(['\\', ':', '/'], "_")
}

/// Resolve a chart URL from an index against the repository URL
pub fn resolve_chart_url(repo_url: &str, chart_url: &str) -> Result<String> {
    if chart_url.contains("://") {
        return Ok(chart_url.to_string());
    }
    let base = format!("{}/", repo_url.trim_end_matches('/'));
    let base = Url::parse(&base).map_err(|e| RepoError::InvalidRepositoryUrl {
        url: repo_url.to_string(),
        reason: e.to_string(),
    })?;
    Ok(base.join(chart_url)?.to_string())
}

/// Verify a minisign signature with the public key in `keyring`
pub fn verify_signature(name: &str, data: &[u8], signature: &str, keyring: &Path) -> Result<()> {
    let fail = |message: String| RepoError::SignatureVerification {
        name: name.to_string(),
        message,
    };

    let pk_content = std::fs::read_to_string(keyring)
        .map_err(|e| fail(format!("read public key {}: {}", keyring.display(), e)))?;
    let pk = PublicKeyBox::from_string(&pk_content)
        .and_then(|b| b.into_public_key())
        .map_err(|e| fail(format!("invalid public key {}: {}", keyring.display(), e)))?;
    let sig_box =
        SignatureBox::from_string(signature).map_err(|e| fail(format!("invalid signature: {}", e)))?;

    let mut cursor = Cursor::new(data);
    minisign::verify(&pk, &sig_box, &mut cursor, true, false, false)
        .map_err(|e| fail(e.to_string()))?;
    tracing::debug!("verified signature of {}", name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ChartVersion;
    use crate::repositories::RepositoryEntry;
    use async_trait::async_trait;
    use khelm_core::ErrorKind;
    use minisign::KeyPair;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeDownloader {
        files: HashMap<String, Vec<u8>>,
        requests: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChartDownloader for FakeDownloader {
        async fn download(
            &self,
            url: &str,
            _repo: &RepositoryEntry,
            _cancel: &CancellationToken,
        ) -> Result<Vec<u8>> {
            self.requests.lock().unwrap().push(url.to_string());
            self.files.get(url).cloned().ok_or_else(|| RepoError::Http {
                status: 404,
                url: url.to_string(),
            })
        }
    }

    fn resolved(data: &[u8], url: &str) -> ResolvedChart {
        ResolvedChart {
            repository: RepositoryEntry::synthesize("https://charts.example.com/stable"),
            chart: ChartVersion {
                name: "app".into(),
                version: "1.0.0".into(),
                urls: vec![url.into()],
                digest: Some(archive::sha256_digest(data)),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_cache_path() {
        let locator = ChartLocator::new("/cache".into(), Arc::new(FakeDownloader::default()));
        let mut chart = resolved(b"x", "app-1.0.0.tgz");
        chart.chart.digest = Some("sha256:0123456789abcdef0123".into());
        assert_eq!(
            locator.cache_path(&chart).unwrap(),
            Path::new("/cache/charts.example.com/stable/app-1.0.0-0123456789abcdef.tgz")
        );

        let mut other = chart.clone();
        other.chart.digest = Some("fedcba98765432100000".into());
        assert_ne!(locator.cache_path(&chart).unwrap(), locator.cache_path(&other).unwrap());
    }

    #[test]
    fn test_short_or_missing_digest_rejected() {
        let locator = ChartLocator::new("/cache".into(), Arc::new(FakeDownloader::default()));
        let mut chart = resolved(b"x", "app-1.0.0.tgz");
        for digest in [None, Some("sha256:0123456789abcde"), Some("zzzzzzzzzzzzzzzzzzzz")] {
            chart.chart.digest = digest.map(String::from);
            let err = locator.cache_path(&chart).unwrap_err();
            assert!(matches!(err, RepoError::InvalidDigest { .. }), "{:?}", digest);
        }
    }

    #[test]
    fn test_resolve_chart_url() {
        assert_eq!(
            resolve_chart_url("https://example.com/charts", "app-1.0.0.tgz").unwrap(),
            "https://example.com/charts/app-1.0.0.tgz"
        );
        assert_eq!(
            resolve_chart_url("https://example.com/charts/", "https://cdn.example.com/a.tgz")
                .unwrap(),
            "https://cdn.example.com/a.tgz"
        );
    }

    #[tokio::test]
    async fn test_locate_downloads_once() {
        let data = b"chart-bytes".to_vec();
        let url = "https://charts.example.com/stable/app-1.0.0.tgz";
        let mut downloader = FakeDownloader::default();
        downloader.files.insert(url.into(), data.clone());
        let downloader = Arc::new(downloader);

        let dir = TempDir::new().unwrap();
        let locator = ChartLocator::new(dir.path().into(), downloader.clone());
        let chart = resolved(&data, "app-1.0.0.tgz");
        let cancel = CancellationToken::new();

        let path = locator.locate(&chart, None, &cancel).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), data);
        let again = locator.locate(&chart, None, &cancel).await.unwrap();
        assert_eq!(path, again);
        assert_eq!(downloader.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_locate_rejects_digest_mismatch() {
        let url = "https://charts.example.com/stable/app-1.0.0.tgz";
        let mut downloader = FakeDownloader::default();
        downloader.files.insert(url.into(), b"tampered".to_vec());

        let dir = TempDir::new().unwrap();
        let locator = ChartLocator::new(dir.path().into(), Arc::new(downloader));
        let chart = resolved(b"original", url);

        let err = locator.locate(&chart, None, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, RepoError::IntegrityCheckFailed { .. }));
        assert!(!locator.cache_path(&chart).unwrap().exists());
    }

    #[tokio::test]
    async fn test_download_error_names_chart() {
        let dir = TempDir::new().unwrap();
        let locator = ChartLocator::new(dir.path().into(), Arc::new(FakeDownloader::default()));
        let chart = resolved(b"x", "app-1.0.0.tgz");

        let err = locator.locate(&chart, None, &CancellationToken::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "download chart app 1.0.0");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_locate_verifies_signature() {
        let KeyPair { pk, sk } = KeyPair::generate_unencrypted_keypair().unwrap();
        let data = b"signed chart".to_vec();
        let signature = minisign::sign(None, &sk, Cursor::new(&data), Some("khelm"), None)
            .unwrap()
            .to_string();

        let dir = TempDir::new().unwrap();
        let keyring = dir.path().join("key.pub");
        std::fs::write(&keyring, pk.to_box().unwrap().to_string()).unwrap();

        let url = "https://charts.example.com/stable/app-1.0.0.tgz";
        let mut downloader = FakeDownloader::default();
        downloader.files.insert(url.into(), data.clone());
        downloader.files.insert(format!("{}.minisig", url), signature.into_bytes());

        let locator = ChartLocator::new(dir.path().join("cache"), Arc::new(downloader));
        let chart = resolved(&data, url);
        let cancel = CancellationToken::new();

        let path = locator.locate(&chart, Some(&keyring), &cancel).await.unwrap();
        assert!(signature_path(&path).is_file());

        std::fs::write(&path, b"corrupted").unwrap();
        let err = locator.locate(&chart, Some(&keyring), &cancel).await.unwrap_err();
        assert!(matches!(err, RepoError::SignatureVerification { .. }));
    }
}
