//! Byte fetching by URL scheme
//!
//! - `http`/`https`: [`HttpGetter`], chart downloads go through [`HttpCacheGetter`]
//! - `git+https`/`git+ssh`: [`GitGetter`], only when enabled in the settings
//! - `oci`: [`OciGetter`]
//!
//! [`IndexFetcher`] and [`ChartDownloader`] are the seams the index cache and
//! the chart locator depend on; [`Getters`] implements both.

pub mod git;
pub mod http;
pub mod oci;

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use khelm_core::Settings;

use crate::error::{RepoError, Result};
use crate::index::ChartVersion;
use crate::repositories::RepositoryEntry;

pub use git::GitGetter;
pub use http::{HttpCacheGetter, HttpGetter};
pub use oci::OciGetter;

/// Fetch the content at a URL
#[async_trait]
pub trait Getter: Send + Sync {
    async fn get(
        &self,
        url: &str,
        repo: &RepositoryEntry,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>>;
}

/// Downloads repository indices
#[async_trait]
pub trait IndexFetcher: Send + Sync {
    async fn fetch_index(
        &self,
        repo: &RepositoryEntry,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>>;

    /// Resolve a chart version in an OCI repository, which has no index
    async fn oci_chart_version(
        &self,
        repo: &RepositoryEntry,
        name: &str,
        _constraint: &str,
        _cancel: &CancellationToken,
    ) -> Result<ChartVersion> {
        Err(RepoError::UnsupportedScheme {
            url: format!("{}/{}", repo.url, name),
        })
    }
}

/// Downloads chart archives and their signatures
#[async_trait]
pub trait ChartDownloader: Send + Sync {
    async fn download(
        &self,
        url: &str,
        repo: &RepositoryEntry,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>>;
}

/// Run a future until it completes or the token is cancelled
pub async fn with_cancel<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RepoError::Cancelled),
        res = fut => res,
    }
}

/// `scheme` of a URL, up to `://`
pub fn url_scheme(url: &str) -> Option<&str> {
    url.split_once("://").map(|(scheme, _)| scheme)
}

/// Scheme-dispatching getter registry
#[derive(Clone)]
pub struct Getters {
    index: HashMap<&'static str, Arc<dyn Getter>>,
    download: HashMap<&'static str, Arc<dyn Getter>>,
    oci: Option<Arc<OciGetter>>,
}

impl Getters {
    /// Register the getters enabled by `settings`
    pub fn new(settings: &Settings) -> Result<Self> {
        let http: Arc<dyn Getter> = Arc::new(HttpGetter::new()?);
        let http_cache: Arc<dyn Getter> =
            Arc::new(HttpCacheGetter::new(http.clone(), settings.http_cache_dir()));
        let oci = Arc::new(OciGetter::new());

        let mut getters = Self::empty();
        for scheme in ["http", "https"] {
            getters.index.insert(scheme, http.clone());
            getters.download.insert(scheme, http_cache.clone());
        }
        getters.download.insert("oci", oci.clone());
        getters.oci = Some(oci);

        if settings.enable_git_getter {
            let git: Arc<dyn Getter> = Arc::new(GitGetter::new(settings.git_cache_dir()));
            for scheme in ["git+https", "git+ssh"] {
                getters.index.insert(scheme, git.clone());
                getters.download.insert(scheme, git.clone());
            }
        }
        Ok(getters)
    }

    /// A registry without any getter
    pub fn empty() -> Self {
        Self {
            index: HashMap::new(),
            download: HashMap::new(),
            oci: None,
        }
    }

    /// Register a getter for both index and chart requests
    pub fn register(&mut self, scheme: &'static str, getter: Arc<dyn Getter>) {
        self.index.insert(scheme, getter.clone());
        self.download.insert(scheme, getter);
    }

    fn lookup<'a>(
        table: &'a HashMap<&'static str, Arc<dyn Getter>>,
        url: &str,
    ) -> Result<&'a Arc<dyn Getter>> {
        url_scheme(url)
            .and_then(|scheme| table.get(scheme))
            .ok_or_else(|| RepoError::UnsupportedScheme {
                url: url.to_string(),
            })
    }
}

#[async_trait]
impl IndexFetcher for Getters {
    async fn fetch_index(
        &self,
        repo: &RepositoryEntry,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let url = repo.index_url();
        tracing::info!("downloading index {}", url);
        Self::lookup(&self.index, &url)?
            .get(&url, repo, cancel)
            .await
    }

    async fn oci_chart_version(
        &self,
        repo: &RepositoryEntry,
        name: &str,
        constraint: &str,
        cancel: &CancellationToken,
    ) -> Result<ChartVersion> {
        let oci = self.oci.as_ref().ok_or_else(|| RepoError::UnsupportedScheme {
            url: repo.url.clone(),
        })?;
        oci.resolve(repo, name, constraint, cancel).await
    }
}

#[async_trait]
impl ChartDownloader for Getters {
    async fn download(
        &self,
        url: &str,
        repo: &RepositoryEntry,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        Self::lookup(&self.download, url)?
            .get(url, repo, cancel)
            .await
    }
}
