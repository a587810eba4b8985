//! Repository index cache
//!
//! One `<name>-index.yaml` per repository entry below the repository cache
//! directory. Downloads are written to a temp file in the same directory and
//! renamed into place, so a cached index is either complete or absent.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use khelm_core::Settings;

use crate::error::{RepoError, Result, ResultExt};
use crate::getter::IndexFetcher;
use crate::index::{ChartVersion, IndexFile, is_version_range};
use crate::repositories::{Repositories, RepositoryEntry};

/// A chart version found in a repository
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedChart {
    pub repository: RepositoryEntry,
    pub chart: ChartVersion,
}

pub struct RepositoryIndexCache {
    cache_dir: PathBuf,
    repositories: Repositories,
    fetcher: Arc<dyn IndexFetcher>,
    loaded: HashMap<String, Arc<IndexFile>>,
}

impl RepositoryIndexCache {
    pub fn new(settings: &Settings, fetcher: Arc<dyn IndexFetcher>) -> Result<Self> {
        Ok(Self::with_repositories(
            settings.repository_cache.clone(),
            Repositories::load(settings)?,
            fetcher,
        ))
    }

    pub fn with_repositories(
        cache_dir: PathBuf,
        repositories: Repositories,
        fetcher: Arc<dyn IndexFetcher>,
    ) -> Self {
        Self {
            cache_dir,
            repositories,
            fetcher,
            loaded: HashMap::new(),
        }
    }

    pub fn repositories(&self) -> &Repositories {
        &self.repositories
    }

    /// Cache file of a repository's index
    pub fn index_path(&self, repo: &RepositoryEntry) -> PathBuf {
        self.cache_dir.join(format!("{}-index.yaml", repo.name))
    }

    /// Download the index unless it is cached already
    pub async fn fetch_index_if_not_exist(
        &mut self,
        repo: &RepositoryEntry,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        let path = self.index_path(repo);
        if !path.is_file() {
            self.update_index(repo, cancel).await?;
        }
        Ok(path)
    }

    /// Download the index unconditionally and replace the cached copy
    pub async fn update_index(
        &mut self,
        repo: &RepositoryEntry,
        cancel: &CancellationToken,
    ) -> Result<Arc<IndexFile>> {
        let path = self.index_path(repo);
        std::fs::create_dir_all(&self.cache_dir)?;

        let fetcher = self.fetcher.clone();
        let task_repo = repo.clone();
        let task_cancel = cancel.clone();
        let dir = self.cache_dir.clone();
        let mut task = tokio::spawn(async move {
            let data = fetcher.fetch_index(&task_repo, &task_cancel).await?;
            let index = IndexFile::from_bytes(&data)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(&data)?;
            tmp.as_file().sync_all()?;
            Ok::<_, RepoError>((tmp, index))
        });

        let downloaded = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                task.abort();
                // dropping the aborted task removes its temp file
                let _ = (&mut task).await;
                return Err(RepoError::Cancelled);
            }
            res = &mut task => match res {
                Ok(res) => res,
                Err(e) => return Err(RepoError::Io(std::io::Error::other(e))),
            },
        };
        let (tmp, index) =
            downloaded.with_context(|| format!("download index of repository {}", repo.url))?;

        tmp.persist(&path)?;
        tracing::debug!("stored index of {} at {}", repo.url, path.display());

        let index = Arc::new(index);
        self.loaded.insert(repo.name.clone(), index.clone());
        Ok(index)
    }

    /// Load the cached index, downloading it when absent
    pub async fn load(
        &mut self,
        repo: &RepositoryEntry,
        cancel: &CancellationToken,
    ) -> Result<Arc<IndexFile>> {
        if cancel.is_cancelled() {
            return Err(RepoError::Cancelled);
        }
        if let Some(index) = self.loaded.get(&repo.name) {
            return Ok(index.clone());
        }

        let path = self.index_path(repo);
        match tokio::fs::read(&path).await {
            Ok(data) => {
                tracing::debug!("index cache hit for {}", repo.url);
                let index = Arc::new(
                    IndexFile::from_bytes(&data)
                        .with_context(|| format!("load index {}", path.display()))?,
                );
                self.loaded.insert(repo.name.clone(), index.clone());
                Ok(index)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("index cache miss for {}", repo.url);
                self.update_index(repo, cancel).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve a chart version, applying the trust policy to `repository`
    pub async fn resolve_chart_version(
        &mut self,
        name: &str,
        constraint: &str,
        repository: &str,
        cancel: &CancellationToken,
    ) -> Result<ResolvedChart> {
        let repo = self.repositories.get(repository)?;
        self.find_in(&repo, name, constraint, cancel).await
    }

    /// Find a chart version in an already resolved repository
    ///
    /// A range constraint refreshes the index first. A miss refreshes the
    /// index and retries once.
    pub async fn find_in(
        &mut self,
        repo: &RepositoryEntry,
        name: &str,
        constraint: &str,
        cancel: &CancellationToken,
    ) -> Result<ResolvedChart> {
        if repo.is_oci() {
            return self.find_oci(repo, name, constraint, cancel).await;
        }

        let range = is_version_range(constraint);
        let index = if range {
            self.update_index(repo, cancel).await?
        } else {
            self.load(repo, cancel).await?
        };
        if let Some(found) = lookup(&index, repo, name, constraint)? {
            return Ok(found);
        }
        if !range {
            tracing::debug!("{} {} not in cached index of {}, refreshing", name, constraint, repo.url);
            let index = self.update_index(repo, cancel).await?;
            if let Some(found) = lookup(&index, repo, name, constraint)? {
                return Ok(found);
            }
        }
        Err(not_found(repo, name, constraint))
    }

    /// Find a chart version in the cached index without refreshing it
    ///
    /// The index is only downloaded when it is not cached yet. Callers that
    /// refresh on their own terms use this to keep control over downloads.
    pub async fn find_cached(
        &mut self,
        repo: &RepositoryEntry,
        name: &str,
        constraint: &str,
        cancel: &CancellationToken,
    ) -> Result<ResolvedChart> {
        if repo.is_oci() {
            return self.find_oci(repo, name, constraint, cancel).await;
        }
        let index = self.load(repo, cancel).await?;
        lookup(&index, repo, name, constraint)?.ok_or_else(|| not_found(repo, name, constraint))
    }

    async fn find_oci(
        &self,
        repo: &RepositoryEntry,
        name: &str,
        constraint: &str,
        cancel: &CancellationToken,
    ) -> Result<ResolvedChart> {
        let chart = self
            .fetcher
            .oci_chart_version(repo, name, constraint, cancel)
            .await?;
        Ok(ResolvedChart {
            repository: repo.clone(),
            chart,
        })
    }
}

/// A matching version with at least one download URL
fn lookup(
    index: &IndexFile,
    repo: &RepositoryEntry,
    name: &str,
    constraint: &str,
) -> Result<Option<ResolvedChart>> {
    Ok(index
        .get(name, constraint)?
        .filter(|chart| !chart.urls.is_empty())
        .map(|chart| ResolvedChart {
            repository: repo.clone(),
            chart: chart.clone(),
        }))
}

fn not_found(repo: &RepositoryEntry, name: &str, constraint: &str) -> RepoError {
    RepoError::ChartNotFound {
        name: name.to_string(),
        version: constraint.to_string(),
        repo: repo.url.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use khelm_core::ErrorKind;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Serves the configured index bodies in order, repeating the last one
    struct FakeFetcher {
        bodies: Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    impl FakeFetcher {
        fn new(bodies: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                bodies: Mutex::new(bodies.iter().rev().map(|s| s.to_string()).collect()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl IndexFetcher for FakeFetcher {
        async fn fetch_index(
            &self,
            _repo: &RepositoryEntry,
            _cancel: &CancellationToken,
        ) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut bodies = self.bodies.lock().unwrap();
            let body = if bodies.len() > 1 {
                bodies.pop().unwrap()
            } else {
                bodies.last().cloned().unwrap_or_default()
            };
            Ok(body.into_bytes())
        }
    }

    struct HangingFetcher;

    #[async_trait]
    impl IndexFetcher for HangingFetcher {
        async fn fetch_index(
            &self,
            _repo: &RepositoryEntry,
            _cancel: &CancellationToken,
        ) -> Result<Vec<u8>> {
            std::future::pending().await
        }
    }

    const INDEX_V1: &str = r#"
apiVersion: v1
entries:
  app:
  - name: app
    version: 1.0.0
    urls: [app-1.0.0.tgz]
    digest: 0123456789abcdef0123456789abcdef
"#;

    const INDEX_V2: &str = r#"
apiVersion: v1
entries:
  app:
  - name: app
    version: 1.0.0
    urls: [app-1.0.0.tgz]
    digest: 0123456789abcdef0123456789abcdef
  - name: app
    version: 1.1.0
    urls: [app-1.1.0.tgz]
    digest: fedcba9876543210fedcba9876543210
  nourl:
  - name: nourl
    version: 1.0.0
"#;

    fn cache(dir: &TempDir, fetcher: Arc<dyn IndexFetcher>) -> RepositoryIndexCache {
        let mut settings = Settings::with_home(dir.path());
        settings.trust_any_repository = Some(true);
        RepositoryIndexCache::new(&settings, fetcher).unwrap()
    }

    const REPO: &str = "https://charts.example.com";

    #[tokio::test]
    async fn test_load_downloads_when_absent() {
        let dir = TempDir::new().unwrap();
        let fetcher = FakeFetcher::new(&[INDEX_V1]);
        let mut cache = cache(&dir, fetcher.clone());
        let cancel = CancellationToken::new();
        let repo = cache.repositories().get(REPO).unwrap();

        let path = cache.fetch_index_if_not_exist(&repo, &cancel).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), INDEX_V1);
        cache.fetch_index_if_not_exist(&repo, &cancel).await.unwrap();
        assert_eq!(fetcher.calls(), 1);

        let resolved = cache
            .resolve_chart_version("app", "1.0.0", REPO, &cancel)
            .await
            .unwrap();
        assert_eq!(resolved.chart.version, "1.0.0");
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_miss_refreshes_once() {
        let dir = TempDir::new().unwrap();
        let fetcher = FakeFetcher::new(&[INDEX_V1, INDEX_V2]);
        let mut cache = cache(&dir, fetcher.clone());
        let cancel = CancellationToken::new();

        let resolved = cache
            .resolve_chart_version("app", "1.1.0", REPO, &cancel)
            .await
            .unwrap();
        assert_eq!(resolved.chart.version, "1.1.0");
        assert_eq!(fetcher.calls(), 2);

        let err = cache
            .resolve_chart_version("app", "9.9.9", REPO, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains(REPO));
        assert_eq!(fetcher.calls(), 3);
    }

    #[tokio::test]
    async fn test_range_forces_refresh() {
        let dir = TempDir::new().unwrap();
        let fetcher = FakeFetcher::new(&[INDEX_V1, INDEX_V2]);
        let mut cache = cache(&dir, fetcher.clone());
        let cancel = CancellationToken::new();
        let repo = cache.repositories().get(REPO).unwrap();
        cache.fetch_index_if_not_exist(&repo, &cancel).await.unwrap();

        let resolved = cache
            .resolve_chart_version("app", "^1.0.0", REPO, &cancel)
            .await
            .unwrap();
        assert_eq!(resolved.chart.version, "1.1.0");
        assert_eq!(fetcher.calls(), 2);
    }

    #[tokio::test]
    async fn test_entry_without_urls_is_not_found() {
        let dir = TempDir::new().unwrap();
        let mut cache = cache(&dir, FakeFetcher::new(&[INDEX_V2]));
        let err = cache
            .resolve_chart_version("nourl", "1.0.0", REPO, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::ChartNotFound { .. }));
    }

    #[tokio::test]
    async fn test_invalid_download_keeps_cached_index() {
        let dir = TempDir::new().unwrap();
        let fetcher = FakeFetcher::new(&[INDEX_V1, "entries: [broken"]);
        let mut cache = cache(&dir, fetcher);
        let cancel = CancellationToken::new();
        let repo = cache.repositories().get(REPO).unwrap();

        let path = cache.fetch_index_if_not_exist(&repo, &cancel).await.unwrap();
        assert!(cache.update_index(&repo, &cancel).await.is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), INDEX_V1);
        let leftovers = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn test_cancel_aborts_download() {
        let dir = TempDir::new().unwrap();
        let mut cache = cache(&dir, Arc::new(HangingFetcher));
        let repo = cache.repositories().get(REPO).unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = cache.load(&repo, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(!cache.index_path(&repo).exists());
    }

    #[tokio::test]
    async fn test_untrusted_repository() {
        let dir = TempDir::new().unwrap();
        let mut settings = Settings::with_home(dir.path());
        std::fs::write(&settings.repository_config, "repositories: []\n").unwrap();
        settings.trust_any_repository = None;
        let mut cache = RepositoryIndexCache::new(&settings, FakeFetcher::new(&[INDEX_V1])).unwrap();

        let err = cache
            .resolve_chart_version("app", "1.0.0", REPO, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_untrusted_repository());
    }
}
