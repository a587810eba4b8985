//! HTTP getter with redirect-safe basic auth, plus an on-disk cache for it

use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{Getter, with_cancel};
use crate::error::{RepoError, Result};
use crate::repositories::{RepositoryEntry, same_origin};

const MAX_REDIRECTS: u32 = 10;

/// HTTP client that follows redirects itself
///
/// Credentials are only attached while the request stays on the origin of
/// the originally requested URL.
pub struct HttpGetter {
    client: reqwest::Client,
}

impl HttpGetter {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(std::time::Duration::from_secs(60))
            .user_agent(concat!("khelm/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RepoError::Network {
                message: e.to_string(),
            })?;
        Ok(Self { client })
    }

    async fn fetch(&self, url: &str, repo: &RepositoryEntry) -> Result<Vec<u8>> {
        let original_url = url.to_string();
        let mut current_url = original_url.clone();
        let mut redirects = 0;

        loop {
            let mut request = self.client.get(&current_url);

            if same_origin(&original_url, &current_url) {
                if let Some((username, password)) = repo.credentials_for(&current_url) {
                    request = request.basic_auth(username, Some(password));
                }
            } else if repo.username.is_some() {
                tracing::warn!(
                    "Cross-origin redirect from {} to {} - credentials not forwarded",
                    original_url,
                    current_url
                );
            }

            let response = request.send().await?;
            let status = response.status();

            if status.is_redirection() {
                redirects += 1;
                if redirects > MAX_REDIRECTS {
                    return Err(RepoError::Network {
                        message: format!("Too many redirects (max {})", MAX_REDIRECTS),
                    });
                }
                let location = response
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| RepoError::Network {
                        message: "Redirect without Location header".to_string(),
                    })?;
                current_url = Url::parse(&current_url)?.join(location)?.to_string();
                continue;
            }

            if !status.is_success() {
                return Err(RepoError::Http {
                    status: status.as_u16(),
                    url: current_url,
                });
            }

            let bytes = response.bytes().await.map_err(|e| RepoError::Network {
                message: e.to_string(),
            })?;
            return Ok(bytes.to_vec());
        }
    }
}

#[async_trait]
impl Getter for HttpGetter {
    async fn get(
        &self,
        url: &str,
        repo: &RepositoryEntry,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        with_cancel(cancel, self.fetch(url, repo)).await
    }
}

/// Caches responses of another getter under `<cache>/<host>/<path>`
///
/// URLs with a query are passed through uncached.
pub struct HttpCacheGetter {
    inner: Arc<dyn Getter>,
    cache_dir: PathBuf,
}

impl HttpCacheGetter {
    pub fn new(inner: Arc<dyn Getter>, cache_dir: PathBuf) -> Self {
        Self { inner, cache_dir }
    }

    /// Cache file of a URL, `None` for URLs that must not be cached
    pub fn cache_path(&self, url: &str) -> Result<Option<PathBuf>> {
        let parsed = Url::parse(url).map_err(|e| RepoError::InvalidRepositoryUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if parsed.query().is_some() {
            return Ok(None);
        }
        let host = match parsed.port() {
            Some(port) => format!("{}_{}", parsed.host_str().unwrap_or_default(), port),
            None => parsed.host_str().unwrap_or_default().to_string(),
        };
        let mut path = self.cache_dir.join(sanitize(&host));
        for segment in parsed.path().split('/').filter(|s| !s.is_empty() && *s != "..") {
            path.push(sanitize(segment));
        }
        if path == self.cache_dir.join(sanitize(&host)) {
            return Ok(None);
        }
        Ok(Some(path))
    }
}

fn sanitize(segment: &str) -> String {
    segment.replace(['\\', ':'], "_")
}

#[async_trait]
impl Getter for HttpCacheGetter {
    async fn get(
        &self,
        url: &str,
        repo: &RepositoryEntry,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let Some(path) = self.cache_path(url)? else {
            tracing::warn!("not caching {} since it has a query", url);
            return self.inner.get(url, repo, cancel).await;
        };

        if path.is_file() {
            tracing::debug!("http cache hit for {}", url);
            return Ok(tokio::fs::read(&path).await?);
        }

        tracing::debug!("http cache miss for {}", url);
        let data = self.inner.get(url, repo, cancel).await?;
        write_atomic(&path, &data)?;
        Ok(data)
    }
}

/// Write via a temp file in the destination directory and rename into place
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path.parent().ok_or_else(|| RepoError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("{} has no parent directory", path.display()),
    )))?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn repo_with_auth(url: &str) -> RepositoryEntry {
        let mut repo = RepositoryEntry::synthesize(url);
        repo.username = Some("user".into());
        repo.password = Some("pass".into());
        repo
    }

    #[tokio::test]
    async fn test_get_with_basic_auth() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.yaml"))
            .and(header("authorization", "Basic dXNlcjpwYXNz"))
            .respond_with(ResponseTemplate::new(200).set_body_string("apiVersion: v1\n"))
            .mount(&server)
            .await;

        let getter = HttpGetter::new().unwrap();
        let repo = repo_with_auth(&server.uri());
        let body = getter
            .get(&repo.index_url(), &repo, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(body, b"apiVersion: v1\n");
    }

    #[tokio::test]
    async fn test_follows_same_origin_redirect() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old.tgz"))
            .respond_with(ResponseTemplate::new(302).insert_header("Location", "/new.tgz"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/new.tgz"))
            .and(header_exists("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"chart".to_vec()))
            .mount(&server)
            .await;

        let getter = HttpGetter::new().unwrap();
        let repo = repo_with_auth(&server.uri());
        let url = format!("{}/old.tgz", server.uri());
        let body = getter.get(&url, &repo, &CancellationToken::new()).await.unwrap();
        assert_eq!(body, b"chart");
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let getter = HttpGetter::new().unwrap();
        let repo = RepositoryEntry::synthesize(&server.uri());
        let err = getter
            .get(&repo.index_url(), &repo, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Http { status: 404, .. }));
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_cancel_aborts_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200).set_delay(std::time::Duration::from_secs(30)),
            )
            .mount(&server)
            .await;

        let getter = HttpGetter::new().unwrap();
        let repo = RepositoryEntry::synthesize(&server.uri());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = getter.get(&repo.index_url(), &repo, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_cache_getter() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/charts/app-1.0.0.tgz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"v1".to_vec()))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/dynamic"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"dyn".to_vec()))
            .expect(2)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let getter = HttpCacheGetter::new(Arc::new(HttpGetter::new().unwrap()), dir.path().into());
        let repo = RepositoryEntry::synthesize(&server.uri());
        let cancel = CancellationToken::new();

        let url = format!("{}/charts/app-1.0.0.tgz", server.uri());
        assert_eq!(getter.get(&url, &repo, &cancel).await.unwrap(), b"v1");
        assert_eq!(getter.get(&url, &repo, &cancel).await.unwrap(), b"v1");
        let cached = getter.cache_path(&url).unwrap().unwrap();
        assert!(cached.starts_with(dir.path()));
        assert!(cached.ends_with("charts/app-1.0.0.tgz"));

        let dynamic = format!("{}/dynamic?token=abc", server.uri());
        assert!(getter.cache_path(&dynamic).unwrap().is_none());
        getter.get(&dynamic, &repo, &cancel).await.unwrap();
        getter.get(&dynamic, &repo, &cancel).await.unwrap();
    }
}
