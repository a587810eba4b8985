//! Git getter
//!
//! Serves charts straight from a git repository. URLs look like
//! `git+https://github.com/org/repo@path/to/charts?ref=v1.2.3` (or `git+ssh`):
//! the part before `@` is the repository, the part after it a path within
//! the checkout, `ref` a tag, branch or commit.
//!
//! Requests are answered from a checkout cached under
//! `<git cache>/<sha256(repository url)>`:
//! - `…@dir/index.yaml` returns an index generated from the charts in `dir`
//! - `…@dir/<name>-<version>.tgz` returns chart `dir/<name>`, packaged
//! - any other path returns the file content

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use khelm_core::archive;
use khelm_core::chart::{ChartDefinition, archive_name};

use super::{Getter, with_cancel};
use crate::error::{RepoError, Result};
use crate::index::{ChartVersion, IndexFile};
use crate::repositories::RepositoryEntry;

const GIT_TIMEOUT: Duration = Duration::from_secs(300);

/// A parsed `git+<scheme>://<repo>@<path>?ref=<ref>` URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitUrl {
    /// Repository URL without the `git+` prefix
    pub repository: String,
    /// Path within the repository, without leading or trailing `/`
    pub path: String,
    pub git_ref: Option<String>,
}

impl GitUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = |reason: &str| RepoError::InvalidRepositoryUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let rest = url.strip_prefix("git+").ok_or_else(|| invalid("expected git+ scheme"))?;
        let (rest, query) = match rest.split_once('?') {
            Some((rest, query)) => (rest, Some(query)),
            None => (rest, None),
        };
        let (scheme, location) = rest.split_once("://").ok_or_else(|| invalid("missing ://"))?;

        // user info (git@host) precedes the first '/', the path separator follows it
        let host_end = location.find('/').ok_or_else(|| invalid("missing repository path"))?;
        let at = location[host_end..]
            .find('@')
            .map(|i| host_end + i)
            .ok_or_else(|| invalid("missing @<path> after the repository"))?;

        let repository = format!("{}://{}", scheme, &location[..at]);
        let path = location[at + 1..].trim_matches('/').to_string();

        let git_ref = query.and_then(|q| {
            q.split('&')
                .filter_map(|kv| kv.split_once('='))
                .find(|(k, _)| *k == "ref")
                .map(|(_, v)| v.to_string())
        });

        Ok(Self {
            repository,
            path,
            git_ref,
        })
    }

    /// Cache directory name of the repository
    pub fn cache_key(&self) -> String {
        hex::encode(Sha256::digest(self.repository.as_bytes()))
    }

    /// URL of another path within the same repository and ref
    pub fn with_path(&self, path: &str) -> String {
        let mut url = format!("git+{}@{}", self.repository, path.trim_matches('/'));
        if let Some(git_ref) = &self.git_ref {
            url.push_str("?ref=");
            url.push_str(git_ref);
        }
        url
    }
}

/// Fetches content from git repositories through the `git` CLI
pub struct GitGetter {
    cache_dir: PathBuf,
    lock: Mutex<()>,
}

impl GitGetter {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            lock: Mutex::new(()),
        }
    }

    /// Clone or update the cached checkout and check out the requested ref
    async fn checkout(&self, url: &GitUrl) -> Result<PathBuf> {
        let dir = self.cache_dir.join(url.cache_key());

        if dir.join(".git").is_dir() {
            git(&dir, ["fetch", "--quiet", "--tags", "--force", "origin"]).await?;
        } else {
            std::fs::create_dir_all(&self.cache_dir)?;
            let tmp = tempfile::TempDir::new_in(&self.cache_dir)?;
            tracing::info!("cloning {}", url.repository);
            git(
                tmp.path(),
                ["clone", "--quiet", url.repository.as_str(), "."],
            )
            .await?;
            let tmp = tmp.keep();
            if let Err(e) = std::fs::rename(&tmp, &dir) {
                // another process may have won the race
                let _ = std::fs::remove_dir_all(&tmp);
                if !dir.join(".git").is_dir() {
                    return Err(e.into());
                }
            }
        }

        let candidates = match &url.git_ref {
            Some(r) => vec![format!("origin/{}", r), r.clone()],
            None => vec!["origin/HEAD".to_string()],
        };
        for candidate in &candidates {
            let commit = format!("{}^{{commit}}", candidate);
            if git(&dir, ["rev-parse", "--verify", "--quiet", commit.as_str()])
                .await
                .is_ok()
            {
                git(
                    &dir,
                    ["checkout", "--quiet", "--force", "--detach", candidate.as_str()],
                )
                .await?;
                return Ok(dir);
            }
        }

        Err(RepoError::Git {
            message: format!(
                "ref {} not found in {}",
                url.git_ref.as_deref().unwrap_or("HEAD"),
                url.repository
            ),
        })
    }

    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let git_url = GitUrl::parse(url)?;
        let _guard = self.lock.lock().await;
        let checkout = self.checkout(&git_url).await?;

        let target = checkout.join(&git_url.path);
        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let dir = target.parent().unwrap_or(&checkout).to_path_buf();

        if file_name == "index.yaml" {
            let index = generate_index(&git_url, &checkout, &dir)?;
            return Ok(index.to_yaml()?.into_bytes());
        }
        if file_name.ends_with(".tgz") {
            return package_from_dir(&dir, &file_name);
        }
        std::fs::read(&target).map_err(|e| {
            RepoError::Io(e).context(format!("read {} from {}", git_url.path, git_url.repository))
        })
    }
}

#[async_trait]
impl Getter for GitGetter {
    async fn get(
        &self,
        url: &str,
        _repo: &RepositoryEntry,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        with_cancel(cancel, self.fetch(url)).await
    }
}

async fn git<'a, I>(dir: &Path, args: I) -> Result<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let args: Vec<&str> = args.into_iter().collect();
    tracing::debug!(target: "git", "Executing command: git -C {} {}", dir.display(), args.join(" "));

    let mut cmd = Command::new("git");
    cmd.arg("-C")
        .arg(dir)
        .args(&args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(GIT_TIMEOUT, cmd.output())
        .await
        .map_err(|_| RepoError::Git {
            message: format!(
                "git {} timed out after {} seconds",
                args.join(" "),
                GIT_TIMEOUT.as_secs()
            ),
        })?
        .map_err(|e| RepoError::Git {
            message: format!("failed to execute git: {}", e),
        })?;

    if !output.status.success() {
        return Err(RepoError::Git {
            message: format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Chart directories directly below `dir`
fn chart_dirs(dir: &Path) -> Result<Vec<(PathBuf, ChartDefinition)>> {
    let mut charts = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.join(khelm_core::chart::CHART_FILE).is_file() {
            let definition = ChartDefinition::load(&path)?;
            charts.push((path, definition));
        }
    }
    charts.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(charts)
}

/// Index of the charts below `dir`, with URLs pointing back into the repository
fn generate_index(url: &GitUrl, checkout: &Path, dir: &Path) -> Result<IndexFile> {
    let rel_dir = dir
        .strip_prefix(checkout)
        .unwrap_or(dir)
        .to_string_lossy()
        .replace('\\', "/");

    let mut index = IndexFile::default();
    for (path, definition) in chart_dirs(dir)? {
        let data = archive::pack_directory(&path, definition.name())?;
        let file = archive_name(definition.name(), definition.version());
        let chart_path = if rel_dir.is_empty() {
            file
        } else {
            format!("{}/{}", rel_dir, file)
        };
        index.add(ChartVersion {
            name: definition.name().to_string(),
            version: definition.version().to_string(),
            app_version: definition.metadata.app_version.clone(),
            description: definition.metadata.description.clone(),
            api_version: Some(definition.metadata.api_version.clone()),
            urls: vec![url.with_path(&chart_path)],
            digest: Some(archive::sha256_digest(&data)),
            ..Default::default()
        });
    }
    index.sort_entries();
    Ok(index)
}

fn package_from_dir(dir: &Path, file_name: &str) -> Result<Vec<u8>> {
    for (path, definition) in chart_dirs(dir)? {
        if archive_name(definition.name(), definition.version()) == file_name {
            return Ok(archive::pack_directory(&path, definition.name())?);
        }
    }
    Err(RepoError::ChartNotFound {
        name: file_name.to_string(),
        version: String::new(),
        repo: dir.display().to_string(),
    })
}
