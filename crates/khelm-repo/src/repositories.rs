//! Registered repositories and the trust policy for unregistered ones
//!
//! Repositories are registered in a Helm `repositories.yaml`. Whether a chart
//! may be pulled from a URL that is not registered there depends on the
//! three-way `trust_any_repository` flag:
//!
//! | flag    | repositories.yaml | unregistered URL |
//! |---------|-------------------|------------------|
//! | `true`  | any               | allowed          |
//! | unset   | absent            | allowed          |
//! | unset   | present           | rejected         |
//! | `false` | any               | rejected         |
//!
//! Registered URLs are always allowed. Aliases (`@name`, `alias:name`) must
//! be registered.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use url::Url;

use khelm_core::Settings;

use crate::error::{RepoError, Result};

/// An entry of `repositories.yaml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryEntry {
    pub name: String,

    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(rename = "caFile", default, skip_serializing_if = "String::is_empty")]
    pub ca_file: String,

    #[serde(rename = "certFile", default, skip_serializing_if = "String::is_empty")]
    pub cert_file: String,

    #[serde(rename = "keyFile", default, skip_serializing_if = "String::is_empty")]
    pub key_file: String,

    #[serde(default)]
    pub insecure_skip_tls_verify: bool,

    /// Send credentials to chart URLs on other hosts than the repository
    #[serde(default)]
    pub pass_credentials_all: bool,
}

impl RepositoryEntry {
    /// Entry for an unregistered URL, named after the URL's SHA-256
    pub fn synthesize(url: &str) -> Self {
        Self {
            name: hex::encode(Sha256::digest(url.as_bytes())),
            url: url.to_string(),
            ..Default::default()
        }
    }

    pub fn is_oci(&self) -> bool {
        self.url.starts_with("oci://")
    }

    /// URL of the repository's `index.yaml`
    ///
    /// A query (the `?ref=` of git repositories) stays at the end.
    pub fn index_url(&self) -> String {
        let (base, query) = match self.url.split_once('?') {
            Some((base, query)) => (base, Some(query)),
            None => (self.url.as_str(), None),
        };
        let mut index = format!("{}/index.yaml", base.trim_end_matches('/'));
        if let Some(query) = query {
            index.push('?');
            index.push_str(query);
        }
        index
    }

    /// Basic auth credentials to send with a request to `url`
    pub fn credentials_for(&self, url: &str) -> Option<(&str, &str)> {
        let username = self.username.as_deref()?;
        let password = self.password.as_deref().unwrap_or_default();
        if self.pass_credentials_all || same_origin(&self.url, url) {
            Some((username, password))
        } else {
            None
        }
    }
}

/// Whether two URLs share scheme, host and port
pub fn same_origin(a: &str, b: &str) -> bool {
    match (Url::parse(a), Url::parse(b)) {
        (Ok(a), Ok(b)) => {
            a.scheme() == b.scheme()
                && a.host() == b.host()
                && a.port_or_known_default() == b.port_or_known_default()
        }
        _ => false,
    }
}

/// Helm `repositories.yaml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryFile {
    #[serde(default)]
    pub api_version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated: Option<String>,

    #[serde(default)]
    pub repositories: Vec<RepositoryEntry>,
}

impl RepositoryFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&content).map_err(|e| RepoError::InvalidRepositoryFile {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }
}

/// A repository reference as written in a chart config or requirement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepositoryRef<'a> {
    Alias(&'a str),
    Url(&'a str),
}

impl<'a> RepositoryRef<'a> {
    pub fn parse(repository: &'a str) -> Self {
        if let Some(name) = repository.strip_prefix('@') {
            RepositoryRef::Alias(name)
        } else if let Some(name) = repository.strip_prefix("alias:") {
            RepositoryRef::Alias(name)
        } else {
            RepositoryRef::Url(repository)
        }
    }
}

/// Registered repositories plus the trust policy for everything else
#[derive(Debug, Clone)]
pub struct Repositories {
    entries: Vec<RepositoryEntry>,
    config_path: PathBuf,
    file_exists: bool,
    trust_any: Option<bool>,
}

impl Repositories {
    /// Load `repositories.yaml` as configured; a missing file is not an error
    pub fn load(settings: &Settings) -> Result<Self> {
        let path = &settings.repository_config;
        let (entries, file_exists) = if path.is_file() {
            (RepositoryFile::load(path)?.repositories, true)
        } else {
            (Vec::new(), false)
        };
        tracing::debug!(
            "loaded {} repositories from {} (exists: {})",
            entries.len(),
            path.display(),
            file_exists
        );
        Ok(Self {
            entries,
            config_path: path.clone(),
            file_exists,
            trust_any: settings.trust_any_repository,
        })
    }

    /// A closed set of entries; URLs outside of it are rejected
    pub fn from_entries(entries: Vec<RepositoryEntry>) -> Self {
        Self {
            entries,
            config_path: PathBuf::from("<dependency repositories>"),
            file_exists: true,
            trust_any: Some(false),
        }
    }

    pub fn entries(&self) -> &[RepositoryEntry] {
        &self.entries
    }

    fn find_url(&self, url: &str) -> Option<&RepositoryEntry> {
        let wanted = normalize_url(url);
        self.entries.iter().find(|e| normalize_url(&e.url) == wanted)
    }

    fn allows_unregistered(&self) -> bool {
        match self.trust_any {
            Some(trust) => trust,
            None => !self.file_exists,
        }
    }

    /// Resolve a repository URL or alias to an entry, applying the trust policy
    pub fn get(&self, repository: &str) -> Result<RepositoryEntry> {
        match RepositoryRef::parse(repository) {
            RepositoryRef::Alias(name) => self
                .entries
                .iter()
                .find(|e| e.name == name)
                .cloned()
                .ok_or_else(|| RepoError::RepositoryNotRegistered {
                    name: name.to_string(),
                    config: self.config_path.display().to_string(),
                }),
            RepositoryRef::Url(url) => {
                validate_url(url)?;
                if let Some(entry) = self.find_url(url) {
                    return Ok(entry.clone());
                }
                if !self.allows_unregistered() {
                    return Err(RepoError::UntrustedRepository {
                        url: url.to_string(),
                        config: self.config_path.display().to_string(),
                    });
                }
                tracing::debug!("using untrusted repository {}", url);
                Ok(RepositoryEntry::synthesize(url))
            }
        }
    }
}

fn normalize_url(url: &str) -> &str {
    url.trim_end_matches('/')
}

fn validate_url(url: &str) -> Result<()> {
    let parsed = Url::parse(url).map_err(|e| RepoError::InvalidRepositoryUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(RepoError::InvalidRepositoryUrl {
            url: url.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use khelm_core::ErrorKind;
    use tempfile::TempDir;

    const REPOS: &str = r#"
apiVersion: v1
repositories:
- name: stable
  url: https://charts.example.com/stable/
  username: user
  password: secret
"#;

    fn settings(dir: &TempDir, with_file: bool, trust: Option<bool>) -> Settings {
        let mut settings = Settings::with_home(dir.path());
        settings.trust_any_repository = trust;
        if with_file {
            std::fs::write(&settings.repository_config, REPOS).unwrap();
        }
        settings
    }

    #[test]
    fn test_registered_url_always_trusted() {
        let dir = TempDir::new().unwrap();
        for trust in [None, Some(true), Some(false)] {
            let repos = Repositories::load(&settings(&dir, true, trust)).unwrap();
            let entry = repos.get("https://charts.example.com/stable").unwrap();
            assert_eq!(entry.name, "stable");
            assert_eq!(entry.username.as_deref(), Some("user"));
        }
    }

    #[test]
    fn test_trust_policy_matrix() {
        let url = "https://other.example.com/charts";
        let cases = [
            (true, None, false),
            (false, None, true),
            (true, Some(true), true),
            (false, Some(true), true),
            (true, Some(false), false),
            (false, Some(false), false),
        ];
        for (with_file, trust, allowed) in cases {
            let dir = TempDir::new().unwrap();
            let repos = Repositories::load(&settings(&dir, with_file, trust)).unwrap();
            match repos.get(url) {
                Ok(entry) => {
                    assert!(allowed, "file={} trust={:?}", with_file, trust);
                    assert_eq!(entry.name, RepositoryEntry::synthesize(url).name);
                    assert_eq!(entry.name.len(), 64);
                }
                Err(e) => {
                    assert!(!allowed, "file={} trust={:?}", with_file, trust);
                    assert_eq!(e.kind(), ErrorKind::UntrustedRepository);
                }
            }
        }
    }

    #[test]
    fn test_alias_requires_registration() {
        let dir = TempDir::new().unwrap();
        let repos = Repositories::load(&settings(&dir, true, Some(true))).unwrap();
        assert_eq!(repos.get("@stable").unwrap().name, "stable");
        assert_eq!(repos.get("alias:stable").unwrap().name, "stable");

        let err = repos.get("@missing").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RepositoryNotRegistered);
    }

    #[test]
    fn test_invalid_url() {
        let dir = TempDir::new().unwrap();
        let repos = Repositories::load(&settings(&dir, false, None)).unwrap();
        assert_eq!(repos.get("not a url").unwrap_err().kind(), ErrorKind::Config);
    }

    #[test]
    fn test_from_entries_is_closed() {
        let repos = Repositories::from_entries(vec![RepositoryEntry::synthesize(
            "https://a.example.com",
        )]);
        assert!(repos.get("https://a.example.com/").is_ok());
        assert!(repos.get("https://b.example.com").unwrap_err().is_untrusted_repository());
    }

    #[test]
    fn test_index_url() {
        let entry = RepositoryEntry::synthesize("https://charts.example.com/stable/");
        assert_eq!(entry.index_url(), "https://charts.example.com/stable/index.yaml");

        let git = RepositoryEntry::synthesize("git+https://github.com/org/repo@charts?ref=v1.0.0");
        assert_eq!(
            git.index_url(),
            "git+https://github.com/org/repo@charts/index.yaml?ref=v1.0.0"
        );
    }

    #[test]
    fn test_credentials_scope() {
        let mut entry = RepositoryEntry::synthesize("https://charts.example.com");
        entry.username = Some("u".into());
        entry.password = Some("p".into());

        assert_eq!(
            entry.credentials_for("https://charts.example.com/nginx-1.0.0.tgz"),
            Some(("u", "p"))
        );
        assert_eq!(entry.credentials_for("https://cdn.example.net/nginx-1.0.0.tgz"), None);

        entry.pass_credentials_all = true;
        assert!(entry.credentials_for("https://cdn.example.net/nginx-1.0.0.tgz").is_some());
    }
}
