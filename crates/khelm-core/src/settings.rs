//! Cache locations and repository trust flags
//!
//! `Settings` is constructed once per invocation and passed by reference to
//! every component that touches the filesystem cache or the repository file.

use std::path::{Path, PathBuf};

use crate::error::{CoreError, Result};

pub const ENV_REPOSITORY_CONFIG: &str = "HELM_REPOSITORY_CONFIG";
pub const ENV_REPOSITORY_CACHE: &str = "HELM_REPOSITORY_CACHE";
pub const ENV_CACHE_HOME: &str = "KHELM_CACHE_HOME";
pub const ENV_TRUST_ANY_REPO: &str = "KHELM_TRUST_ANY_REPO";
pub const ENV_ENABLE_GIT_GETTER: &str = "KHELM_ENABLE_GIT_GETTER";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Helm `repositories.yaml`; its presence switches the trust policy
    pub repository_config: PathBuf,

    /// Directory holding one `<name>-index.yaml` per repository
    pub repository_cache: PathBuf,

    /// Root of the chart, HTTP and git caches
    pub cache_home: PathBuf,

    /// `None` means: trust unregistered repositories only while no
    /// repository file exists
    pub trust_any_repository: Option<bool>,

    pub enable_git_getter: bool,
}

impl Settings {
    /// Settings rooted at a single directory, used by tests and `--cache-dir`
    pub fn with_home(home: &Path) -> Self {
        Self {
            repository_config: home.join("repositories.yaml"),
            repository_cache: home.join("repository"),
            cache_home: home.join("cache"),
            trust_any_repository: None,
            enable_git_getter: false,
        }
    }

    /// Build settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let repository_config = match var(ENV_REPOSITORY_CONFIG) {
            Some(path) => PathBuf::from(path),
            None => config_dir()?.join("helm").join("repositories.yaml"),
        };
        let repository_cache = match var(ENV_REPOSITORY_CACHE) {
            Some(path) => PathBuf::from(path),
            None => cache_dir()?.join("helm").join("repository"),
        };
        let cache_home = match var(ENV_CACHE_HOME) {
            Some(path) => PathBuf::from(path),
            None => cache_dir()?.join("khelm"),
        };

        let trust_any_repository = match var(ENV_TRUST_ANY_REPO) {
            Some(v) => Some(parse_bool(ENV_TRUST_ANY_REPO, &v)?),
            None => None,
        };
        let enable_git_getter = match var(ENV_ENABLE_GIT_GETTER) {
            Some(v) => parse_bool(ENV_ENABLE_GIT_GETTER, &v)?,
            None => false,
        };

        Ok(Self {
            repository_config,
            repository_cache,
            cache_home,
            trust_any_repository,
            enable_git_getter,
        })
    }

    pub fn chart_cache_dir(&self) -> PathBuf {
        self.cache_home.join("charts")
    }

    pub fn http_cache_dir(&self) -> PathBuf {
        self.cache_home.join("http")
    }

    pub fn git_cache_dir(&self) -> PathBuf {
        self.cache_home.join("git")
    }
}

fn config_dir() -> Result<PathBuf> {
    dirs::config_dir().ok_or_else(|| CoreError::InvalidConfig {
        errors: vec![format!(
            "cannot determine config directory, set {}",
            ENV_REPOSITORY_CONFIG
        )],
    })
}

fn cache_dir() -> Result<PathBuf> {
    dirs::cache_dir().ok_or_else(|| CoreError::InvalidConfig {
        errors: vec![format!(
            "cannot determine cache directory, set {} and {}",
            ENV_REPOSITORY_CACHE, ENV_CACHE_HOME
        )],
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(CoreError::InvalidConfig {
            errors: vec![format!("{}: invalid boolean {:?}", key, other)],
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_from_lookup_overrides() {
        let settings = Settings::from_lookup(lookup(&[
            (ENV_REPOSITORY_CONFIG, "/etc/helm/repos.yaml"),
            (ENV_REPOSITORY_CACHE, "/var/cache/helm"),
            (ENV_CACHE_HOME, "/var/cache/khelm"),
            (ENV_TRUST_ANY_REPO, "true"),
            (ENV_ENABLE_GIT_GETTER, "1"),
        ]))
        .unwrap();

        assert_eq!(settings.repository_config, Path::new("/etc/helm/repos.yaml"));
        assert_eq!(settings.repository_cache, Path::new("/var/cache/helm"));
        assert_eq!(settings.chart_cache_dir(), Path::new("/var/cache/khelm/charts"));
        assert_eq!(settings.git_cache_dir(), Path::new("/var/cache/khelm/git"));
        assert_eq!(settings.trust_any_repository, Some(true));
        assert!(settings.enable_git_getter);
    }

    #[test]
    fn test_trust_flag_unset_and_false() {
        let unset = Settings::from_lookup(lookup(&[
            (ENV_REPOSITORY_CONFIG, "/r.yaml"),
            (ENV_REPOSITORY_CACHE, "/c"),
            (ENV_CACHE_HOME, "/k"),
            (ENV_TRUST_ANY_REPO, ""),
        ]))
        .unwrap();
        assert_eq!(unset.trust_any_repository, None);
        assert!(!unset.enable_git_getter);

        let off = Settings::from_lookup(lookup(&[
            (ENV_REPOSITORY_CONFIG, "/r.yaml"),
            (ENV_REPOSITORY_CACHE, "/c"),
            (ENV_CACHE_HOME, "/k"),
            (ENV_TRUST_ANY_REPO, "false"),
        ]))
        .unwrap();
        assert_eq!(off.trust_any_repository, Some(false));
    }

    #[test]
    fn test_invalid_bool() {
        let err = Settings::from_lookup(lookup(&[
            (ENV_REPOSITORY_CONFIG, "/r.yaml"),
            (ENV_REPOSITORY_CACHE, "/c"),
            (ENV_CACHE_HOME, "/k"),
            (ENV_ENABLE_GIT_GETTER, "maybe"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains(ENV_ENABLE_GIT_GETTER));
    }

    #[test]
    fn test_with_home() {
        let settings = Settings::with_home(Path::new("/tmp/h"));
        assert_eq!(settings.http_cache_dir(), Path::new("/tmp/h/cache/http"));
        assert_eq!(settings.trust_any_repository, None);
    }
}
