//! Error types for repository operations

use khelm_core::{CoreError, ErrorKind};
use thiserror::Error;

/// Repository operation errors
#[derive(Debug, Error)]
pub enum RepoError {
    // ============ Trust Errors ============
    #[error(
        "Repository {url} is not registered in {config} and untrusted repositories are not allowed"
    )]
    UntrustedRepository { url: String, config: String },

    #[error("Repository alias {name:?} is not registered in {config}")]
    RepositoryNotRegistered { name: String, config: String },

    #[error("Invalid repository URL: {url} - {reason}")]
    InvalidRepositoryUrl { url: String, reason: String },

    #[error("Invalid repository file {path}: {message}")]
    InvalidRepositoryFile { path: String, message: String },

    // ============ Index Errors ============
    #[error("Invalid index format: {message}")]
    InvalidIndex { message: String },

    #[error("Invalid version constraint {constraint:?}: {message}")]
    InvalidVersionConstraint { constraint: String, message: String },

    #[error("Chart {name}{} not found in repository {repo}", version_suffix(.version))]
    ChartNotFound {
        name: String,
        version: String,
        repo: String,
    },

    // ============ Download Errors ============
    #[error(
        "Refusing to cache chart {name} {version}: digest {digest:?} is missing or shorter than 16 hex characters"
    )]
    InvalidDigest {
        name: String,
        version: String,
        digest: String,
    },

    #[error("Integrity check failed for {name}: expected {expected}, got {actual}")]
    IntegrityCheckFailed {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Signature verification failed for {name}: {message}")]
    SignatureVerification { name: String, message: String },

    #[error("No getter registered for URL scheme of {url}")]
    UnsupportedScheme { url: String },

    // ============ Network Errors ============
    #[error("HTTP error: {status} - GET {url}")]
    Http { status: u16, url: String },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Git error: {message}")]
    Git { message: String },

    #[error("OCI registry error: {message}")]
    Oci { message: String },

    // ============ Dependency Errors ============
    #[error(
        "Dependency lock file {path} of chart {chart} is out of sync with its requirements, run `helm dependency update`"
    )]
    LockOutOfSync { chart: String, path: String },

    #[error("Possible cyclic dependency: chart {chart} exceeds the maximum dependency depth of {depth}")]
    CyclicDependency { chart: String, depth: usize },

    // ============ Other ============
    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An error annotated with the operation and the resource it concerned
    #[error("{context}")]
    Context {
        context: String,
        #[source]
        source: Box<RepoError>,
    },
}

fn version_suffix(version: &str) -> String {
    if version.is_empty() {
        String::new()
    } else {
        format!(" {}", version)
    }
}

/// Result type for repository operations
pub type Result<T> = std::result::Result<T, RepoError>;

impl RepoError {
    /// Category of the innermost error
    pub fn kind(&self) -> ErrorKind {
        match self {
            RepoError::Context { source, .. } => source.kind(),
            RepoError::UntrustedRepository { .. } => ErrorKind::UntrustedRepository,
            RepoError::RepositoryNotRegistered { .. } => ErrorKind::RepositoryNotRegistered,
            RepoError::InvalidRepositoryUrl { .. }
            | RepoError::InvalidRepositoryFile { .. }
            | RepoError::InvalidVersionConstraint { .. }
            | RepoError::UnsupportedScheme { .. } => ErrorKind::Config,
            RepoError::ChartNotFound { .. } => ErrorKind::NotFound,
            RepoError::Http { status: 404, .. } => ErrorKind::NotFound,
            RepoError::Http { .. } | RepoError::Network { .. } | RepoError::Oci { .. } => {
                ErrorKind::Network
            }
            RepoError::LockOutOfSync { .. } => ErrorKind::LockOutOfSync,
            RepoError::CyclicDependency { .. } => ErrorKind::CyclicDependency,
            RepoError::Cancelled => ErrorKind::Cancelled,
            RepoError::Core(e) => e.kind(),
            RepoError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            RepoError::Io(_) => ErrorKind::Io,
            RepoError::InvalidIndex { .. }
            | RepoError::InvalidDigest { .. }
            | RepoError::IntegrityCheckFailed { .. }
            | RepoError::SignatureVerification { .. }
            | RepoError::Git { .. }
            | RepoError::Serialization(_) => ErrorKind::Other,
        }
    }

    pub fn is_untrusted_repository(&self) -> bool {
        self.kind() == ErrorKind::UntrustedRepository
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }

    /// Wrap with a description of the failed operation
    pub fn context(self, context: impl Into<String>) -> Self {
        RepoError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// `.context()` on results, mirroring [`RepoError::context`]
pub trait ResultExt<T> {
    fn context<C: Into<String>>(self, context: C) -> Result<T>;
    fn with_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T>;
}

impl<T, E: Into<RepoError>> ResultExt<T> for std::result::Result<T, E> {
    fn context<C: Into<String>>(self, context: C) -> Result<T> {
        self.map_err(|e| e.into().context(context))
    }

    fn with_context<C: Into<String>, F: FnOnce() -> C>(self, f: F) -> Result<T> {
        self.map_err(|e| e.into().context(f()))
    }
}

impl From<reqwest::Error> for RepoError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            RepoError::Http {
                status: status.as_u16(),
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
            }
        } else if e.is_connect() {
            RepoError::Network {
                message: format!("Connection failed: {}", e),
            }
        } else {
            RepoError::Network {
                message: e.to_string(),
            }
        }
    }
}

impl From<serde_yaml::Error> for RepoError {
    fn from(e: serde_yaml::Error) -> Self {
        RepoError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for RepoError {
    fn from(e: serde_json::Error) -> Self {
        RepoError::Serialization(e.to_string())
    }
}

impl From<url::ParseError> for RepoError {
    fn from(e: url::ParseError) -> Self {
        RepoError::InvalidRepositoryUrl {
            url: String::new(),
            reason: e.to_string(),
        }
    }
}

impl From<tempfile::PersistError> for RepoError {
    fn from(e: tempfile::PersistError) -> Self {
        RepoError::Io(e.error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_kind_looks_through_context() {
        let err = RepoError::UntrustedRepository {
            url: "https://example.com".into(),
            config: "repositories.yaml".into(),
        }
        .context("resolve chart nginx")
        .context("render release web");

        assert!(err.is_untrusted_repository());
        assert_eq!(err.to_string(), "render release web");
        let cause = err.source().and_then(|e| e.source()).unwrap();
        assert!(cause.to_string().contains("https://example.com"));
    }

    #[test]
    fn test_chart_not_found_message() {
        let err = RepoError::ChartNotFound {
            name: "nginx".into(),
            version: "1.x".into(),
            repo: "https://charts.example.com".into(),
        };
        assert_eq!(
            err.to_string(),
            "Chart nginx 1.x not found in repository https://charts.example.com"
        );
        assert!(err.is_not_found());

        let latest = RepoError::ChartNotFound {
            name: "nginx".into(),
            version: String::new(),
            repo: "r".into(),
        };
        assert_eq!(latest.to_string(), "Chart nginx not found in repository r");
    }

    #[test]
    fn test_result_ext() {
        let res: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        let err = res.context("read index").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "read index");
    }
}
