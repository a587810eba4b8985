//! Core error types

use thiserror::Error;

/// Stable error category shared by all khelm crates
///
/// Front-ends decide how to present a failure by inspecting the kind,
/// never the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid or conflicting chart configuration
    Config,
    /// Repository URL is not registered and untrusted repositories are not allowed
    UntrustedRepository,
    /// `@alias` repository reference without a registered entry
    RepositoryNotRegistered,
    /// Chart, version or file not found
    NotFound,
    /// Dependency lock file does not match the declared requirements
    LockOutOfSync,
    /// Local dependency recursion exceeded the depth limit
    CyclicDependency,
    /// Rendered resources violate the configured selectors or scope policy
    Validation,
    /// Operation aborted by the caller
    Cancelled,
    Network,
    Io,
    Other,
}

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Chart not found: {path}")]
    ChartNotFound { path: String },

    #[error("Invalid chart {path}: {message}")]
    InvalidChart { path: String, message: String },

    #[error("Invalid chart config: {}", .errors.join("; "))]
    InvalidConfig { errors: Vec<String> },

    #[error("Failed to read resource from {template}: {message}")]
    ManifestDecode { template: String, message: String },

    #[error("Cluster-scoped resources are not allowed when namespacedOnly is enabled:\n  {}", .resources.join("\n  "))]
    ClusterScopedResources { resources: Vec<String> },

    #[error("{set} selectors did not match any resource:\n  {}", .selectors.join("\n  "))]
    UnmatchedSelectors {
        set: &'static str,
        selectors: Vec<String>,
    },

    #[error("Archive error: {message}")]
    Archive { message: String },

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid version: {0}")]
    InvalidVersion(#[from] semver::Error),

    #[error("Values error: {message}")]
    Values { message: String },
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::ChartNotFound { .. } => ErrorKind::NotFound,
            CoreError::InvalidConfig { .. } | CoreError::Values { .. } => ErrorKind::Config,
            CoreError::ClusterScopedResources { .. } | CoreError::UnmatchedSelectors { .. } => {
                ErrorKind::Validation
            }
            CoreError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            CoreError::Io(_) => ErrorKind::Io,
            CoreError::InvalidChart { .. }
            | CoreError::ManifestDecode { .. }
            | CoreError::Archive { .. }
            | CoreError::YamlParse(_)
            | CoreError::JsonParse(_)
            | CoreError::InvalidVersion(_) => ErrorKind::Other,
        }
    }

    pub(crate) fn invalid_chart(path: &std::path::Path, message: impl Into<String>) -> Self {
        CoreError::InvalidChart {
            path: path.display().to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
