//! CLI error type with exit code handling

use miette::Diagnostic;
use thiserror::Error;

use khelm_core::{CoreError, ErrorKind};
use khelm_engine::{EngineError, TemplateError};

use crate::exit_codes;

const UNTRUSTED_REPOSITORY_HELP: &str = "Register the repository with `helm repo add <name> <url>`, \
or set KHELM_TRUST_ANY_REPO=true to allow any repository";

#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Template(TemplateError),

    #[error("{message}")]
    #[diagnostic(code(khelm::cli::render))]
    Render {
        message: String,
        kind: ErrorKind,
        #[help]
        help: Option<String>,
    },

    #[error("Invalid input: {message}")]
    #[diagnostic(code(khelm::cli::input))]
    Input { message: String },

    #[error("IO error: {message}")]
    #[diagnostic(code(khelm::cli::io))]
    Io { message: String },
}

pub type Result<T> = std::result::Result<T, CliError>;

impl CliError {
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::Template(_) => exit_codes::TEMPLATE_ERROR,
            CliError::Input { .. } => exit_codes::USAGE_ERROR,
            CliError::Io { .. } => exit_codes::IO_ERROR,
            CliError::Render { kind, .. } => match kind {
                ErrorKind::Config => exit_codes::USAGE_ERROR,
                ErrorKind::UntrustedRepository | ErrorKind::RepositoryNotRegistered => {
                    exit_codes::REPOSITORY_ERROR
                }
                ErrorKind::NotFound | ErrorKind::LockOutOfSync | ErrorKind::CyclicDependency => {
                    exit_codes::CHART_ERROR
                }
                ErrorKind::Validation => exit_codes::VALIDATION_ERROR,
                ErrorKind::Cancelled => exit_codes::CANCELLED,
                ErrorKind::Network => exit_codes::NETWORK_ERROR,
                ErrorKind::Io => exit_codes::IO_ERROR,
                ErrorKind::Other => exit_codes::ERROR,
            },
        }
    }

    pub fn input(message: impl Into<String>) -> Self {
        Self::Input {
            message: message.into(),
        }
    }

    /// Convert a render failure
    ///
    /// Without `debug` only the outermost message and the root cause are
    /// shown; with it every layer of the cause chain.
    pub fn from_engine(err: EngineError, debug: bool) -> Self {
        if let Some(template) = find_template_error(&err) {
            return CliError::Template(template.clone());
        }
        let kind = err.kind();
        let help = (kind == ErrorKind::UntrustedRepository)
            .then(|| UNTRUSTED_REPOSITORY_HELP.to_string());
        CliError::Render {
            message: describe(&err, debug),
            kind,
            help,
        }
    }

    pub fn from_core(err: CoreError, debug: bool) -> Self {
        Self::from_engine(EngineError::Core(err), debug)
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::Io {
            message: err.to_string(),
        }
    }
}

fn find_template_error(err: &EngineError) -> Option<&TemplateError> {
    match err {
        EngineError::Template(t) => Some(t),
        EngineError::Context { source, .. } => find_template_error(source),
        _ => None,
    }
}

fn describe(err: &dyn std::error::Error, debug: bool) -> String {
    let mut message = err.to_string();
    let mut causes = Vec::new();
    let mut source = err.source();
    while let Some(cause) = source {
        causes.push(cause.to_string());
        source = cause.source();
    }

    if debug {
        for cause in causes {
            message.push_str("\n  caused by: ");
            message.push_str(&cause);
        }
    } else if let Some(root) = causes.last()
        && !message.contains(root.as_str())
    {
        message.push_str(": ");
        message.push_str(root);
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layered() -> EngineError {
        EngineError::Core(CoreError::ChartNotFound {
            path: "/charts/app".to_string(),
        })
        .context("load chart app")
        .context("render generator app")
    }

    #[test]
    fn test_default_shows_outermost_and_root() {
        let err = CliError::from_engine(layered(), false);
        assert_eq!(
            err.to_string(),
            "render generator app: Chart not found: /charts/app"
        );
        assert_eq!(err.exit_code(), exit_codes::CHART_ERROR);
    }

    #[test]
    fn test_debug_shows_full_chain() {
        let err = CliError::from_engine(layered(), true);
        assert_eq!(
            err.to_string(),
            "render generator app\n  caused by: load chart app\n  caused by: Chart not found: /charts/app"
        );
    }

    #[test]
    fn test_untrusted_repository_has_help() {
        let err = EngineError::Repo(khelm_engine::error::RepoError::UntrustedRepository {
            url: "https://charts.example.com".to_string(),
            config: "/home/me/.config/helm/repositories.yaml".to_string(),
        });
        let err = CliError::from_engine(err.context("resolve chart"), false);
        assert_eq!(err.exit_code(), exit_codes::REPOSITORY_ERROR);
        assert_eq!(err.help().map(|h| h.to_string()), Some(UNTRUSTED_REPOSITORY_HELP.to_string()));
    }
}
