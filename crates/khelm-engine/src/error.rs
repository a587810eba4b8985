//! Engine error types

use miette::{Diagnostic, NamedSource, SourceSpan};
use thiserror::Error;

use khelm_core::{CoreError, ErrorKind};
pub use khelm_repo::RepoError;

use crate::filters::AVAILABLE_FILTERS;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Render canceled")]
    Cancelled,

    #[error("{context}")]
    Context {
        context: String,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Template(_) => ErrorKind::Other,
            EngineError::Repo(e) => e.kind(),
            EngineError::Core(e) => e.kind(),
            EngineError::Io(_) => ErrorKind::Io,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::Context { source, .. } => source.kind(),
        }
    }

    pub fn is_untrusted_repository(&self) -> bool {
        self.kind() == ErrorKind::UntrustedRepository
    }

    pub fn context(self, context: impl Into<String>) -> Self {
        EngineError::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// A template that failed to parse or render, with its source for display
#[derive(Error, Debug, Diagnostic, Clone)]
#[error("{template}: {message}")]
#[diagnostic(code(khelm::template::render))]
pub struct TemplateError {
    pub template: String,

    pub message: String,

    #[source_code]
    pub src: NamedSource<String>,

    #[label("error occurred here")]
    pub span: Option<SourceSpan>,

    #[help]
    pub suggestion: Option<String>,
}

impl TemplateError {
    pub fn from_minijinja(err: &minijinja::Error, template: &str, source: &str) -> Self {
        let message = match err.detail() {
            Some(detail) => format!("{}: {}", err.kind(), detail),
            None => err.kind().to_string(),
        };
        let line = err.line();
        Self {
            template: template.to_string(),
            message,
            src: NamedSource::new(template, source.to_string()),
            span: line.and_then(|l| line_span(source, l)),
            suggestion: suggest(err, line.and_then(|l| source.lines().nth(l.saturating_sub(1)))),
        }
    }
}

fn line_span(source: &str, line_num: usize) -> Option<SourceSpan> {
    let mut offset = 0;
    for (i, line) in source.lines().enumerate() {
        if i + 1 == line_num {
            return Some(SourceSpan::new(offset.into(), line.len()));
        }
        offset += line.len() + 1;
    }
    None
}

fn suggest(err: &minijinja::Error, line: Option<&str>) -> Option<String> {
    match err.kind() {
        minijinja::ErrorKind::UnknownFilter => {
            let line = line?;
            line.split('|')
                .skip(1)
                .filter_map(|part| {
                    let name: String = part
                        .trim_start()
                        .chars()
                        .take_while(|c| c.is_alphanumeric() || *c == '_')
                        .collect();
                    (!name.is_empty() && !AVAILABLE_FILTERS.contains(&name.as_str()))
                        .then_some(name)
                })
                .find_map(|name| closest_filter(&name))
                .map(|(name, closest)| format!("`{}` is not a filter, did you mean `{}`?", name, closest))
        }
        minijinja::ErrorKind::UndefinedError => {
            let line = line?;
            if line.contains("value.") || line.contains("Values.") {
                Some("chart values are available as `values`".to_string())
            } else {
                None
            }
        }
        _ => None,
    }
}

fn closest_filter(name: &str) -> Option<(String, &'static str)> {
    AVAILABLE_FILTERS
        .iter()
        .map(|f| (strsim::levenshtein(name, f), *f))
        .filter(|(d, _)| *d <= 2)
        .min_by_key(|(d, _)| *d)
        .map(|(_, f)| (name.to_string(), f))
}
