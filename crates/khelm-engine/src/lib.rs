//! khelm Engine - chart rendering
//!
//! This crate turns a `ChartConfig` into Kubernetes resources:
//! - `Renderer`: the template renderer seam, with `JinjaRenderer` as the
//!   bundled MiniJinja implementation
//! - `ChartRenderer`: the pipeline from chart config to install-ordered
//!   resources

pub mod error;
pub mod filters;
pub mod jinja;
pub mod pipeline;
pub mod renderer;

pub use error::{EngineError, Result, TemplateError};
pub use jinja::JinjaRenderer;
pub use pipeline::ChartRenderer;
pub use renderer::{Capabilities, ReleaseOptions, RenderedTemplates, Renderer};
