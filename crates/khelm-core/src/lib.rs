//! khelm Core - chart configuration, chart loading and manifest post-processing
//!
//! This crate provides the types shared by every khelm front-end:
//! - `ChartConfig`: one chart render request (locator + renderer options)
//! - `Settings`: explicitly constructed cache/repository locations and trust flags
//! - `LoadedChart`: a chart directory or archive with its requirements and lock
//! - `ManifestTransformer`: filtering, namespace policy and install ordering
//! - `OutputPathAnnotator`: per-resource output paths for kpt functions

pub mod archive;
pub mod chart;
pub mod config;
pub mod error;
pub mod kinds;
pub mod output;
pub mod resource;
pub mod selector;
pub mod settings;
pub mod transform;
pub mod values;

pub use chart::{
    ChartDefinition, ChartDependency, ChartLock, ChartMetadata, LoadedChart, LockedDependency,
};
pub use config::{ChartConfig, GeneratorConfig, LoaderConfig, RendererConfig};
pub use error::{CoreError, ErrorKind, Result};
pub use kinds::{KindScope, sort_by_install_order};
pub use output::OutputPathAnnotator;
pub use resource::{ManifestResource, ResourceId};
pub use selector::{ResourceMatchers, ResourceSelector};
pub use settings::Settings;
pub use transform::ManifestTransformer;
pub use values::Values;
