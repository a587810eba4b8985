//! khelm Repo - chart repositories and dependency building
//!
//! - `Repositories`: the repository configuration file and its trust policy
//! - `RepositoryIndexCache`: cached repository indices and version resolution
//! - `ChartLocator`: downloading and verifying chart archives into the cache
//! - `LocalChartDependencyResolver`: building `charts/` of local chart trees
//! - `Getters`: scheme-keyed transports (`http(s)`, `git+`, `oci`)

pub mod dependency;
pub mod error;
pub mod getter;
pub mod index;
pub mod index_cache;
pub mod locator;
pub mod repositories;

pub use dependency::{LocalChartDependencyResolver, MAX_DEPENDENCY_DEPTH};
pub use error::{RepoError, Result, ResultExt};
pub use getter::{ChartDownloader, Getter, Getters, IndexFetcher};
pub use index::{ChartVersion, IndexFile, VersionConstraint, is_version_range};
pub use index_cache::{RepositoryIndexCache, ResolvedChart};
pub use locator::ChartLocator;
pub use repositories::{Repositories, RepositoryEntry};
