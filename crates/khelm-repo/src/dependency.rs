//! Building the dependencies of a local chart
//!
//! The chart tree is walked depth-first through `file://` dependencies. A
//! chart is rebuilt when its lock is missing, does not match its
//! requirements, an archive in `charts/` is missing, or it has any local
//! dependency (local charts may have changed, there is no staleness check).
//! Rebuilding packages local dependencies and downloads remote ones into
//! `charts/`, bottom-up, so parents package their children's fresh archives.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use khelm_core::LoadedChart;
use khelm_core::chart::{
    ChartDefinition, ChartDependency, ChartLock, LockedDependency, archive_name,
    find_dependency_archives, package_chart,
};

use crate::error::{RepoError, Result, ResultExt};
use crate::getter::http::write_atomic;
use crate::index_cache::RepositoryIndexCache;
use crate::locator::ChartLocator;
use crate::repositories::RepositoryEntry;

/// Deeper `file://` chains are reported as a probable cycle
pub const MAX_DEPENDENCY_DEPTH: usize = 20;

/// A chart of the local tree, as discovered by the walk
#[derive(Debug, Clone)]
pub struct LocalChart {
    pub definition: ChartDefinition,
    pub has_local_dependencies: bool,
}

/// Everything the walk below one chart discovered
#[derive(Debug, Default)]
struct Collected {
    /// Charts in build order: dependencies before their dependents
    charts: Vec<LocalChart>,
    /// Repositories of remote dependencies
    repositories: Vec<String>,
    /// A chart with remote dependencies has no lock
    needs_index_refresh: bool,
}

impl Collected {
    fn merge(&mut self, other: Collected) {
        self.charts.extend(other.charts);
        self.repositories.extend(other.repositories);
        self.needs_index_refresh |= other.needs_index_refresh;
    }
}

fn collect(dir: &Path, depth: usize) -> Result<Collected> {
    let definition =
        ChartDefinition::load(dir).with_context(|| format!("load chart {}", dir.display()))?;
    if depth > MAX_DEPENDENCY_DEPTH {
        return Err(RepoError::CyclicDependency {
            chart: definition.name().to_string(),
            depth: MAX_DEPENDENCY_DEPTH,
        });
    }

    let mut collected = Collected::default();
    let mut has_local_dependencies = false;
    for dep in &definition.requirements {
        if let Some(local) = dep.local_path() {
            has_local_dependencies = true;
            collected.merge(collect(&dir.join(local), depth + 1)?);
        } else if !dep.repository.is_empty() {
            collected.repositories.push(dep.repository.clone());
            if definition.lock.is_none() {
                collected.needs_index_refresh = true;
            }
        }
    }

    collected.charts.push(LocalChart {
        definition,
        has_local_dependencies,
    });
    Ok(collected)
}

/// Walk a chart tree without building anything, in build order
pub fn collect_local_charts(dir: &Path) -> Result<Vec<LocalChart>> {
    Ok(collect(dir, 0)?.charts)
}

/// Whether a chart's `charts/` directory matches its lock
pub fn dependencies_in_sync(definition: &ChartDefinition) -> Result<bool> {
    if definition.requirements.is_empty() {
        return Ok(true);
    }
    if definition.lock_in_sync()? != Some(true) {
        return Ok(false);
    }
    Ok(definition.missing_dependencies().is_empty())
}

pub struct LocalChartDependencyResolver<'a> {
    index: &'a mut RepositoryIndexCache,
    locator: &'a ChartLocator,
}

impl<'a> LocalChartDependencyResolver<'a> {
    pub fn new(index: &'a mut RepositoryIndexCache, locator: &'a ChartLocator) -> Self {
        Self { index, locator }
    }

    /// Load a local chart, building stale dependencies first
    pub async fn load(&mut self, dir: &Path, cancel: &CancellationToken) -> Result<LoadedChart> {
        let mut chart =
            LoadedChart::load(dir).with_context(|| format!("load chart {}", dir.display()))?;
        let collected = collect(dir, 0)?;

        // only the repositories the tree declares, each passed through the trust policy
        let mut repositories = BTreeMap::new();
        for repository in &collected.repositories {
            if !repositories.contains_key(repository) {
                let entry = self.index.repositories().get(repository).with_context(|| {
                    format!("resolve dependency repository {}", repository)
                })?;
                repositories.insert(repository.clone(), entry);
            }
        }

        if collected.needs_index_refresh {
            for entry in repositories.values().filter(|e| !e.is_oci()) {
                self.index.update_index(entry, cancel).await?;
            }
        }

        let mut built = HashSet::new();
        let mut rebuilt = false;
        for local in &collected.charts {
            let key = std::fs::canonicalize(&local.definition.root)
                .unwrap_or_else(|_| local.definition.root.clone());
            if !built.insert(key) {
                continue;
            }
            if local.definition.requirements.is_empty() {
                continue;
            }
            if !local.has_local_dependencies && dependencies_in_sync(&local.definition)? {
                tracing::debug!("dependencies of chart {} are up to date", local.definition.name());
                continue;
            }
            self.build(&local.definition, &repositories, cancel)
                .await
                .with_context(|| format!("build dependencies of chart {}", local.definition.name()))?;
            rebuilt = true;
        }

        if rebuilt {
            chart = LoadedChart::load(dir).with_context(|| format!("reload chart {}", dir.display()))?;
        }
        Ok(chart)
    }

    /// Build one chart's `charts/`, refreshing indices and retrying once when a
    /// dependency is missing from its repository index
    async fn build(
        &mut self,
        definition: &ChartDefinition,
        repositories: &BTreeMap<String, RepositoryEntry>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if definition.lock_in_sync()? == Some(false) {
            return Err(RepoError::LockOutOfSync {
                chart: definition.name().to_string(),
                path: definition.lock_path().display().to_string(),
            });
        }

        tracing::info!("building dependencies of chart {}", definition.name());
        match self.build_once(definition, repositories, cancel).await {
            Err(RepoError::ChartNotFound { name, version, repo })
                if repositories.values().any(|e| e.url == repo) =>
            {
                tracing::debug!(
                    "{} {} not in cached index of {}, refreshing repository indices and retrying",
                    name,
                    version,
                    repo
                );
                let mut refreshed = HashSet::new();
                for dep in &definition.requirements {
                    if let Some(entry) = repositories.get(&dep.repository).filter(|e| !e.is_oci())
                        && refreshed.insert(entry.url.clone())
                    {
                        self.index.update_index(entry, cancel).await?;
                    }
                }
                self.build_once(definition, repositories, cancel).await
            }
            res => res,
        }
    }

    async fn build_once(
        &mut self,
        definition: &ChartDefinition,
        repositories: &BTreeMap<String, RepositoryEntry>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let charts_dir = definition.charts_dir();
        std::fs::create_dir_all(&charts_dir)?;

        let mut locked = Vec::new();
        for dep in &definition.requirements {
            if cancel.is_cancelled() {
                return Err(RepoError::Cancelled);
            }
            if charts_dir.join(&dep.name).join(khelm_core::chart::CHART_FILE).is_file() {
                tracing::debug!("keeping unpacked dependency {} of {}", dep.name, definition.name());
                continue;
            }

            let locked_dep = if let Some(local) = dep.local_path() {
                self.package_local(definition, dep, &definition.root.join(local))?
            } else if let Some(entry) = repositories.get(&dep.repository) {
                self.fetch_remote(definition, dep, entry, cancel).await?
            } else {
                return Err(RepoError::ChartNotFound {
                    name: dep.name.clone(),
                    version: dep.version.clone(),
                    repo: format!("{} (no repository declared)", charts_dir.display()),
                });
            };

            remove_stale_archives(&charts_dir, &dep.name, &locked_dep.version)?;
            locked.push(locked_dep);
        }

        if definition.lock.is_none() {
            let lock = ChartLock::new(&definition.requirements, locked)?;
            definition.save_lock(&lock)?;
            tracing::info!("wrote {}", definition.lock_path().display());
        }
        Ok(())
    }

    fn package_local(
        &self,
        definition: &ChartDefinition,
        dep: &ChartDependency,
        dep_dir: &Path,
    ) -> Result<LockedDependency> {
        let archive = package_chart(dep_dir, &definition.charts_dir())
            .with_context(|| format!("package local dependency {}", dep_dir.display()))?;
        let packaged = ChartDefinition::load(dep_dir)?;
        tracing::debug!("packaged {} into {}", dep.name, archive.display());
        Ok(LockedDependency {
            name: dep.name.clone(),
            version: packaged.version().to_string(),
            repository: dep.repository.clone(),
        })
    }

    async fn fetch_remote(
        &mut self,
        definition: &ChartDefinition,
        dep: &ChartDependency,
        entry: &RepositoryEntry,
        cancel: &CancellationToken,
    ) -> Result<LockedDependency> {
        let version = definition
            .lock
            .as_ref()
            .and_then(|l| l.locked_version(&dep.name))
            .unwrap_or(&dep.version)
            .to_string();

        // index refreshes are decided by the caller: once up front for unlocked
        // charts, once on a miss
        let resolved = self.index.find_cached(entry, &dep.name, &version, cancel).await?;
        let cached = self.locator.locate(&resolved, None, cancel).await?;
        let dest = definition
            .charts_dir()
            .join(archive_name(&dep.name, &resolved.chart.version));
        write_atomic(&dest, &std::fs::read(&cached)?)?;

        Ok(LockedDependency {
            name: dep.name.clone(),
            version: resolved.chart.version.clone(),
            repository: dep.repository.clone(),
        })
    }
}

fn remove_stale_archives(charts_dir: &Path, name: &str, version: &str) -> Result<()> {
    let current: PathBuf = charts_dir.join(archive_name(name, version));
    for archive in find_dependency_archives(charts_dir, name) {
        if archive != current {
            tracing::debug!("removing stale dependency archive {}", archive.display());
            std::fs::remove_file(&archive)?;
        }
    }
    Ok(())
}
