//! Chart definition and loading
//!
//! A chart is a directory (or a `.tgz` of one) with:
//! - `Chart.yaml` - metadata; `apiVersion: v2` charts also declare dependencies here
//! - `requirements.yaml` - dependencies of `apiVersion: v1` charts
//! - `Chart.lock` / `requirements.lock` - resolved dependency versions + digest
//! - `values.yaml` - default values
//! - `templates/` - templates handed to the renderer
//! - `charts/` - sub-chart directories and archives

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use crate::archive;
use crate::error::{CoreError, Result};
use crate::values::Values;

pub const CHART_FILE: &str = "Chart.yaml";
pub const REQUIREMENTS_FILE: &str = "requirements.yaml";
pub const LOCK_FILE: &str = "Chart.lock";
pub const REQUIREMENTS_LOCK_FILE: &str = "requirements.lock";
pub const VALUES_FILE: &str = "values.yaml";

/// Contents of `Chart.yaml`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    #[serde(default = "default_api_version")]
    pub api_version: String,

    pub name: String,

    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// `application` or `library`
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub chart_type: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<ChartDependency>,
}

fn default_api_version() -> String {
    "v1".to_string()
}

/// A declared chart dependency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChartDependency {
    pub name: String,

    /// Version constraint
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    /// `file://`, `http(s)://`, `oci://` URL or `@alias` / `alias:name`
    #[serde(default)]
    pub repository: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl ChartDependency {
    /// Name the sub-chart's values and templates are scoped under
    pub fn effective_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Directory of a `file://` dependency
    pub fn local_path(&self) -> Option<&str> {
        self.repository.strip_prefix("file://")
    }

    pub fn is_local(&self) -> bool {
        self.local_path().is_some()
    }
}

/// `requirements.yaml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub dependencies: Vec<ChartDependency>,
}

/// A dependency pinned by the lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedDependency {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default)]
    pub repository: String,
}

/// `Chart.lock` / `requirements.lock`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartLock {
    #[serde(default)]
    pub dependencies: Vec<LockedDependency>,

    /// Digest over the declared requirements and the locked dependencies
    pub digest: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated: Option<String>,
}

impl ChartLock {
    pub fn new(requirements: &[ChartDependency], dependencies: Vec<LockedDependency>) -> Result<Self> {
        let digest = requirements_digest(requirements, &dependencies)?;
        Ok(Self {
            dependencies,
            digest,
            generated: Some(chrono::Utc::now().to_rfc3339()),
        })
    }

    pub fn locked_version(&self, name: &str) -> Option<&str> {
        self.dependencies
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.version.as_str())
    }
}

/// Digest binding the declared requirements to the locked versions
///
/// `sha256:` + hex SHA-256 of the JSON array `[requirements, locked]`,
/// encoded the way Helm encodes it so Helm-generated locks stay in sync.
pub fn requirements_digest(
    requirements: &[ChartDependency],
    locked: &[LockedDependency],
) -> Result<String> {
    let json = serde_json::to_string(&(requirements, locked))?;
    Ok(archive::sha256_digest(escape_html(&json).as_bytes()))
}

/// Escape `<`, `>`, `&`, U+2028 and U+2029 like Go's `json.Marshal`
///
/// These characters can only occur inside JSON strings, so replacing them
/// in the encoded output keeps the document valid.
fn escape_html(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    for c in json.chars() {
        match c {
            '<' => out.push_str("\\u003c"),
            '>' => out.push_str("\\u003e"),
            '&' => out.push_str("\\u0026"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c => out.push(c),
        }
    }
    out
}

/// Chart metadata, requirements and lock read from a chart directory
///
/// This does not load templates, values or sub-charts, so it works on trees
/// whose `charts/` content is stale or missing.
#[derive(Debug, Clone)]
pub struct ChartDefinition {
    pub root: PathBuf,
    pub metadata: ChartMetadata,
    pub requirements: Vec<ChartDependency>,
    pub lock: Option<ChartLock>,
}

impl ChartDefinition {
    pub fn load(root: &Path) -> Result<Self> {
        let chart_file = root.join(CHART_FILE);
        if !chart_file.is_file() {
            return Err(CoreError::ChartNotFound {
                path: root.display().to_string(),
            });
        }

        let content = std::fs::read_to_string(&chart_file)?;
        let metadata: ChartMetadata = serde_yaml::from_str(&content)
            .map_err(|e| CoreError::invalid_chart(&chart_file, e.to_string()))?;
        if metadata.name.is_empty() {
            return Err(CoreError::invalid_chart(&chart_file, "chart name is empty"));
        }

        let requirements = if metadata.api_version == "v1" {
            let path = root.join(REQUIREMENTS_FILE);
            if path.is_file() {
                let content = std::fs::read_to_string(&path)?;
                let parsed: Requirements = from_yaml_or_default(&content)
                    .map_err(|e| CoreError::invalid_chart(&path, e.to_string()))?;
                parsed.dependencies
            } else {
                Vec::new()
            }
        } else {
            metadata.dependencies.clone()
        };

        let lock_path = root.join(lock_file_name(&metadata.api_version));
        let lock = if lock_path.is_file() {
            let content = std::fs::read_to_string(&lock_path)?;
            let lock: ChartLock = serde_yaml::from_str(&content)
                .map_err(|e| CoreError::invalid_chart(&lock_path, e.to_string()))?;
            Some(lock)
        } else {
            None
        };

        Ok(Self {
            root: root.to_path_buf(),
            metadata,
            requirements,
            lock,
        })
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn version(&self) -> &str {
        &self.metadata.version
    }

    pub fn charts_dir(&self) -> PathBuf {
        self.root.join("charts")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(lock_file_name(&self.metadata.api_version))
    }

    pub fn has_local_dependencies(&self) -> bool {
        self.requirements.iter().any(ChartDependency::is_local)
    }

    /// `Some(false)` when the lock digest does not match the requirements
    pub fn lock_in_sync(&self) -> Result<Option<bool>> {
        match &self.lock {
            None => Ok(None),
            Some(lock) => {
                let digest = requirements_digest(&self.requirements, &lock.dependencies)?;
                Ok(Some(archive::digest_matches(&lock.digest, &digest)))
            }
        }
    }

    /// Declared dependencies without a matching archive or directory in `charts/`
    pub fn missing_dependencies(&self) -> Vec<&ChartDependency> {
        let charts_dir = self.charts_dir();
        self.requirements
            .iter()
            .filter(|dep| {
                if charts_dir.join(&dep.name).join(CHART_FILE).is_file() {
                    return false;
                }
                match self.lock.as_ref().and_then(|l| l.locked_version(&dep.name)) {
                    Some(version) => !charts_dir.join(archive_name(&dep.name, version)).is_file(),
                    None => find_dependency_archives(&charts_dir, &dep.name).is_empty(),
                }
            })
            .collect()
    }

    pub fn save_lock(&self, lock: &ChartLock) -> Result<()> {
        let content = serde_yaml::to_string(lock)?;
        std::fs::write(self.lock_path(), content)?;
        Ok(())
    }
}

/// Deserialize the first YAML document, or `T::default()` for an empty file
fn from_yaml_or_default<T: DeserializeOwned + Default>(content: &str) -> serde_yaml::Result<T> {
    match serde_yaml::Deserializer::from_str(content).next() {
        None => Ok(T::default()),
        Some(document) => Option::<T>::deserialize(document).map(Option::unwrap_or_default),
    }
}

fn lock_file_name(api_version: &str) -> &'static str {
    if api_version == "v1" {
        REQUIREMENTS_LOCK_FILE
    } else {
        LOCK_FILE
    }
}

/// `<name>-<version>.tgz`
pub fn archive_name(name: &str, version: &str) -> String {
    format!("{}-{}.tgz", name, version)
}

/// Parse a version, tolerating a leading `v`
pub fn parse_version(version: &str) -> Option<semver::Version> {
    let version = version.trim();
    semver::Version::parse(version.strip_prefix('v').unwrap_or(version)).ok()
}

/// Archives in `charts_dir` named `<name>-<semver>.tgz`
pub fn find_dependency_archives(charts_dir: &Path, name: &str) -> Vec<PathBuf> {
    let prefix = format!("{}-", name);
    let Ok(entries) = std::fs::read_dir(charts_dir) else {
        return Vec::new();
    };
    let mut found: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .and_then(|n| n.strip_prefix(&prefix).map(|rest| rest.to_string()))
                .and_then(|rest| rest.strip_suffix(".tgz").map(|v| v.to_string()))
                .is_some_and(|version| parse_version(&version).is_some())
        })
        .collect();
    found.sort();
    found
}

/// Package a chart directory as `<dest_dir>/<name>-<version>.tgz`
///
/// The archive is written to a temp file first and renamed into place.
pub fn package_chart(chart_dir: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let definition = ChartDefinition::load(chart_dir)?;
    let data = archive::pack_directory(chart_dir, definition.name())?;

    std::fs::create_dir_all(dest_dir)?;
    let dest = dest_dir.join(archive_name(definition.name(), definition.version()));
    let mut tmp = tempfile::NamedTempFile::new_in(dest_dir)?;
    std::io::Write::write_all(&mut tmp, &data)?;
    tmp.persist(&dest).map_err(|e| CoreError::Io(e.error))?;

    tracing::debug!("packaged {} to {}", chart_dir.display(), dest.display());
    Ok(dest)
}

/// A chart ready to be rendered
#[derive(Debug, Clone)]
pub struct LoadedChart {
    pub definition: ChartDefinition,
    pub values: Values,
    pub subcharts: Vec<LoadedChart>,
    /// Keeps the extraction directory of an archive alive
    _extracted: Option<Arc<TempDir>>,
}

impl LoadedChart {
    /// Load a chart directory or `.tgz` archive, including its sub-charts
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.is_dir() {
            Self::load_dir(path, None)
        } else if path.is_file() {
            Self::load_archive(path)
        } else {
            Err(CoreError::ChartNotFound {
                path: path.display().to_string(),
            })
        }
    }

    fn load_archive(path: &Path) -> Result<Self> {
        let tmp = TempDir::new()?;
        archive::extract_archive(path, tmp.path())?;

        let root = std::fs::read_dir(tmp.path())?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .find(|p| p.join(CHART_FILE).is_file())
            .ok_or_else(|| CoreError::invalid_chart(path, "archive does not contain a chart"))?;

        Self::load_dir(&root, Some(Arc::new(tmp)))
    }

    fn load_dir(root: &Path, extracted: Option<Arc<TempDir>>) -> Result<Self> {
        let definition = ChartDefinition::load(root)?;

        let values_path = root.join(VALUES_FILE);
        let values = if values_path.is_file() {
            Values::from_file(&values_path)
                .map_err(|e| CoreError::invalid_chart(&values_path, e.to_string()))?
        } else {
            Values::new()
        };

        let mut subcharts = Vec::new();
        let charts_dir = definition.charts_dir();
        if charts_dir.is_dir() {
            let mut entries: Vec<PathBuf> = std::fs::read_dir(&charts_dir)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .collect();
            entries.sort();

            for entry in entries {
                let is_archive = entry.extension().is_some_and(|ext| ext == "tgz");
                if entry.join(CHART_FILE).is_file() {
                    subcharts.push(Self::load_dir(&entry, extracted.clone())?);
                } else if is_archive && entry.is_file() {
                    subcharts.push(Self::load_archive(&entry)?);
                }
            }
        }

        Ok(Self {
            definition,
            values,
            subcharts,
            _extracted: extracted,
        })
    }

    pub fn name(&self) -> &str {
        self.definition.name()
    }

    pub fn version(&self) -> &str {
        self.definition.version()
    }

    pub fn root(&self) -> &Path {
        &self.definition.root
    }

    pub fn metadata(&self) -> &ChartMetadata {
        &self.definition.metadata
    }

    pub fn templates_dir(&self) -> PathBuf {
        self.root().join("templates")
    }

    /// Template files, sorted
    pub fn template_files(&self) -> Result<Vec<PathBuf>> {
        let templates_dir = self.templates_dir();
        let mut files = Vec::new();
        if !templates_dir.is_dir() {
            return Ok(files);
        }

        for entry in walkdir::WalkDir::new(&templates_dir)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_file() {
                files.push(entry.path().to_path_buf());
            }
        }

        files.sort();
        Ok(files)
    }

    /// The requirement entry that declares a sub-chart, if any
    pub fn dependency_for(&self, subchart: &LoadedChart) -> Option<&ChartDependency> {
        self.definition
            .requirements
            .iter()
            .find(|d| d.name == subchart.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    fn v2_chart(dir: &Path, name: &str, deps: &str) {
        write(
            &dir.join(CHART_FILE),
            &format!("apiVersion: v2\nname: {}\nversion: 1.0.0\n{}", name, deps),
        );
        write(&dir.join("values.yaml"), "replicas: 1\n");
        write(&dir.join("templates/cm.yaml"), "kind: ConfigMap\n");
    }

    #[test]
    fn test_load_v2_directory() {
        let dir = TempDir::new().unwrap();
        v2_chart(dir.path(), "app", "");

        let chart = LoadedChart::load(dir.path()).unwrap();
        assert_eq!(chart.name(), "app");
        assert_eq!(chart.version(), "1.0.0");
        assert_eq!(chart.values.get("replicas").unwrap(), 1);
        assert_eq!(chart.template_files().unwrap().len(), 1);
        assert!(chart.subcharts.is_empty());
    }

    #[test]
    fn test_load_v1_requirements_and_lock() {
        let dir = TempDir::new().unwrap();
        write(&dir.path().join(CHART_FILE), "apiVersion: v1\nname: legacy\nversion: 0.1.0\n");
        write(
            &dir.path().join(REQUIREMENTS_FILE),
            "dependencies:\n- name: redis\n  version: ^1.0.0\n  repository: https://charts.example.com\n",
        );

        let definition = ChartDefinition::load(dir.path()).unwrap();
        assert_eq!(definition.requirements.len(), 1);
        assert_eq!(definition.lock_in_sync().unwrap(), None);
        assert_eq!(definition.lock_path(), dir.path().join(REQUIREMENTS_LOCK_FILE));

        let lock = ChartLock::new(
            &definition.requirements,
            vec![LockedDependency {
                name: "redis".into(),
                version: "1.2.0".into(),
                repository: "https://charts.example.com".into(),
            }],
        )
        .unwrap();
        definition.save_lock(&lock).unwrap();

        let reloaded = ChartDefinition::load(dir.path()).unwrap();
        assert_eq!(reloaded.lock_in_sync().unwrap(), Some(true));
        assert_eq!(reloaded.missing_dependencies().len(), 1);

        write(&dir.path().join("charts/redis-1.2.0.tgz"), "");
        assert!(reloaded.missing_dependencies().is_empty());
    }

    #[test]
    fn test_lock_out_of_sync_after_requirement_change() {
        let dir = TempDir::new().unwrap();
        v2_chart(
            dir.path(),
            "app",
            "dependencies:\n- name: db\n  version: 1.0.0\n  repository: https://example.com\n",
        );
        let definition = ChartDefinition::load(dir.path()).unwrap();
        let lock = ChartLock::new(&definition.requirements, vec![]).unwrap();
        definition.save_lock(&lock).unwrap();

        v2_chart(
            dir.path(),
            "app",
            "dependencies:\n- name: db\n  version: 2.0.0\n  repository: https://example.com\n",
        );
        let changed = ChartDefinition::load(dir.path()).unwrap();
        assert_eq!(changed.lock_in_sync().unwrap(), Some(false));
    }

    #[test]
    fn test_package_and_load_archive_with_subchart() {
        let work = TempDir::new().unwrap();
        let parent = work.path().join("parent");
        let child = work.path().join("child");
        v2_chart(
            &parent,
            "parent",
            "dependencies:\n- name: child\n  version: 1.0.0\n  repository: file://../child\n",
        );
        v2_chart(&child, "child", "");

        let child_archive = package_chart(&child, &parent.join("charts")).unwrap();
        assert_eq!(child_archive.file_name().unwrap(), "child-1.0.0.tgz");

        let parent_archive = package_chart(&parent, work.path()).unwrap();
        let chart = LoadedChart::load(&parent_archive).unwrap();
        assert_eq!(chart.name(), "parent");
        assert_eq!(chart.subcharts.len(), 1);
        assert_eq!(chart.subcharts[0].name(), "child");
        assert!(chart.definition.has_local_dependencies());
        assert_eq!(
            chart.dependency_for(&chart.subcharts[0]).unwrap().local_path(),
            Some("../child")
        );
    }

    #[test]
    fn test_find_dependency_archives() {
        let dir = TempDir::new().unwrap();
        write(&dir.path().join("redis-1.0.0.tgz"), "");
        write(&dir.path().join("redis-2.0.0.tgz"), "");
        write(&dir.path().join("redis-sentinel-1.0.0.tgz"), "");
        write(&dir.path().join("redis-6-1.0.0.tgz"), "");

        let found = find_dependency_archives(dir.path(), "redis");
        assert_eq!(
            found,
            vec![dir.path().join("redis-1.0.0.tgz"), dir.path().join("redis-2.0.0.tgz")]
        );
        assert_eq!(
            find_dependency_archives(dir.path(), "redis-6"),
            vec![dir.path().join("redis-6-1.0.0.tgz")]
        );
    }

    fn helm_locked_chart(dir: &Path, constraint: &str, digest: &str) -> ChartDefinition {
        v2_chart(
            dir,
            "app",
            &format!(
                "dependencies:\n- name: redis\n  version: \"{}\"\n  repository: https://charts.example.com\n",
                constraint
            ),
        );
        write(
            &dir.join(LOCK_FILE),
            &format!(
                "dependencies:\n- name: redis\n  repository: https://charts.example.com\n  version: 1.2.0\ndigest: {}\ngenerated: \"2024-05-01T10:00:00Z\"\n",
                digest
            ),
        );
        ChartDefinition::load(dir).unwrap()
    }

    #[test]
    fn test_helm_generated_lock_in_sync() {
        let range = TempDir::new().unwrap();
        let definition = helm_locked_chart(
            range.path(),
            ">=1.0.0",
            "sha256:673ae6416dba362502be5daabdc1ad3fdbd04443037e26b01e0eb5c81ea88cd3",
        );
        assert_eq!(definition.lock_in_sync().unwrap(), Some(true));

        let pinned = TempDir::new().unwrap();
        let definition = helm_locked_chart(
            pinned.path(),
            "1.2.0",
            "sha256:182776c4ba7d28f995444f6c96e77d376617bdbdbb77c2c6794ebf0345974048",
        );
        assert_eq!(definition.lock_in_sync().unwrap(), Some(true));
    }

    #[test]
    fn test_digest_omits_empty_version() {
        let requirement = |version: &str| ChartDependency {
            name: "redis".into(),
            version: version.into(),
            repository: "https://charts.example.com".into(),
            condition: None,
            tags: vec![],
            alias: None,
        };
        let json = serde_json::to_string(&requirement("")).unwrap();
        assert_eq!(json, r#"{"name":"redis","repository":"https://charts.example.com"}"#);
        assert_ne!(
            requirements_digest(&[requirement("")], &[]).unwrap(),
            requirements_digest(&[requirement("<2.0.0")], &[]).unwrap()
        );
        assert_eq!(escape_html("\"<a&b>\""), r#""\u003ca\u0026b\u003e""#);
    }

    #[test]
    fn test_missing_chart() {
        let dir = TempDir::new().unwrap();
        let err = LoadedChart::load(dir.path().join("nope")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
