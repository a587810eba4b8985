//! Repository index (`index.yaml`) and version constraints
//!
//! Helm-compatible index format. Version constraints use the Helm syntax:
//! comparators separated by whitespace or commas, `||` alternatives, `x`/`*`
//! wildcards and hyphen ranges such as `1.2 - 1.4`.

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::error::{RepoError, Result};
pub use khelm_core::chart::parse_version;

/// Repository index (Helm-compatible)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexFile {
    pub api_version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated: Option<String>,

    /// Chart versions by chart name, highest version first
    #[serde(default)]
    pub entries: BTreeMap<String, Vec<ChartVersion>>,
}

impl Default for IndexFile {
    fn default() -> Self {
        Self {
            api_version: "v1".to_string(),
            generated: None,
            entries: BTreeMap::new(),
        }
    }
}

/// One version of a chart in the index
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartVersion {
    pub name: String,

    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    /// Download URLs, absolute or relative to the repository URL
    #[serde(default)]
    pub urls: Vec<String>,

    /// SHA256 digest of the archive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deprecated: bool,
}

impl ChartVersion {
    pub fn parsed_version(&self) -> Option<Version> {
        parse_version(&self.version)
    }
}

impl IndexFile {
    /// Parse and validate an index, sorting every entry's versions descending
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let yaml = std::str::from_utf8(bytes).map_err(|e| RepoError::InvalidIndex {
            message: format!("Invalid UTF-8: {}", e),
        })?;
        let mut index: IndexFile =
            serde_yaml::from_str(yaml).map_err(|e| RepoError::InvalidIndex {
                message: e.to_string(),
            })?;
        if index.api_version.is_empty() {
            return Err(RepoError::InvalidIndex {
                message: "no API version specified".to_string(),
            });
        }
        index.sort_entries();
        Ok(index)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn add(&mut self, version: ChartVersion) {
        self.entries
            .entry(version.name.clone())
            .or_default()
            .push(version);
    }

    pub fn sort_entries(&mut self) {
        for versions in self.entries.values_mut() {
            versions.sort_by(|a, b| compare_versions(b, a));
        }
    }

    /// Find a chart version; an empty constraint selects the latest stable one
    ///
    /// A version string present verbatim in the index wins over range
    /// evaluation. Otherwise the highest version matching the constraint is
    /// returned.
    pub fn get(&self, name: &str, constraint: &str) -> Result<Option<&ChartVersion>> {
        let Some(versions) = self.entries.get(name) else {
            return Ok(None);
        };
        if !constraint.is_empty() {
            if let Some(exact) = versions.iter().find(|v| v.version == constraint) {
                return Ok(Some(exact));
            }
        }

        let constraint = VersionConstraint::parse(constraint)?;
        Ok(versions
            .iter()
            .filter(|v| v.parsed_version().is_some_and(|pv| constraint.matches(&pv)))
            .max_by(|a, b| compare_versions(a, b)))
    }
}

fn compare_versions(a: &ChartVersion, b: &ChartVersion) -> Ordering {
    match (a.parsed_version(), b.parsed_version()) {
        (Some(va), Some(vb)) => va.cmp(&vb),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.version.cmp(&b.version),
    }
}

/// Whether a version string selects a range rather than pinning a version
///
/// An empty string (latest) is a range. A string that parses as a single
/// version is a pin, even when it is not in canonical form (`v1.2.3`).
pub fn is_version_range(version: &str) -> bool {
    let version = version.trim();
    if version.is_empty() {
        return true;
    }
    if parse_version(version).is_some() {
        return false;
    }
    VersionConstraint::parse(version).is_ok()
}

/// A parsed Helm version constraint
#[derive(Debug, Clone)]
pub struct VersionConstraint {
    alternatives: Vec<Alternative>,
}

#[derive(Debug, Clone)]
struct Alternative {
    req: VersionReq,
    excluded: Vec<Version>,
}

impl VersionConstraint {
    pub fn parse(constraint: &str) -> Result<Self> {
        let constraint = constraint.trim();
        if constraint.is_empty() {
            return Ok(Self {
                alternatives: vec![Alternative {
                    req: VersionReq::STAR,
                    excluded: Vec::new(),
                }],
            });
        }

        let alternatives = constraint
            .split("||")
            .map(|alt| parse_alternative(alt).map_err(|message| invalid(constraint, message)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { alternatives })
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives
            .iter()
            .any(|alt| alt.req.matches(version) && !alt.excluded.contains(version))
    }
}

fn invalid(constraint: &str, message: String) -> RepoError {
    RepoError::InvalidVersionConstraint {
        constraint: constraint.to_string(),
        message,
    }
}

const OPERATORS: &[&str] = &["!=", ">=", "<=", "=>", "=<", ">", "<", "=", "~>", "~", "^"];

fn parse_alternative(alt: &str) -> std::result::Result<Alternative, String> {
    let alt = alt.trim();
    if alt.is_empty() {
        return Err("empty alternative".to_string());
    }

    let tokens = tokenize(alt);
    let mut comparators = Vec::new();
    let mut excluded = Vec::new();

    let mut i = 0;
    while i < tokens.len() {
        // hyphen range: `a - b`
        if tokens.get(i + 1).map(String::as_str) == Some("-") {
            let upper = tokens.get(i + 2).ok_or("incomplete hyphen range")?;
            comparators.push(format!(">={}", tokens[i]));
            comparators.push(format!("<={}", upper));
            i += 3;
            continue;
        }

        let token = &tokens[i];
        if let Some(version) = token.strip_prefix("!=") {
            let v = parse_version(version).ok_or_else(|| format!("invalid version {:?}", version))?;
            excluded.push(v);
        } else {
            comparators.push(normalize_comparator(token));
        }
        i += 1;
    }

    let req = if comparators.is_empty() {
        VersionReq::STAR
    } else {
        VersionReq::parse(&comparators.join(", ")).map_err(|e| e.to_string())?
    };
    Ok(Alternative { req, excluded })
}

/// Split into comparator tokens, joining detached operators with their version
fn tokenize(alt: &str) -> Vec<String> {
    let raw: Vec<&str> = alt
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .collect();

    let mut tokens = Vec::new();
    let mut pending_op: Option<&str> = None;
    for token in raw {
        if OPERATORS.contains(&token) {
            pending_op = Some(token);
            continue;
        }
        match pending_op.take() {
            Some(op) => tokens.push(format!("{}{}", op, token)),
            None => tokens.push(token.to_string()),
        }
    }
    tokens
}

fn normalize_comparator(token: &str) -> String {
    let (op, version) = split_operator(token);
    let version = version.strip_prefix('v').unwrap_or(version);
    let op = match op {
        "=>" => ">=",
        "=<" => "<=",
        "~>" => "~",
        // a bare full version pins, it does not mean `^`
        "" if !version.contains(['x', 'X', '*']) => "=",
        other => other,
    };
    format!("{}{}", op, version)
}

fn split_operator(token: &str) -> (&str, &str) {
    let end = token
        .find(|c: char| !matches!(c, '>' | '<' | '=' | '~' | '^' | '!'))
        .unwrap_or(token.len());
    token.split_at(end)
}
