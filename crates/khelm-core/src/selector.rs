//! Resource selectors for the `include`/`exclude` options

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CoreError, Result};
use crate::resource::ResourceId;

/// Maximum Levenshtein distance for "did you mean" hints
const MAX_SUGGESTION_DISTANCE: usize = 3;

/// Exact-match constraints on a resource identity; empty fields match anything
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSelector {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

impl ResourceSelector {
    /// A selector without any constraint would match every resource
    pub fn is_empty(&self) -> bool {
        self.api_version.is_empty()
            && self.kind.is_empty()
            && self.namespace.is_empty()
            && self.name.is_empty()
    }

    pub fn matches(&self, id: &ResourceId) -> bool {
        field_matches(&self.api_version, &id.api_version)
            && field_matches(&self.kind, &id.kind)
            && field_matches(&self.namespace, &id.namespace)
            && field_matches(&self.name, &id.name)
    }

    /// Parse the CLI form `apiVersion/kind/namespace/name`
    ///
    /// Fields may be left empty (`//ns/` selects everything in namespace `ns`).
    /// Shorter forms fill from the right: `kind/name` and `name`.
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        let selector = match parts.as_slice() {
            [name] => Self {
                name: name.to_string(),
                ..Default::default()
            },
            [kind, name] => Self {
                kind: kind.to_string(),
                name: name.to_string(),
                ..Default::default()
            },
            // apiVersion may contain a group: apps/v1/Deployment/ns/name
            [group, version, kind, namespace, name] => Self {
                api_version: format!("{}/{}", group, version),
                kind: kind.to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            [api_version, kind, namespace, name] => Self {
                api_version: api_version.to_string(),
                kind: kind.to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            _ => {
                return Err(CoreError::InvalidConfig {
                    errors: vec![format!(
                        "invalid resource selector '{}': expected [apiVersion/kind/namespace/]name",
                        s
                    )],
                });
            }
        };
        Ok(selector)
    }
}

fn field_matches(constraint: &str, value: &str) -> bool {
    constraint.is_empty() || constraint == value
}

impl fmt::Display for ResourceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = [
            ("apiVersion", &self.api_version),
            ("kind", &self.kind),
            ("namespace", &self.namespace),
            ("name", &self.name),
        ];
        let set: Vec<String> = fields
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        write!(f, "{{{}}}", set.join(", "))
    }
}

/// A set of selectors that remembers which of them matched during a pass
#[derive(Debug, Clone)]
pub struct ResourceMatchers {
    label: &'static str,
    selectors: Vec<ResourceSelector>,
    matched: Vec<bool>,
    seen_names: Vec<String>,
}

impl ResourceMatchers {
    pub fn new(label: &'static str, selectors: Vec<ResourceSelector>) -> Self {
        let matched = vec![false; selectors.len()];
        Self {
            label,
            selectors,
            matched,
            seen_names: Vec::new(),
        }
    }

    pub fn exclude(selectors: Vec<ResourceSelector>) -> Self {
        Self::new("exclude", selectors)
    }

    pub fn include(selectors: Vec<ResourceSelector>) -> Self {
        Self::new("include", selectors)
    }

    pub fn is_empty(&self) -> bool {
        self.selectors.is_empty()
    }

    /// Test a resource and mark every selector that matches it
    pub fn matches(&mut self, id: &ResourceId) -> bool {
        let mut any = false;
        for (selector, matched) in self.selectors.iter().zip(self.matched.iter_mut()) {
            if selector.matches(id) {
                *matched = true;
                any = true;
            }
        }
        if !any && !id.name.is_empty() {
            self.seen_names.push(id.name.clone());
        }
        any
    }

    pub fn unmatched(&self) -> impl Iterator<Item = &ResourceSelector> {
        self.selectors
            .iter()
            .zip(&self.matched)
            .filter(|(_, matched)| !**matched)
            .map(|(selector, _)| selector)
    }

    /// Fail if any selector did not match a resource during the pass
    pub fn require_all_matched(&self) -> Result<()> {
        let unmatched: Vec<String> = self
            .unmatched()
            .map(|selector| match self.suggest(&selector.name) {
                Some(hint) => format!("{} (did you mean name={}?)", selector, hint),
                None => selector.to_string(),
            })
            .collect();

        if unmatched.is_empty() {
            Ok(())
        } else {
            Err(CoreError::UnmatchedSelectors {
                set: self.label,
                selectors: unmatched,
            })
        }
    }

    fn suggest(&self, name: &str) -> Option<&str> {
        if name.is_empty() {
            return None;
        }
        self.seen_names
            .iter()
            .map(|seen| (strsim::levenshtein(name, seen), seen))
            .filter(|(distance, _)| *distance > 0 && *distance <= MAX_SUGGESTION_DISTANCE)
            .min_by_key(|(distance, _)| *distance)
            .map(|(_, seen)| seen.as_str())
    }
}
