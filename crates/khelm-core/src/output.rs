//! Output path annotations for one-file-per-resource consumers (kpt functions)

use crate::resource::ManifestResource;

pub const PATH_ANNOTATION: &str = "config.kubernetes.io/path";
pub const INDEX_ANNOTATION: &str = "config.kubernetes.io/index";

/// Assigns `config.kubernetes.io/path` and `config.kubernetes.io/index`
///
/// A base path ending with `/` is a directory: every resource gets its own
/// file `<base><kind>_<name>.yaml`. Any other base path is a single file
/// that receives all resources.
#[derive(Debug, Clone)]
pub struct OutputPathAnnotator {
    base: String,
}

impl OutputPathAnnotator {
    pub fn new(base: impl Into<String>) -> Self {
        Self { base: base.into() }
    }

    pub fn is_directory(&self) -> bool {
        self.base.ends_with('/')
    }

    pub fn path_for(&self, resource: &ManifestResource) -> String {
        if !self.is_directory() {
            return self.base.clone();
        }
        let basename = file_basename(resource);
        if basename.is_empty() {
            return self.base.trim_end_matches('/').to_string();
        }
        format!("{}{}.yaml", self.base, basename)
    }

    /// Annotate resources in emission order
    pub fn annotate(&self, resources: &mut [ManifestResource]) {
        for (index, resource) in resources.iter_mut().enumerate() {
            let path = self.path_for(resource);
            resource.set_annotation(PATH_ANNOTATION, &path);
            resource.set_annotation(INDEX_ANNOTATION, &index.to_string());
        }
    }

    /// Whether a resource was written by a previous run to this output path
    pub fn is_generated(&self, resource: &ManifestResource) -> bool {
        let Some(path) = resource.annotation(PATH_ANNOTATION) else {
            return false;
        };
        if self.is_directory() {
            path.starts_with(&self.base)
        } else {
            path == self.base
        }
    }

    /// Replace previously generated resources with freshly generated ones
    ///
    /// Existing resources that were not generated under this output path are
    /// carried over unchanged and keep their position in front.
    pub fn merge(
        &self,
        existing: Vec<ManifestResource>,
        generated: Vec<ManifestResource>,
    ) -> Vec<ManifestResource> {
        let mut merged: Vec<ManifestResource> = existing
            .into_iter()
            .filter(|r| !self.is_generated(r))
            .collect();
        merged.extend(generated);
        merged
    }
}

fn file_basename(resource: &ManifestResource) -> String {
    let kind = resource.kind().to_lowercase();
    let parts: Vec<String> = [kind.as_str(), resource.name()]
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| p.replace(['/', '\\', ':'], "_"))
        .collect();
    parts.join("_")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(kind: &str, name: &str) -> ManifestResource {
        let yaml = format!("apiVersion: v1\nkind: {}\nmetadata:\n  name: {}\n", kind, name);
        ManifestResource::from_yaml(&yaml, "t.yaml").unwrap().unwrap()
    }

    #[test]
    fn test_directory_paths() {
        let annotator = OutputPathAnnotator::new("generated-manifests/");
        assert!(annotator.is_directory());
        assert_eq!(
            annotator.path_for(&res("ConfigMap", "my-config")),
            "generated-manifests/configmap_my-config.yaml"
        );
    }

    #[test]
    fn test_single_file_path() {
        let annotator = OutputPathAnnotator::new("out/manifest.yaml");
        assert!(!annotator.is_directory());
        assert_eq!(annotator.path_for(&res("Service", "web")), "out/manifest.yaml");
    }

    #[test]
    fn test_empty_basename_trims_separator() {
        let annotator = OutputPathAnnotator::new("generated/");
        let anonymous = ManifestResource::from_yaml("data:\n  a: b\n", "t.yaml")
            .unwrap()
            .unwrap();
        assert_eq!(annotator.path_for(&anonymous), "generated");
    }

    #[test]
    fn test_annotate_indexes_in_emission_order() {
        let annotator = OutputPathAnnotator::new("gen/");
        let mut resources = vec![res("Namespace", "ns"), res("ConfigMap", "a"), res("ConfigMap", "b")];
        annotator.annotate(&mut resources);

        let indexes: Vec<_> = resources
            .iter()
            .map(|r| r.annotation(INDEX_ANNOTATION).unwrap().to_string())
            .collect();
        assert_eq!(indexes, vec!["0", "1", "2"]);
        assert_eq!(resources[2].annotation(PATH_ANNOTATION), Some("gen/configmap_b.yaml"));
    }

    #[test]
    fn test_merge_replaces_generated_and_keeps_foreign() {
        let annotator = OutputPathAnnotator::new("gen/");

        let mut stale = res("ConfigMap", "old");
        stale.set_annotation(PATH_ANNOTATION, "gen/configmap_old.yaml");
        let mut foreign = res("ConfigMap", "mine");
        foreign.set_annotation(PATH_ANNOTATION, "other/configmap_mine.yaml");
        let unannotated = res("Secret", "plain");

        let mut generated = vec![res("ConfigMap", "new")];
        annotator.annotate(&mut generated);

        let merged = annotator.merge(vec![stale, foreign.clone(), unannotated.clone()], generated);
        let names: Vec<_> = merged.iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["mine", "plain", "new"]);
        assert_eq!(merged[0], foreign);
        assert_eq!(merged[1], unannotated);
    }

    #[test]
    fn test_single_file_merge() {
        let annotator = OutputPathAnnotator::new("manifest.yaml");
        let mut previous = res("ConfigMap", "a");
        previous.set_annotation(PATH_ANNOTATION, "manifest.yaml");
        let mut neighbour = res("ConfigMap", "b");
        neighbour.set_annotation(PATH_ANNOTATION, "manifest.yaml.bak");

        let merged = annotator.merge(vec![previous, neighbour], vec![]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].name(), "b");
    }
}
