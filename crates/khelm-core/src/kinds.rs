//! Kind tables: install order and cluster scope

use once_cell::sync::Lazy;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use crate::resource::ManifestResource;

/// Kinds in ascending install order
pub const INSTALL_ORDER: &[&str] = &[
    "Namespace",
    "ResourceQuota",
    "LimitRange",
    "PodSecurityPolicy",
    "PodDisruptionBudget",
    "Secret",
    "ConfigMap",
    "StorageClass",
    "PersistentVolume",
    "PersistentVolumeClaim",
    "ServiceAccount",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "Role",
    "RoleBinding",
    "Service",
    "DaemonSet",
    "Pod",
    "ReplicationController",
    "ReplicaSet",
    "Deployment",
    "StatefulSet",
    "Job",
    "CronJob",
    "Ingress",
    "APIService",
];

static INSTALL_PRIORITY: Lazy<HashMap<&'static str, usize>> = Lazy::new(|| {
    INSTALL_ORDER
        .iter()
        .enumerate()
        .map(|(i, kind)| (*kind, i))
        .collect()
});

static CLUSTER_SCOPED: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "APIService",
        "CertificateSigningRequest",
        "ClusterRole",
        "ClusterRoleBinding",
        "ComponentStatus",
        "CSIDriver",
        "CSINode",
        "CustomResourceDefinition",
        "FlowSchema",
        "IngressClass",
        "MutatingWebhookConfiguration",
        "Namespace",
        "Node",
        "PersistentVolume",
        "PodSecurityPolicy",
        "PriorityClass",
        "PriorityLevelConfiguration",
        "RuntimeClass",
        "SelfSubjectAccessReview",
        "SelfSubjectRulesReview",
        "StorageClass",
        "SubjectAccessReview",
        "TokenReview",
        "ValidatingAdmissionPolicy",
        "ValidatingAdmissionPolicyBinding",
        "ValidatingWebhookConfiguration",
        "VolumeAttachment",
    ]
    .into_iter()
    .collect()
});

static NAMESPACED: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "Binding",
        "ConfigMap",
        "ControllerRevision",
        "CronJob",
        "DaemonSet",
        "Deployment",
        "EndpointSlice",
        "Endpoints",
        "Event",
        "HorizontalPodAutoscaler",
        "Ingress",
        "Job",
        "Lease",
        "LimitRange",
        "LocalSubjectAccessReview",
        "NetworkPolicy",
        "PersistentVolumeClaim",
        "Pod",
        "PodDisruptionBudget",
        "PodTemplate",
        "ReplicaSet",
        "ReplicationController",
        "ResourceQuota",
        "Role",
        "RoleBinding",
        "Secret",
        "Service",
        "ServiceAccount",
        "StatefulSet",
    ]
    .into_iter()
    .collect()
});

/// Core API groups whose kinds are listed in the scope tables
const BUILTIN_GROUPS: &[&str] = &[
    "",
    "apps",
    "batch",
    "autoscaling",
    "policy",
    "networking.k8s.io",
    "rbac.authorization.k8s.io",
    "storage.k8s.io",
    "admissionregistration.k8s.io",
    "apiextensions.k8s.io",
    "apiregistration.k8s.io",
    "authentication.k8s.io",
    "authorization.k8s.io",
    "certificates.k8s.io",
    "coordination.k8s.io",
    "discovery.k8s.io",
    "events.k8s.io",
    "extensions",
    "flowcontrol.apiserver.k8s.io",
    "node.k8s.io",
    "scheduling.k8s.io",
];

/// Whether resources of a kind live inside a namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindScope {
    Namespaced,
    Cluster,
    /// Custom resources and kinds missing from the built-in tables
    Unknown,
}

impl KindScope {
    pub fn of(api_version: &str, kind: &str) -> Self {
        let group = match api_version.rsplit_once('/') {
            Some((group, _)) => group,
            None => "",
        };
        if !BUILTIN_GROUPS.contains(&group) {
            return KindScope::Unknown;
        }
        if CLUSTER_SCOPED.contains(kind) {
            KindScope::Cluster
        } else if NAMESPACED.contains(kind) {
            KindScope::Namespaced
        } else {
            KindScope::Unknown
        }
    }
}

/// Position of a kind in [`INSTALL_ORDER`]
pub fn install_priority(kind: &str) -> Option<usize> {
    INSTALL_PRIORITY.get(kind).copied()
}

/// Total install order over resources.
///
/// Known kinds sort by priority then name; unknown kinds come after all
/// known kinds, ordered by kind then name.
pub fn compare_install_order(a: &ManifestResource, b: &ManifestResource) -> Ordering {
    match (install_priority(a.kind()), install_priority(b.kind())) {
        (Some(pa), Some(pb)) => pa.cmp(&pb).then_with(|| a.name().cmp(b.name())),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a
            .kind()
            .cmp(b.kind())
            .then_with(|| a.name().cmp(b.name())),
    }
}

/// Stable sort into install order
pub fn sort_by_install_order(resources: &mut [ManifestResource]) {
    resources.sort_by(compare_install_order);
}
