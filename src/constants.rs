// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

/// The operator name used as server-side apply field manager
pub const OPERATOR_NAME: &str = "driftwood";

/// Finalizer that lets the operator observe Application deletions
pub const FINALIZER: &str = "driftwood.dev/cleanup";

/// Server URL that designates the operator's own cluster
pub const IN_CLUSTER_SERVER: &str = "https://kubernetes.default.svc";

/// Kubernetes label keys used by driftwood
pub mod labels {
    /// Tracks which Application manages an object
    pub const INSTANCE: &str = "app.kubernetes.io/instance";
    /// Marks Secrets that describe destination clusters
    pub const SECRET_TYPE: &str = "driftwood.dev/secret-type";
    /// Value of SECRET_TYPE for cluster secrets
    pub const SECRET_TYPE_CLUSTER: &str = "cluster";
}

/// Kubernetes annotation keys used by driftwood
pub mod annotations {
    /// Integer wave a manifest is applied in, lower waves first
    pub const SYNC_WAVE: &str = "driftwood.dev/sync-wave";
}

/// Values of `status.operationState.initiatedBy`
pub mod initiators {
    pub const OPERATOR: &str = "driftwood-operator";
    pub const CLI: &str = "driftwood-cli";
}

/// Values accepted in `spec.syncPolicy.syncOptions`
pub mod sync_options {
    pub const CREATE_NAMESPACE: &str = "CreateNamespace=true";
}

/// Data keys of destination cluster secrets
pub mod cluster_secret {
    pub const SERVER: &str = "server";
    pub const KUBECONFIG: &str = "kubeconfig";
}

/// CRD polling configuration
pub mod crd {
    /// Initial polling interval in seconds when waiting for CRD
    pub const POLL_INTERVAL_SECS: u64 = 10;
    /// Maximum polling interval in seconds (exponential backoff cap)
    pub const POLL_MAX_INTERVAL_SECS: u64 = 60;
}

/// Kinds whose objects have no namespace
pub const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "Node",
    "PersistentVolume",
    "StorageClass",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "PriorityClass",
    "IngressClass",
    "RuntimeClass",
    "CSIDriver",
    "APIService",
    "ValidatingWebhookConfiguration",
    "MutatingWebhookConfiguration",
];

/// Kinds always listed when looking for objects carrying the tracking label,
/// as (group, version, kind)
pub const TRACKED_KINDS: &[(&str, &str, &str)] = &[
    ("", "v1", "ConfigMap"),
    ("", "v1", "Secret"),
    ("", "v1", "Service"),
    ("", "v1", "ServiceAccount"),
    ("apps", "v1", "Deployment"),
    ("apps", "v1", "StatefulSet"),
    ("apps", "v1", "DaemonSet"),
    ("batch", "v1", "Job"),
    ("networking.k8s.io", "v1", "Ingress"),
];
