// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Kind-specific health assessment of live objects.

use crate::types::{HealthStatus, ResourceKey};
use kube::api::DynamicObject;
use serde_json::Value;

/// Health of one object with a human readable reason
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub message: Option<String>,
}

impl HealthReport {
    fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: None,
        }
    }

    fn with(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
        }
    }

    /// Report for a desired resource that does not exist in the cluster
    pub fn missing() -> Self {
        Self::with(HealthStatus::Missing, "resource does not exist")
    }
}

type Predicate = fn(&DynamicObject) -> HealthReport;

const PREDICATES: &[(&str, Predicate)] = &[
    ("Deployment", deployment_health),
    ("StatefulSet", statefulset_health),
    ("DaemonSet", daemonset_health),
    ("ReplicaSet", replicaset_health),
    ("Pod", pod_health),
    ("Service", service_health),
    ("Ingress", ingress_health),
    ("PersistentVolumeClaim", pvc_health),
    ("Job", job_health),
    ("Namespace", namespace_health),
];

/// Kinds that are healthy as soon as they exist
const PRESENCE_ONLY: &[&str] = &[
    "ConfigMap",
    "Secret",
    "ServiceAccount",
    "Role",
    "RoleBinding",
    "ClusterRole",
    "ClusterRoleBinding",
    "NetworkPolicy",
    "ResourceQuota",
    "LimitRange",
    "StorageClass",
    "PriorityClass",
    "IngressClass",
    "PodDisruptionBudget",
    "CustomResourceDefinition",
    "CronJob",
    "HorizontalPodAutoscaler",
    "Endpoints",
];

/// Pod waiting reasons that will not resolve without intervention
const FATAL_WAITING_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "CreateContainerConfigError",
    "InvalidImageName",
];

/// Evaluate the health of a live object
pub fn evaluate(object: &DynamicObject) -> HealthReport {
    let kind = object.types.as_ref().map(|t| t.kind.as_str()).unwrap_or("");

    if let Some((_, predicate)) = PREDICATES.iter().find(|(k, _)| *k == kind) {
        return predicate(object);
    }
    if PRESENCE_ONLY.contains(&kind) {
        return HealthReport::healthy();
    }
    ready_condition_health(object)
}

/// Pessimistic aggregate; nothing to assess counts as healthy
pub fn aggregate<I>(statuses: I) -> HealthStatus
where
    I: IntoIterator<Item = HealthStatus>,
{
    statuses.into_iter().max().unwrap_or(HealthStatus::Healthy)
}

/// Application health with the reason of its worst resource
pub fn summarize<'a, I>(reports: I) -> HealthReport
where
    I: IntoIterator<Item = (&'a ResourceKey, &'a HealthReport)>,
{
    let reports: Vec<_> = reports.into_iter().collect();
    let status = aggregate(reports.iter().map(|(_, report)| report.status));
    if status == HealthStatus::Healthy {
        return HealthReport::healthy();
    }

    match reports.iter().find(|(_, report)| report.status == status) {
        Some((key, report)) => HealthReport {
            status,
            message: Some(match &report.message {
                Some(message) => format!("{}: {}", key, message),
                None => key.to_string(),
            }),
        },
        None => HealthReport::healthy(),
    }
}

fn int_at(value: &Value, pointer: &str) -> Option<i64> {
    value.pointer(pointer).and_then(Value::as_i64)
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

/// Find a status condition of the given type
fn condition<'a>(object: &'a DynamicObject, type_: &str) -> Option<&'a Value> {
    object
        .data
        .pointer("/status/conditions")
        .and_then(Value::as_array)?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(type_))
}

fn condition_is_true(object: &DynamicObject, type_: &str) -> bool {
    condition(object, type_).and_then(|c| c.get("status").and_then(Value::as_str)) == Some("True")
}

/// Progressing while the controller has not yet seen the latest spec
fn generation_pending(object: &DynamicObject) -> Option<HealthReport> {
    let generation = object.metadata.generation?;
    let observed = int_at(&object.data, "/status/observedGeneration").unwrap_or(0);
    (observed < generation).then(|| {
        HealthReport::with(
            HealthStatus::Progressing,
            "waiting for the controller to observe the latest generation",
        )
    })
}

fn deployment_health(object: &DynamicObject) -> HealthReport {
    let data = &object.data;
    if data.pointer("/spec/paused").and_then(Value::as_bool) == Some(true) {
        return HealthReport::with(HealthStatus::Progressing, "deployment is paused");
    }
    if let Some(pending) = generation_pending(object) {
        return pending;
    }
    if condition(object, "Progressing")
        .and_then(|c| c.get("reason").and_then(Value::as_str))
        == Some("ProgressDeadlineExceeded")
    {
        return HealthReport::with(HealthStatus::Degraded, "progress deadline exceeded");
    }

    let desired = int_at(data, "/spec/replicas").unwrap_or(1);
    let total = int_at(data, "/status/replicas").unwrap_or(0);
    let updated = int_at(data, "/status/updatedReplicas").unwrap_or(0);
    let available = int_at(data, "/status/availableReplicas").unwrap_or(0);

    if updated < desired {
        HealthReport::with(
            HealthStatus::Progressing,
            format!("{} of {} replicas updated", updated, desired),
        )
    } else if total > updated {
        HealthReport::with(
            HealthStatus::Progressing,
            format!("{} old replicas pending termination", total - updated),
        )
    } else if available < updated {
        HealthReport::with(
            HealthStatus::Progressing,
            format!("{} of {} updated replicas available", available, updated),
        )
    } else {
        HealthReport::healthy()
    }
}

fn statefulset_health(object: &DynamicObject) -> HealthReport {
    let data = &object.data;
    if let Some(pending) = generation_pending(object) {
        return pending;
    }
    if str_at(data, "/spec/updateStrategy/type") == Some("OnDelete") {
        return HealthReport::healthy();
    }

    let desired = int_at(data, "/spec/replicas").unwrap_or(1);
    let ready = int_at(data, "/status/readyReplicas").unwrap_or(0);
    if ready < desired {
        return HealthReport::with(
            HealthStatus::Progressing,
            format!("{} of {} replicas ready", ready, desired),
        );
    }

    match (
        str_at(data, "/status/currentRevision"),
        str_at(data, "/status/updateRevision"),
    ) {
        (Some(current), Some(update)) if current != update => {
            HealthReport::with(HealthStatus::Progressing, "rolling update in progress")
        }
        _ => HealthReport::healthy(),
    }
}

fn daemonset_health(object: &DynamicObject) -> HealthReport {
    let data = &object.data;
    if let Some(pending) = generation_pending(object) {
        return pending;
    }

    let desired = int_at(data, "/status/desiredNumberScheduled").unwrap_or(0);
    let updated = int_at(data, "/status/updatedNumberScheduled").unwrap_or(0);
    let available = int_at(data, "/status/numberAvailable").unwrap_or(0);

    if updated < desired {
        HealthReport::with(
            HealthStatus::Progressing,
            format!("{} of {} pods updated", updated, desired),
        )
    } else if available < desired {
        HealthReport::with(
            HealthStatus::Progressing,
            format!("{} of {} pods available", available, desired),
        )
    } else {
        HealthReport::healthy()
    }
}

fn replicaset_health(object: &DynamicObject) -> HealthReport {
    let data = &object.data;
    if let Some(pending) = generation_pending(object) {
        return pending;
    }
    if condition_is_true(object, "ReplicaFailure") {
        let message = condition(object, "ReplicaFailure")
            .and_then(|c| c.get("message").and_then(Value::as_str))
            .unwrap_or("replica failure");
        return HealthReport::with(HealthStatus::Degraded, message);
    }

    let desired = int_at(data, "/spec/replicas").unwrap_or(1);
    let available = int_at(data, "/status/availableReplicas").unwrap_or(0);
    if available < desired {
        HealthReport::with(
            HealthStatus::Progressing,
            format!("{} of {} replicas available", available, desired),
        )
    } else {
        HealthReport::healthy()
    }
}

fn pod_health(object: &DynamicObject) -> HealthReport {
    let data = &object.data;

    let waiting = data
        .pointer("/status/containerStatuses")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|c| str_at(c, "/state/waiting/reason"))
        .find(|reason| FATAL_WAITING_REASONS.contains(reason));

    match str_at(data, "/status/phase") {
        Some("Succeeded") => HealthReport::healthy(),
        Some("Failed") => HealthReport::with(
            HealthStatus::Degraded,
            str_at(data, "/status/message").unwrap_or("pod failed"),
        ),
        Some("Running") | Some("Pending") => {
            if let Some(reason) = waiting {
                HealthReport::with(HealthStatus::Degraded, reason)
            } else if condition_is_true(object, "Ready") {
                HealthReport::healthy()
            } else {
                HealthReport::with(HealthStatus::Progressing, "pod is not ready")
            }
        }
        _ => HealthReport::with(HealthStatus::Unknown, "pod phase is unknown"),
    }
}

fn has_load_balancer_ingress(object: &DynamicObject) -> bool {
    object
        .data
        .pointer("/status/loadBalancer/ingress")
        .and_then(Value::as_array)
        .is_some_and(|ingress| !ingress.is_empty())
}

fn service_health(object: &DynamicObject) -> HealthReport {
    if str_at(&object.data, "/spec/type") != Some("LoadBalancer")
        || has_load_balancer_ingress(object)
    {
        HealthReport::healthy()
    } else {
        HealthReport::with(
            HealthStatus::Progressing,
            "waiting for load balancer address",
        )
    }
}

fn ingress_health(object: &DynamicObject) -> HealthReport {
    if has_load_balancer_ingress(object) {
        HealthReport::healthy()
    } else {
        HealthReport::with(HealthStatus::Progressing, "waiting for ingress address")
    }
}

fn pvc_health(object: &DynamicObject) -> HealthReport {
    match str_at(&object.data, "/status/phase") {
        Some("Bound") => HealthReport::healthy(),
        Some("Pending") => HealthReport::with(HealthStatus::Progressing, "claim is pending"),
        Some("Lost") => HealthReport::with(HealthStatus::Degraded, "claim lost its volume"),
        _ => HealthReport::with(HealthStatus::Unknown, "claim phase is unknown"),
    }
}

fn job_health(object: &DynamicObject) -> HealthReport {
    if condition_is_true(object, "Failed") {
        let message = condition(object, "Failed")
            .and_then(|c| c.get("message").and_then(Value::as_str))
            .unwrap_or("job failed");
        HealthReport::with(HealthStatus::Degraded, message)
    } else if condition_is_true(object, "Complete") {
        HealthReport::healthy()
    } else {
        HealthReport::with(HealthStatus::Progressing, "job is running")
    }
}

fn namespace_health(object: &DynamicObject) -> HealthReport {
    match str_at(&object.data, "/status/phase") {
        Some("Terminating") => {
            HealthReport::with(HealthStatus::Progressing, "namespace is terminating")
        }
        _ => HealthReport::healthy(),
    }
}

/// Fallback for custom resources exposing a standard Ready condition
fn ready_condition_health(object: &DynamicObject) -> HealthReport {
    let Some(ready) = condition(object, "Ready") else {
        return HealthReport {
            status: HealthStatus::Unknown,
            message: None,
        };
    };
    let message = ready
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("Ready condition")
        .to_string();

    match ready.get("status").and_then(Value::as_str) {
        Some("True") => HealthReport::healthy(),
        Some("False") => HealthReport::with(HealthStatus::Degraded, message),
        _ => HealthReport::with(HealthStatus::Progressing, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::live_object;
    use serde_json::json;

    fn deployment(replicas: i64, status: Value) -> DynamicObject {
        live_object(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "web", "namespace": "dev", "generation": 3 },
            "spec": { "replicas": replicas },
            "status": status
        }))
    }

    #[test]
    fn test_deployment_with_all_replicas_ready_is_healthy() {
        let object = deployment(
            2,
            json!({
                "observedGeneration": 3,
                "replicas": 2,
                "updatedReplicas": 2,
                "readyReplicas": 2,
                "availableReplicas": 2
            }),
        );
        assert_eq!(evaluate(&object), HealthReport::healthy());
    }

    #[test]
    fn test_deployment_rollout_is_progressing() {
        let object = deployment(
            2,
            json!({
                "observedGeneration": 3,
                "replicas": 3,
                "updatedReplicas": 2,
                "availableReplicas": 2
            }),
        );
        assert_eq!(evaluate(&object).status, HealthStatus::Progressing);

        let unobserved = deployment(2, json!({ "observedGeneration": 2 }));
        assert_eq!(evaluate(&unobserved).status, HealthStatus::Progressing);
    }

    #[test]
    fn test_deployment_past_deadline_is_degraded() {
        let object = deployment(
            2,
            json!({
                "observedGeneration": 3,
                "updatedReplicas": 1,
                "conditions": [{
                    "type": "Progressing",
                    "status": "False",
                    "reason": "ProgressDeadlineExceeded"
                }]
            }),
        );
        assert_eq!(evaluate(&object).status, HealthStatus::Degraded);
    }

    #[test]
    fn test_crash_looping_pod_is_degraded() {
        let pod = live_object(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "web-1", "namespace": "dev" },
            "status": {
                "phase": "Running",
                "containerStatuses": [{
                    "name": "web",
                    "state": { "waiting": { "reason": "CrashLoopBackOff" } }
                }]
            }
        }));
        let report = evaluate(&pod);
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.message.as_deref(), Some("CrashLoopBackOff"));
    }

    #[test]
    fn test_phase_based_kinds() {
        let pvc = |phase: &str| {
            live_object(json!({
                "apiVersion": "v1",
                "kind": "PersistentVolumeClaim",
                "metadata": { "name": "data", "namespace": "dev" },
                "status": { "phase": phase }
            }))
        };
        assert_eq!(evaluate(&pvc("Bound")).status, HealthStatus::Healthy);
        assert_eq!(evaluate(&pvc("Pending")).status, HealthStatus::Progressing);
        assert_eq!(evaluate(&pvc("Lost")).status, HealthStatus::Degraded);

        let job = live_object(json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": { "name": "migrate", "namespace": "dev" },
            "status": { "conditions": [{ "type": "Complete", "status": "True" }] }
        }));
        assert_eq!(evaluate(&job).status, HealthStatus::Healthy);
    }

    #[test]
    fn test_load_balancer_service_waits_for_address() {
        let mut service = live_object(json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": { "name": "web", "namespace": "dev" },
            "spec": { "type": "LoadBalancer" }
        }));
        assert_eq!(evaluate(&service).status, HealthStatus::Progressing);

        service.data["status"] = json!({ "loadBalancer": { "ingress": [{ "ip": "10.0.0.1" }] } });
        assert_eq!(evaluate(&service).status, HealthStatus::Healthy);
    }

    #[test]
    fn test_presence_only_and_custom_kinds() {
        let config_map = live_object(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "settings", "namespace": "dev" }
        }));
        assert_eq!(evaluate(&config_map).status, HealthStatus::Healthy);

        let mut certificate = live_object(json!({
            "apiVersion": "cert-manager.io/v1",
            "kind": "Certificate",
            "metadata": { "name": "tls", "namespace": "dev" }
        }));
        assert_eq!(evaluate(&certificate).status, HealthStatus::Unknown);

        certificate.data["status"] = json!({
            "conditions": [{ "type": "Ready", "status": "False", "message": "issuer not found" }]
        });
        let report = evaluate(&certificate);
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.message.as_deref(), Some("issuer not found"));
    }

    #[test]
    fn test_aggregate_is_pessimistic() {
        use HealthStatus::*;
        assert_eq!(aggregate(Vec::new()), Healthy);
        assert_eq!(aggregate([Healthy, Progressing]), Progressing);
        assert_eq!(aggregate([Missing, Progressing, Healthy]), Missing);
        assert_eq!(aggregate([Degraded, Missing]), Degraded);
        assert_eq!(aggregate([Healthy, Unknown, Degraded]), Unknown);
    }

    #[test]
    fn test_summarize_names_worst_resource() {
        let web = ResourceKey::new("apps", "Deployment", Some("dev"), "web");
        let settings = ResourceKey::new("", "ConfigMap", Some("dev"), "settings");
        let healthy = HealthReport::healthy();
        let missing = HealthReport::missing();

        let summary = summarize([(&settings, &healthy), (&web, &missing)]);
        assert_eq!(summary.status, HealthStatus::Missing);
        assert_eq!(
            summary.message.as_deref(),
            Some("apps/Deployment/dev/web: resource does not exist")
        );

        assert_eq!(summarize([(&settings, &healthy)]), HealthReport::healthy());
    }

    #[test]
    fn test_summary_status_matches_aggregate() {
        let web = ResourceKey::new("apps", "Deployment", Some("dev"), "web");
        let job = ResourceKey::new("batch", "Job", Some("dev"), "migrate");
        let degraded = HealthReport {
            status: HealthStatus::Degraded,
            message: Some("deadline exceeded".to_string()),
        };
        let unknown = HealthReport {
            status: HealthStatus::Unknown,
            message: None,
        };

        let summary = summarize([(&web, &degraded), (&job, &unknown)]);
        assert_eq!(
            summary.status,
            aggregate([HealthStatus::Degraded, HealthStatus::Unknown])
        );
        assert_eq!(summary.message.as_deref(), Some("batch/Job/dev/migrate"));
    }
}
