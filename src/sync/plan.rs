// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Ordering of sync actions into waves.

use crate::diff::ResourceDiff;
use crate::types::SyncAction;
use std::collections::BTreeMap;

/// Kinds in the order they must exist in; unknown kinds go last
const KIND_ORDER: &[&str] = &[
    "Namespace",
    "NetworkPolicy",
    "ResourceQuota",
    "LimitRange",
    "ServiceAccount",
    "Secret",
    "ConfigMap",
    "StorageClass",
    "PersistentVolume",
    "PersistentVolumeClaim",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "Role",
    "RoleBinding",
    "Service",
    "DaemonSet",
    "Pod",
    "ReplicaSet",
    "Deployment",
    "HorizontalPodAutoscaler",
    "StatefulSet",
    "Job",
    "CronJob",
    "IngressClass",
    "Ingress",
    "APIService",
];

fn kind_priority(kind: &str) -> usize {
    KIND_ORDER
        .iter()
        .position(|k| *k == kind)
        .unwrap_or(KIND_ORDER.len())
}

fn apply_order(diff: &ResourceDiff) -> (usize, Option<&str>, &str) {
    (
        kind_priority(&diff.key.kind),
        diff.key.namespace.as_deref(),
        diff.key.name.as_str(),
    )
}

/// Creates and updates sharing a sync wave
#[derive(Debug, Clone)]
pub struct Wave {
    pub number: i32,
    pub steps: Vec<ResourceDiff>,
}

/// Everything one sync will do, in execution order
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    pub waves: Vec<Wave>,
    /// Deletes, run after all waves in reverse dependency order
    pub prune: Vec<ResourceDiff>,
    /// Orphans left in place because pruning is disabled
    pub retained: Vec<ResourceDiff>,
}

impl SyncPlan {
    pub fn build(diffs: &[ResourceDiff]) -> Self {
        let mut waves: BTreeMap<i32, Vec<ResourceDiff>> = BTreeMap::new();
        let mut prune = Vec::new();
        let mut retained = Vec::new();

        for diff in diffs {
            match diff.action {
                SyncAction::Create | SyncAction::Update => {
                    waves.entry(diff.wave()).or_default().push(diff.clone())
                }
                SyncAction::Delete => prune.push(diff.clone()),
                SyncAction::NoOp if diff.requires_pruning => retained.push(diff.clone()),
                SyncAction::NoOp => {}
            }
        }

        let waves = waves
            .into_iter()
            .map(|(number, mut steps)| {
                steps.sort_by(|a, b| apply_order(a).cmp(&apply_order(b)));
                Wave { number, steps }
            })
            .collect();

        prune.sort_by(|a, b| {
            (b.wave(), apply_order(b)).cmp(&(a.wave(), apply_order(a)))
        });

        Self {
            waves,
            prune,
            retained,
        }
    }

    /// Whether the plan changes anything in the cluster
    pub fn is_empty(&self) -> bool {
        self.waves.is_empty() && self.prune.is_empty()
    }
}
