// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::constants::{sync_options, IN_CLUSTER_SERVER};
use crate::error::{DriftwoodError, Result};
use crate::types::resource::ResourceKey;
use crate::types::status::{
    AppPhase, HealthStatus, OperationPhase, ResultCode, SyncAction, SyncStatus,
};
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, schemars::JsonSchema)]
#[kube(group = "driftwood.dev", version = "v1alpha1", kind = "Application")]
#[kube(namespaced, shortname = "app")]
#[kube(status = "ApplicationStatus")]
#[kube(
    printcolumn = r#"{"name":"Sync Status","type":"string","jsonPath":".status.sync.status"}"#,
    printcolumn = r#"{"name":"Health Status","type":"string","jsonPath":".status.health.status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    pub source: ApplicationSource,
    pub destination: ApplicationDestination,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_policy: Option<SyncPolicy>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSource {
    #[serde(rename = "repoURL")]
    pub repo_url: String,
    /// Branch, tag or commit; empty means HEAD
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_revision: Option<String>,
    /// Directory inside the repository holding the manifests
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<DirectorySource>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DirectorySource {
    #[serde(default)]
    pub recurse: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationDestination {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncPolicy {
    /// Present when syncs start without an explicit request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automated: Option<AutomatedSyncPolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sync_options: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryStrategy>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AutomatedSyncPolicy {
    #[serde(default)]
    pub prune: bool,
    #[serde(default)]
    pub self_heal: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<RetryBackoff>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryBackoff {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub factor: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_duration_seconds: Option<u64>,
}

/// Flattened view of the sync policy switches
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PolicyFlags {
    pub automated: bool,
    pub prune: bool,
    pub self_heal: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    #[serde(default)]
    pub sync: SyncInfo,
    #[serde(default)]
    pub health: HealthInfo,
    #[serde(default)]
    pub phase: AppPhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_state: Option<OperationState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default)]
    pub retry_count: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncInfo {
    pub status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthInfo {
    pub status: HealthStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub group: String,
    pub version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    pub status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthStatus>,
    #[serde(default)]
    pub requires_pruning: bool,
}

impl ResourceStatus {
    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(
            &self.group,
            &self.kind,
            self.namespace.as_deref(),
            &self.name,
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OperationState {
    pub phase: OperationPhase,
    /// Who started the operation, see `constants::initiators`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiated_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<ResourceResult>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceResult {
    pub key: ResourceKey,
    pub action: SyncAction,
    pub code: ResultCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Application {
    pub fn policy_flags(&self) -> PolicyFlags {
        match self
            .spec
            .sync_policy
            .as_ref()
            .and_then(|p| p.automated.as_ref())
        {
            Some(automated) => PolicyFlags {
                automated: true,
                prune: automated.prune,
                self_heal: automated.self_heal,
            },
            None => PolicyFlags::default(),
        }
    }

    pub fn has_sync_option(&self, option: &str) -> bool {
        self.spec
            .sync_policy
            .as_ref()
            .is_some_and(|p| p.sync_options.iter().any(|o| o == option))
    }

    pub fn creates_namespace(&self) -> bool {
        self.has_sync_option(sync_options::CREATE_NAMESPACE)
    }

    /// Target revision, with an empty value meaning HEAD
    pub fn target_revision(&self) -> &str {
        match self.spec.source.target_revision.as_deref() {
            Some(rev) if !rev.trim().is_empty() => rev.trim(),
            _ => "HEAD",
        }
    }

    pub fn destination_namespace(&self) -> &str {
        self.spec
            .destination
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or("default")
    }

    /// Operation of a sync recorded as running in status
    pub fn running_operation(&self) -> Option<&OperationState> {
        self.status
            .as_ref()
            .filter(|s| s.phase == AppPhase::Syncing)
            .and_then(|s| s.operation_state.as_ref())
            .filter(|op| op.phase == OperationPhase::Running)
    }

    /// Whether status records a sync started by someone other than `initiator`
    pub fn synced_by_other(&self, initiator: &str) -> bool {
        self.running_operation()
            .is_some_and(|op| op.initiated_by.as_deref() != Some(initiator))
    }

    pub fn phase(&self) -> AppPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}

impl ApplicationDestination {
    /// Server URL, defaulting to the operator's own cluster
    pub fn server(&self) -> &str {
        self.server
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(IN_CLUSTER_SERVER)
    }
}

impl ApplicationSpec {
    /// Check the spec for errors that no amount of retrying would fix
    pub fn validate(&self) -> Result<()> {
        if self.source.repo_url.trim().is_empty() {
            return Err(DriftwoodError::Validation(
                "spec.source.repoURL must not be empty".to_string(),
            ));
        }
        if self.source.repo_url.trim_start().starts_with('-') {
            return Err(DriftwoodError::Validation(format!(
                "spec.source.repoURL '{}' must not start with '-'",
                self.source.repo_url
            )));
        }

        validate_source_path(&self.source.path)?;

        if let Some(server) = self.destination.server.as_deref().filter(|s| !s.is_empty()) {
            url::Url::parse(server).map_err(|e| {
                DriftwoodError::Validation(format!(
                    "spec.destination.server '{}' is not a valid URL: {}",
                    server, e
                ))
            })?;
        }

        if let Some(ns) = self.destination.namespace.as_deref() {
            if !ns.is_empty() && !is_dns_label(ns) {
                return Err(DriftwoodError::Validation(format!(
                    "spec.destination.namespace '{}' is not a valid namespace name",
                    ns
                )));
            }
        }

        Ok(())
    }
}

/// Reject paths that are absolute or step outside the repository
pub fn validate_source_path(path: &str) -> Result<()> {
    let escapes = Path::new(path).components().any(|c| {
        matches!(
            c,
            Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    });

    if escapes {
        return Err(DriftwoodError::Validation(format!(
            "spec.source.path '{}' must be relative to the repository root",
            path
        )));
    }
    Ok(())
}

fn is_dns_label(value: &str) -> bool {
    value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !value.starts_with('-')
        && !value.ends_with('-')
}
