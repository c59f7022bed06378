// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! One pass of the reconciliation pipeline for an Application:
//! render, observe, diff, sync and assess health.

use crate::diff::{diff_application, has_pending_changes, sync_status, ResourceDiff};
use crate::error::{DriftwoodError, Result};
use crate::health::{self, HealthReport};
use crate::kubernetes::ClusterClient;
use crate::observe::{observe, LiveState};
use crate::render::render_application;
use crate::source::GitSource;
use crate::sync::cancel::CancelToken;
use crate::sync::executor::{execute, SyncOptions, SyncReport};
use crate::sync::plan::SyncPlan;
use crate::sync::retry::Backoff;
use crate::types::application::{
    Application, ApplicationStatus, HealthInfo, OperationState, ResourceStatus, SyncInfo,
};
use crate::types::resource::{api_resource, api_resource_of};
use crate::types::{AppPhase, DesiredResource, HealthStatus, OperationPhase, SyncStatus};
use kube::api::ApiResource;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument};

/// Desired and live state of an Application at one revision
#[derive(Debug, Clone)]
pub struct Comparison {
    pub revision: String,
    pub desired: Vec<DesiredResource>,
    pub live: LiveState,
    pub diffs: Vec<ResourceDiff>,
    pub sync_status: SyncStatus,
    pub health: HealthReport,
    pub resources: Vec<ResourceStatus>,
}

impl Comparison {
    /// Whether syncing would change anything
    pub fn is_actionable(&self) -> bool {
        has_pending_changes(&self.diffs)
    }
}

/// Kinds recorded in status, so resources removed from Git are still observed
pub fn previously_managed(app: &Application) -> Vec<ApiResource> {
    app.status
        .iter()
        .flat_map(|s| s.resources.iter())
        .map(|r| api_resource(&r.group, &r.version, &r.kind))
        .collect()
}

/// Render the Application at `revision` and compare it with the cluster
#[instrument(skip(app, git, cluster, cancel), fields(app = %app.name_any()))]
pub async fn compare(
    app: &Application,
    revision: &str,
    prune: bool,
    git: &GitSource,
    cluster: &dyn ClusterClient,
    cancel: &CancelToken,
) -> Result<Comparison> {
    app.spec.validate()?;
    let name = app.name_any();

    let checkout = cancel
        .run("checkout", git.checkout(&app.spec.source.repo_url, revision))
        .await?;
    let desired = render_application(app, &checkout)?;
    let live = observe(cluster, &name, &desired, &previously_managed(app), cancel).await?;
    let diffs = diff_application(&desired, &live, prune);

    let reports: BTreeMap<_, _> = desired
        .iter()
        .map(|d| {
            let report = match live.get(&d.key) {
                Some(object) => health::evaluate(object),
                None => HealthReport::missing(),
            };
            (d.key.clone(), report)
        })
        .collect();
    let app_health = health::summarize(&reports);

    let resources = diffs
        .iter()
        .map(|diff| {
            let version = match (&diff.desired, &diff.live) {
                (Some(d), _) => d.api_resource.version.clone(),
                (None, Some(live)) => api_resource_of(live)
                    .map(|ar| ar.version)
                    .unwrap_or_default(),
                (None, None) => String::new(),
            };
            let health = match (reports.get(&diff.key), &diff.live) {
                (Some(report), _) => Some(report.status),
                (None, Some(live)) => Some(health::evaluate(live).status),
                (None, None) => None,
            };
            ResourceStatus {
                group: diff.key.group.clone(),
                version,
                kind: diff.key.kind.clone(),
                namespace: diff.key.namespace.clone(),
                name: diff.key.name.clone(),
                status: diff.sync_status(),
                health,
                requires_pruning: diff.requires_pruning,
            }
        })
        .collect();

    let comparison = Comparison {
        revision: revision.to_string(),
        sync_status: sync_status(&diffs),
        health: app_health,
        desired,
        live,
        diffs,
        resources,
    };
    debug!(
        "Compared {} at {}: {}/{}",
        name, revision, comparison.sync_status, comparison.health.status
    );
    Ok(comparison)
}

/// Options for syncing an Application, from its policy and the CLI overrides.
///
/// The Application's retry strategy governs whole sync attempts, so API calls
/// within one attempt only get a short retry budget of their own.
pub fn sync_options(app: &Application, prune: bool, dry_run: bool) -> SyncOptions {
    SyncOptions {
        prune: prune || app.policy_flags().prune,
        dry_run,
        create_namespace: app
            .creates_namespace()
            .then(|| app.destination_namespace().to_string()),
        api_backoff: Backoff::api_calls(),
        ..SyncOptions::default()
    }
}

/// Apply a comparison's differences to the cluster
#[instrument(skip_all, fields(revision = %comparison.revision))]
pub async fn sync(
    comparison: &Comparison,
    options: &SyncOptions,
    cluster: &dyn ClusterClient,
    cancel: &CancelToken,
) -> Result<SyncReport> {
    // Deletes are planned only when pruning is on
    let diffs = if options.prune {
        diff_application(&comparison.desired, &comparison.live, true)
    } else {
        comparison.diffs.clone()
    };
    let plan = SyncPlan::build(&diffs);
    if plan.is_empty() {
        debug!("Nothing to sync");
    }

    let report = execute(cluster, &plan, options, cancel).await?;
    info!("Sync finished: {}", report.message());
    Ok(report)
}

/// Poll until the Application is healthy, failing after `timeout`
pub async fn await_healthy(
    app: &Application,
    revision: &str,
    git: &GitSource,
    cluster: &dyn ClusterClient,
    timeout: Duration,
    poll: Duration,
    cancel: &CancelToken,
) -> Result<Comparison> {
    let deadline = Instant::now() + timeout;
    loop {
        let comparison = compare(app, revision, false, git, cluster, cancel).await?;
        if comparison.health.status == HealthStatus::Healthy {
            return Ok(comparison);
        }
        if Instant::now() >= deadline {
            return Err(DriftwoodError::HealthCheckTimeout {
                target: format!("application {}", app.name_any()),
                secs: timeout.as_secs(),
            });
        }
        debug!("Application is {}, waiting", comparison.health.status);
        cancel
            .run("await health", async {
                sleep(poll).await;
                Ok(())
            })
            .await?;
    }
}

/// Operation state recorded when a sync starts
pub fn running_operation(revision: &str, initiated_by: &str, message: &str) -> OperationState {
    OperationState {
        phase: OperationPhase::Running,
        initiated_by: Some(initiated_by.to_string()),
        message: Some(message.to_string()),
        revision: Some(revision.to_string()),
        results: Vec::new(),
    }
}

/// Operation state recorded for a finished sync
pub fn operation_state(revision: &str, initiated_by: &str, report: &SyncReport) -> OperationState {
    OperationState {
        phase: report.phase(),
        initiated_by: Some(initiated_by.to_string()),
        message: Some(report.message()),
        revision: Some(revision.to_string()),
        results: report.results.clone(),
    }
}

/// Status of an Application after a comparison
pub fn build_status(
    app: &Application,
    comparison: &Comparison,
    phase: AppPhase,
    operation: Option<OperationState>,
    retry_count: u32,
) -> ApplicationStatus {
    ApplicationStatus {
        sync: SyncInfo {
            status: comparison.sync_status,
            revision: Some(comparison.revision.clone()),
        },
        health: HealthInfo {
            status: comparison.health.status,
            message: comparison.health.message.clone(),
        },
        phase,
        resources: comparison.resources.clone(),
        operation_state: operation
            .or_else(|| app.status.as_ref().and_then(|s| s.operation_state.clone())),
        observed_generation: app.metadata.generation,
        retry_count,
    }
}
