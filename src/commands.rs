// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! One-shot CLI commands acting directly against the cluster.

use crate::config::Config;
use crate::constants::initiators;
use crate::diff::diff_application;
use crate::error::DriftwoodError;
use crate::kubernetes::{create_destination_client, KubeCluster};
use crate::observe::observe;
use crate::source::GitSource;
use crate::sync::app::previously_managed;
use crate::sync::executor::{execute, SyncOptions};
use crate::sync::{
    await_healthy, build_status, compare, next_phase, operation_state, running_operation, sync,
    sync_options, CancelToken, Comparison, PhaseEvent, SyncPlan, SyncReport,
};
use crate::types::application::{Application, ApplicationStatus, ResourceStatus};
use crate::types::{AppPhase, HealthStatus, OperationPhase, SyncStatus};
use anyhow::{bail, Context};
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt, ResourceExt};
use std::fmt::Write as _;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// What a command prints and whether it counts as a success
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub summary: String,
    pub success: bool,
}

/// Flags of `driftwood sync`
#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    pub prune: bool,
    pub dry_run: bool,
    pub force: bool,
    pub wait: bool,
    pub timeout: Duration,
}

/// Render the sync/health pair, an optional message and the resource table
pub fn format_summary(
    name: &str,
    sync: SyncStatus,
    health: HealthStatus,
    message: Option<&str>,
    resources: &[ResourceStatus],
) -> String {
    let mut out = format!("{}: {}/{}\n", name, sync, health);
    if let Some(message) = message.filter(|m| !m.is_empty()) {
        let _ = writeln!(out, "  {}", message);
    }
    for r in resources {
        let health = r.health.map(|h| h.to_string()).unwrap_or_else(|| "-".to_string());
        let pruning = if r.requires_pruning {
            " (requires pruning)"
        } else {
            ""
        };
        let _ = writeln!(
            out,
            "  {:<12} {:<24} {:<32} {:<10} {}{}",
            r.kind,
            r.namespace.as_deref().unwrap_or("-"),
            r.name,
            r.status,
            health,
            pruning
        );
    }
    out
}

fn format_report(name: &str, report: &SyncReport, dry_run: bool) -> String {
    let mut out = format!(
        "{}: sync {}{}\n",
        name,
        report.phase(),
        if dry_run { " (dry run)" } else { "" }
    );
    let _ = writeln!(out, "  {}", report.message());
    for result in &report.results {
        let _ = write!(out, "  {:<8} {:<10} {}", result.action, result.code, result.key);
        if let Some(message) = &result.message {
            let _ = write!(out, ": {}", message);
        }
        out.push('\n');
    }
    out
}

fn comparison_summary(name: &str, comparison: &Comparison) -> String {
    format_summary(
        name,
        comparison.sync_status,
        comparison.health.status,
        comparison.health.message.as_deref(),
        &comparison.resources,
    )
}

/// Connections needed to compare one Application
struct Session {
    api: Api<Application>,
    git: GitSource,
    cluster: KubeCluster,
    cancel: CancelToken,
}

impl Session {
    async fn open(client: &Client, config: &Config, app: &Application) -> anyhow::Result<Self> {
        let namespace = app
            .namespace()
            .unwrap_or_else(|| config.namespace.clone());
        let destination =
            create_destination_client(client, &app.spec.destination, &config.namespace).await?;
        Ok(Self {
            api: Api::namespaced(client.clone(), &namespace),
            git: GitSource::new(&config.repo_cache_dir, config.git_timeout)
                .with_retained_checkouts(config.retained_checkouts),
            cluster: KubeCluster::new(destination, config.api_timeout),
            cancel: CancelToken::never(),
        })
    }

    async fn revision(&self, app: &Application) -> anyhow::Result<String> {
        Ok(self
            .git
            .resolve_revision(&app.spec.source.repo_url, app.target_revision())
            .await?)
    }

    async fn compare(
        &self,
        app: &Application,
        revision: &str,
        prune: bool,
    ) -> anyhow::Result<Comparison> {
        Ok(compare(app, revision, prune, &self.git, &self.cluster, &self.cancel).await?)
    }

    async fn write_status(&self, app: &Application, status: &ApplicationStatus) -> anyhow::Result<()> {
        let patch = serde_json::json!({ "status": status });
        self.api
            .patch_status(&app.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(DriftwoodError::from)
            .context("recording status")?;
        Ok(())
    }
}

async fn fetch_application(
    client: &Client,
    config: &Config,
    name: &str,
) -> anyhow::Result<Application> {
    let api: Api<Application> = Api::namespaced(client.clone(), &config.namespace);
    api.get(name)
        .await
        .map_err(DriftwoodError::from)
        .with_context(|| format!("application {} in namespace {}", name, config.namespace))
}

/// `driftwood get`: show the recorded status, or compare afresh with `refresh`
#[instrument(skip(client, config))]
pub async fn get(
    client: &Client,
    config: &Config,
    name: &str,
    refresh: bool,
) -> anyhow::Result<CommandOutcome> {
    let app = fetch_application(client, config, name).await?;

    if refresh {
        let session = Session::open(client, config, &app).await?;
        let revision = session.revision(&app).await?;
        let comparison = session
            .compare(&app, &revision, app.policy_flags().prune)
            .await?;
        return Ok(CommandOutcome {
            summary: comparison_summary(name, &comparison),
            success: true,
        });
    }

    let status = app.status.clone().unwrap_or_default();
    let message = status
        .health
        .message
        .clone()
        .or_else(|| status.operation_state.as_ref().and_then(|op| op.message.clone()));
    Ok(CommandOutcome {
        summary: format_summary(
            name,
            status.sync.status,
            status.health.status,
            message.as_deref(),
            &status.resources,
        ),
        success: true,
    })
}

/// `driftwood sync`: sync an Application once, optionally waiting for health
#[instrument(skip(client, config, request))]
pub async fn sync_application(
    client: &Client,
    config: &Config,
    name: &str,
    request: &SyncRequest,
) -> anyhow::Result<CommandOutcome> {
    let app = fetch_application(client, config, name).await?;
    let flags = app.policy_flags();

    let start = next_phase(app.phase(), PhaseEvent::SyncRequested, flags);
    if !start.start_sync && !request.force {
        bail!(
            "a sync of {} is already running; use --force to start another",
            name
        );
    }

    let session = Session::open(client, config, &app).await?;
    let revision = session.revision(&app).await?;
    let comparison = session
        .compare(&app, &revision, request.prune || flags.prune)
        .await?;
    let options: SyncOptions = sync_options(&app, request.prune, request.dry_run);

    if request.dry_run {
        let report = sync(&comparison, &options, &session.cluster, &session.cancel).await?;
        return Ok(CommandOutcome {
            summary: format_report(name, &report, true),
            success: report.succeeded(),
        });
    }

    info!("Syncing {} to {}", name, revision);
    let running = running_operation(
        &revision,
        initiators::CLI,
        "sync requested from the command line",
    );
    let status = build_status(&app, &comparison, AppPhase::Syncing, Some(running), 0);
    session.write_status(&app, &status).await?;

    let report = match sync(&comparison, &options, &session.cluster, &session.cancel).await {
        Ok(report) => report,
        Err(e) => {
            // Leave no Syncing phase behind for the operator to wait on
            let mut failed = status;
            failed.phase = AppPhase::Error;
            if let Some(op) = failed.operation_state.as_mut() {
                op.phase = OperationPhase::Failed;
                op.message = Some(e.to_string());
            }
            if let Err(write_err) = session.write_status(&app, &failed).await {
                warn!("Failed to record the failed sync of {}: {:#}", name, write_err);
            }
            return Err(e.into());
        }
    };
    let outcome = if report.succeeded() {
        PhaseEvent::SyncSucceeded
    } else {
        PhaseEvent::SyncFailed {
            transient: report.is_transient(),
        }
    };
    let phase = next_phase(AppPhase::Syncing, outcome, flags).next;

    let after = session.compare(&app, &revision, flags.prune).await?;
    let status = build_status(
        &app,
        &after,
        phase,
        Some(operation_state(&revision, initiators::CLI, &report)),
        0,
    );
    session.write_status(&app, &status).await?;

    let mut summary = format_report(name, &report, false);
    if !report.succeeded() || !request.wait {
        summary.push_str(&comparison_summary(name, &after));
        return Ok(CommandOutcome {
            summary,
            success: report.succeeded(),
        });
    }

    let healthy = await_healthy(
        &app,
        &revision,
        &session.git,
        &session.cluster,
        request.timeout,
        config.health_poll_interval.min(Duration::from_secs(5)),
        &session.cancel,
    )
    .await;
    match healthy {
        Ok(comparison) => {
            summary.push_str(&comparison_summary(name, &comparison));
            Ok(CommandOutcome {
                summary,
                success: true,
            })
        }
        Err(e @ DriftwoodError::HealthCheckTimeout { .. }) => {
            let _ = writeln!(summary, "{}", e);
            summary.push_str(&comparison_summary(name, &after));
            Ok(CommandOutcome {
                summary,
                success: false,
            })
        }
        Err(e) => Err(e.into()),
    }
}

/// `driftwood delete`: remove an Application, and its resources with `cascade`
#[instrument(skip(client, config))]
pub async fn delete_application(
    client: &Client,
    config: &Config,
    name: &str,
    cascade: bool,
) -> anyhow::Result<CommandOutcome> {
    let app = fetch_application(client, config, name).await?;
    let mut summary = String::new();
    let mut success = true;

    if cascade {
        let session = Session::open(client, config, &app).await?;
        let live = observe(
            &session.cluster,
            name,
            &[],
            &previously_managed(&app),
            &session.cancel,
        )
        .await?;
        let plan = SyncPlan::build(&diff_application(&[], &live, true));
        let options = SyncOptions {
            prune: true,
            ..SyncOptions::default()
        };

        info!("Deleting {} resources of {}", plan.prune.len(), name);
        let report = execute(&session.cluster, &plan, &options, &session.cancel).await?;
        summary.push_str(&format_report(name, &report, false));
        success = report.succeeded();
        if !success {
            summary.push_str("application kept because some resources could not be deleted\n");
            return Ok(CommandOutcome { summary, success });
        }
    }

    let api: Api<Application> = Api::namespaced(
        client.clone(),
        &app.namespace().unwrap_or_else(|| config.namespace.clone()),
    );
    api.delete(name, &DeleteParams::default())
        .await
        .map_err(DriftwoodError::from)
        .with_context(|| format!("deleting application {}", name))?;
    let _ = writeln!(summary, "{}: deleted", name);

    Ok(CommandOutcome { summary, success })
}

/// `driftwood crd`: the Application CustomResourceDefinition as YAML
pub fn crd() -> anyhow::Result<CommandOutcome> {
    Ok(CommandOutcome {
        summary: serde_yaml::to_string(&Application::crd())?,
        success: true,
    })
}
