// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Execution of a sync plan against a destination cluster.

use crate::diff::{diff_resource, ResourceDiff};
use crate::error::{DriftwoodError, Result};
use crate::health;
use crate::kubernetes::{ApplyParams, ClusterClient};
use crate::sync::cancel::CancelToken;
use crate::sync::plan::{SyncPlan, Wave};
use crate::sync::retry::Backoff;
use crate::types::application::ResourceResult;
use crate::types::resource::api_resource_of;
use crate::types::{DesiredResource, HealthStatus, OperationPhase, ResultCode, SyncAction};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub prune: bool,
    pub dry_run: bool,
    /// Namespace to create before applying anything
    pub create_namespace: Option<String>,
    /// Retries of transient API errors per call
    pub api_backoff: Backoff,
    /// How long a wave may take to become healthy before the next one starts
    pub wave_timeout: Duration,
    pub health_poll: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            prune: false,
            dry_run: false,
            create_namespace: None,
            api_backoff: Backoff::none(),
            wave_timeout: Duration::from_secs(300),
            health_poll: Duration::from_secs(5),
        }
    }
}

/// Why a sync did not complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub message: String,
    /// Whether running the sync again may succeed without changes
    pub transient: bool,
}

impl From<&DriftwoodError> for SyncFailure {
    fn from(err: &DriftwoodError) -> Self {
        Self {
            message: err.to_string(),
            transient: err.is_retryable(),
        }
    }
}

/// Per-resource outcome of a sync
#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub results: Vec<ResourceResult>,
    pub failure: Option<SyncFailure>,
}

impl SyncReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    pub fn is_transient(&self) -> bool {
        self.failure.as_ref().is_some_and(|f| f.transient)
    }

    pub fn phase(&self) -> OperationPhase {
        if self.succeeded() {
            OperationPhase::Succeeded
        } else {
            OperationPhase::Failed
        }
    }

    pub fn message(&self) -> String {
        match &self.failure {
            Some(failure) => failure.message.clone(),
            None => {
                let changed = self
                    .results
                    .iter()
                    .filter(|r| matches!(r.code, ResultCode::Synced | ResultCode::Pruned))
                    .count();
                format!("successfully synced ({} resources changed)", changed)
            }
        }
    }

    fn record(&mut self, diff: &ResourceDiff, code: ResultCode, message: Option<String>) {
        self.results.push(ResourceResult {
            key: diff.key.clone(),
            action: diff.action,
            code,
            message,
        });
    }

    fn fail(&mut self, err: &DriftwoodError) {
        if self.failure.is_none() {
            self.failure = Some(SyncFailure::from(err));
        }
    }
}

/// Run a plan: waves of creates and updates in order, then deletes.
///
/// Failures are recorded per resource and never rolled back. A wave with a
/// failed resource stops everything after it. Only cancellation aborts with
/// an error.
#[instrument(skip_all, fields(waves = plan.waves.len(), prunes = plan.prune.len()))]
pub async fn execute(
    cluster: &dyn ClusterClient,
    plan: &SyncPlan,
    options: &SyncOptions,
    cancel: &CancelToken,
) -> Result<SyncReport> {
    let mut report = SyncReport::default();

    if let (Some(namespace), false) = (&options.create_namespace, options.dry_run) {
        let ensured = with_retries("ensure namespace", &options.api_backoff, cancel, || {
            cluster.ensure_namespace(namespace)
        })
        .await;
        match ensured {
            Ok(()) => {}
            Err(e @ DriftwoodError::Cancelled(_)) => return Err(e),
            Err(e) => {
                report.fail(&e);
                skip_remaining(&mut report, &plan.waves, &plan.prune);
                return Ok(report);
            }
        }
    }

    for (index, wave) in plan.waves.iter().enumerate() {
        debug!("Applying wave {} ({} resources)", wave.number, wave.steps.len());

        for step in &wave.steps {
            let Some(desired) = &step.desired else {
                continue;
            };
            match apply_resource(cluster, desired, options, cancel).await {
                Ok(()) => {
                    if step.changed_fields.is_empty() {
                        info!("{} {}", verb(step.action, options.dry_run), step.key);
                    } else {
                        info!(
                            "{} {} ({})",
                            verb(step.action, options.dry_run),
                            step.key,
                            step.changed_fields.join(", ")
                        );
                    }
                    report.record(step, ResultCode::Synced, sync_note(step, options));
                }
                Err(e @ DriftwoodError::Cancelled(_)) => return Err(e),
                Err(e) => {
                    warn!("Failed to apply {}: {}", step.key, e);
                    report.record(step, ResultCode::SyncFailed, Some(e.to_string()));
                    report.fail(&e);
                }
            }
        }

        let later = &plan.waves[index + 1..];
        if report.failure.is_none() && !later.is_empty() && !options.dry_run {
            match await_wave_healthy(cluster, wave, options, cancel).await {
                Ok(()) => {}
                Err(e @ DriftwoodError::Cancelled(_)) => return Err(e),
                Err(e) => {
                    warn!("Wave {} did not become healthy: {}", wave.number, e);
                    report.fail(&e);
                }
            }
        }

        if report.failure.is_some() {
            skip_remaining(&mut report, later, &plan.prune);
            return Ok(report);
        }
    }

    for step in &plan.prune {
        if !options.prune {
            report.record(step, ResultCode::Skipped, Some("pruning is disabled".to_string()));
            continue;
        }
        match prune_resource(cluster, step, options, cancel).await {
            Ok(()) => {
                info!("{} {}", verb(SyncAction::Delete, options.dry_run), step.key);
                report.record(step, ResultCode::Pruned, dry_run_note(options));
            }
            Err(e @ DriftwoodError::Cancelled(_)) => return Err(e),
            Err(e) => {
                warn!("Failed to prune {}: {}", step.key, e);
                report.record(step, ResultCode::SyncFailed, Some(e.to_string()));
                report.fail(&e);
            }
        }
    }

    for step in &plan.retained {
        report.record(
            step,
            ResultCode::Skipped,
            Some("ignored (requires pruning)".to_string()),
        );
    }

    Ok(report)
}

fn verb(action: SyncAction, dry_run: bool) -> &'static str {
    match (action, dry_run) {
        (SyncAction::Create, false) => "Created",
        (SyncAction::Update, false) => "Updated",
        (SyncAction::Delete, false) => "Pruned",
        (_, false) => "Unchanged",
        (_, true) => "Would sync",
    }
}

fn dry_run_note(options: &SyncOptions) -> Option<String> {
    options.dry_run.then(|| "dry run".to_string())
}

/// Result message of an applied resource, naming the fields that differed
fn sync_note(step: &ResourceDiff, options: &SyncOptions) -> Option<String> {
    if step.changed_fields.is_empty() {
        return dry_run_note(options);
    }
    let changed = format!("changed {}", step.changed_fields.join(", "));
    Some(match dry_run_note(options) {
        Some(note) => format!("{}: {}", note, changed),
        None => changed,
    })
}

fn skip_remaining(report: &mut SyncReport, waves: &[Wave], prune: &[ResourceDiff]) {
    let skipped = waves.iter().flat_map(|w| w.steps.iter()).chain(prune);
    for step in skipped {
        report.record(
            step,
            ResultCode::Skipped,
            Some("skipped after an earlier failure".to_string()),
        );
    }
}

/// Retry an operation on transient errors with bounded backoff
async fn with_retries<T, F, Fut>(
    what: &str,
    backoff: &Backoff,
    cancel: &CancelToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match cancel.run(what, op()).await {
            Err(e) if e.is_retryable() => {
                attempt += 1;
                let Some(delay) = backoff.delay(attempt) else {
                    return Err(e);
                };
                warn!(
                    "{} failed (attempt {}): {}, retrying in {:?}",
                    what, attempt, e, delay
                );
                cancel
                    .run(what, async {
                        sleep(delay).await;
                        Ok(())
                    })
                    .await?;
            }
            result => return result,
        }
    }
}

async fn apply_resource(
    cluster: &dyn ClusterClient,
    desired: &DesiredResource,
    options: &SyncOptions,
    cancel: &CancelToken,
) -> Result<()> {
    with_retries("apply", &options.api_backoff, cancel, || {
        apply_once(cluster, desired, options.dry_run)
    })
    .await
}

/// Server-side apply; a field ownership conflict is resolved by re-reading
/// the live object and taking ownership if it still differs.
async fn apply_once(cluster: &dyn ClusterClient, desired: &DesiredResource, dry_run: bool) -> Result<()> {
    let params = ApplyParams {
        force: false,
        dry_run,
    };
    match cluster.apply(&desired.api_resource, &desired.object, params).await {
        Ok(_) => Ok(()),
        Err(DriftwoodError::ApplyConflict(reason)) => {
            warn!("Apply conflict on {}: {}", desired.key, reason);
            let live = cluster.get(&desired.api_resource, &desired.key).await?;
            if diff_resource(desired, live.as_ref()).action == SyncAction::NoOp {
                debug!("{} already matches after conflict", desired.key);
                return Ok(());
            }
            cluster
                .apply(
                    &desired.api_resource,
                    &desired.object,
                    ApplyParams {
                        force: true,
                        dry_run,
                    },
                )
                .await
                .map(|_| ())
        }
        Err(e) => Err(e),
    }
}

async fn prune_resource(
    cluster: &dyn ClusterClient,
    step: &ResourceDiff,
    options: &SyncOptions,
    cancel: &CancelToken,
) -> Result<()> {
    let resource = step
        .live
        .as_ref()
        .and_then(api_resource_of)
        .ok_or_else(|| {
            DriftwoodError::Validation(format!("cannot determine the API resource of {}", step.key))
        })?;

    with_retries("prune", &options.api_backoff, cancel, || {
        cluster.delete(&resource, &step.key, options.dry_run)
    })
    .await
}

/// Wait until no resource of a wave is still progressing or missing
async fn await_wave_healthy(
    cluster: &dyn ClusterClient,
    wave: &Wave,
    options: &SyncOptions,
    cancel: &CancelToken,
) -> Result<()> {
    let deadline = Instant::now() + options.wave_timeout;
    loop {
        let mut pending = None;
        for desired in wave.steps.iter().filter_map(|s| s.desired.as_ref()) {
            let live = cancel
                .run("wave health", cluster.get(&desired.api_resource, &desired.key))
                .await?;
            let status = match &live {
                Some(object) => health::evaluate(object).status,
                None => HealthStatus::Missing,
            };
            if !matches!(status, HealthStatus::Healthy | HealthStatus::Unknown) {
                pending = Some(desired.key.to_string());
                break;
            }
        }

        let Some(target) = pending else {
            return Ok(());
        };
        if Instant::now() >= deadline {
            return Err(DriftwoodError::HealthCheckTimeout {
                target,
                secs: options.wave_timeout.as_secs(),
            });
        }
        cancel
            .run("wave health", async {
                sleep(options.health_poll).await;
                Ok(())
            })
            .await?;
    }
}
