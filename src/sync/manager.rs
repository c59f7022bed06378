// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Central coordinator for reconciling Applications.
//!
//! The manager owns one worker task per Application. Workers run in
//! parallel, and each handles its own triggers one at a time.

use crate::config::Config;
use crate::constants::initiators;
use crate::error::{DriftwoodError, Result};
use crate::kubernetes::{create_destination_client, ClusterClient, KubeCluster};
use crate::source::{GitSource, TrackerCommand, TrackerHandle};
use crate::sync::app::{
    build_status, compare, operation_state, running_operation, sync, sync_options, Comparison,
};
use crate::sync::cancel::{cancellation, CancelHandle, CancelToken};
use crate::sync::locks::SyncLocks;
use crate::sync::retry::Backoff;
use crate::sync::state::{next_phase, PhaseEvent};
use crate::types::application::{Application, ApplicationStatus, HealthInfo, OperationState};
use crate::types::{AppPhase, HealthStatus, SyncStatus};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

/// Events that the reconciler and the source tracker send to the SyncManager
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// An Application was created or updated
    ApplicationChanged { app: Box<Application> },
    /// An Application is being deleted
    ApplicationDeleted { name: String },
    /// The tracked revision of an Application resolved to a new commit
    RevisionChanged { name: String, revision: String },
}

/// Handle to send events to the SyncManager
#[derive(Clone)]
pub struct SyncManagerHandle {
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncManagerHandle {
    pub async fn send(&self, event: SyncEvent) {
        if let Err(e) = self.event_tx.send(event).await {
            error!("Failed to send event to SyncManager: {}", e);
        }
    }

    /// A handle whose events are delivered to the returned receiver
    #[cfg(test)]
    pub fn channel() -> (Self, mpsc::Receiver<SyncEvent>) {
        let (event_tx, event_rx) = mpsc::channel(256);
        (Self { event_tx }, event_rx)
    }
}

enum WorkerMsg {
    Spec(Box<Application>),
    Revision(String),
}

struct WorkerHandle {
    tx: mpsc::UnboundedSender<WorkerMsg>,
    cancel: CancelHandle,
}

/// Central coordinator for Application workers.
/// Receives events from the reconciler and the source tracker.
pub struct SyncManager {
    client: Client,
    config: Config,
    git: Arc<GitSource>,
    locks: SyncLocks,
    event_rx: mpsc::Receiver<SyncEvent>,
    tracker: Option<TrackerHandle>,
    /// Repository and revision last sent to the tracker, per application
    watches: HashMap<String, (String, String)>,
    workers: HashMap<String, WorkerHandle>,
}

impl SyncManager {
    pub fn new(client: Client, config: Config, git: Arc<GitSource>) -> (Self, SyncManagerHandle) {
        let (event_tx, event_rx) = mpsc::channel(256);

        let manager = Self {
            client,
            config,
            git,
            locks: SyncLocks::new(),
            event_rx,
            tracker: None,
            watches: HashMap::new(),
            workers: HashMap::new(),
        };

        let handle = SyncManagerHandle { event_tx };
        (manager, handle)
    }

    /// Register the tracker that polls the sources of known Applications
    pub fn with_tracker(mut self, tracker: TrackerHandle) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        info!("SyncManager started, listening for events...");

        while let Some(event) = self.event_rx.recv().await {
            self.handle_event(event).await;
        }

        for (_, worker) in self.workers.drain() {
            worker.cancel.cancel();
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::ApplicationChanged { app } => self.handle_application_changed(*app).await,
            SyncEvent::ApplicationDeleted { name } => self.handle_application_deleted(&name).await,
            SyncEvent::RevisionChanged { name, revision } => {
                match self.workers.get(&name) {
                    Some(worker) => {
                        let _ = worker.tx.send(WorkerMsg::Revision(revision));
                    }
                    None => debug!("Ignoring revision of unknown application {}", name),
                }
            }
        }
    }

    #[instrument(skip(self, app), fields(app = %app.name_any()))]
    async fn handle_application_changed(&mut self, app: Application) {
        let name = app.name_any();

        // Every status write comes back as a change; only new sources matter here
        let source = (
            app.spec.source.repo_url.clone(),
            app.target_revision().to_string(),
        );
        if self.watches.get(&name) != Some(&source) {
            if let Some(tracker) = &self.tracker {
                tracker.send(TrackerCommand::Watch {
                    name: name.clone(),
                    repo_url: source.0.clone(),
                    revision: source.1.clone(),
                });
            }
            self.watches.insert(name.clone(), source);
        }

        let app = match self.workers.get(&name) {
            Some(worker) => match worker.tx.send(WorkerMsg::Spec(Box::new(app))) {
                Ok(()) => return,
                // Worker ended; start a new one below
                Err(mpsc::error::SendError(WorkerMsg::Spec(app))) => *app,
                Err(_) => return,
            },
            None => app,
        };

        info!("Starting worker for application {}", name);
        let (tx, rx) = mpsc::unbounded_channel();
        let (cancel, token) = cancellation();
        let worker = AppWorker::new(
            app,
            self.client.clone(),
            self.config.clone(),
            self.git.clone(),
            self.locks.clone(),
            token,
        );
        tokio::spawn(worker.run(rx));
        self.workers.insert(name, WorkerHandle { tx, cancel });
    }

    async fn handle_application_deleted(&mut self, name: &str) {
        if self.watches.remove(name).is_some() {
            if let Some(tracker) = &self.tracker {
                tracker.send(TrackerCommand::Unwatch {
                    name: name.to_string(),
                });
            }
        }
        if let Some(worker) = self.workers.remove(name) {
            info!("Application {} deleted, stopping its worker", name);
            worker.cancel.cancel();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Poll,
    SpecChanged,
    NewRevision,
    RetryDue,
}

/// Reconciles a single Application for as long as it exists
struct AppWorker {
    name: String,
    app: Application,
    client: Client,
    config: Config,
    git: Arc<GitSource>,
    locks: SyncLocks,
    cancel: CancelToken,
    /// Destination server and its cluster client
    cluster: Option<(String, Arc<dyn ClusterClient>)>,
    phase: AppPhase,
    /// Commit the tracked revision currently resolves to
    revision: Option<String>,
    /// Commit of the last sync attempt, successful or not
    last_attempted: Option<String>,
    retry_count: u32,
    retry_at: Option<Instant>,
    /// Set while status records a sync started elsewhere, e.g. from the CLI.
    /// Holds the moment that sync is considered abandoned.
    external_sync: Option<Instant>,
}

impl AppWorker {
    fn new(
        app: Application,
        client: Client,
        config: Config,
        git: Arc<GitSource>,
        locks: SyncLocks,
        cancel: CancelToken,
    ) -> Self {
        let status = app.status.as_ref();
        let mut worker = Self {
            name: app.name_any(),
            phase: app.phase(),
            last_attempted: status
                .and_then(|s| s.operation_state.as_ref())
                .and_then(|op| op.revision.clone()),
            retry_count: status.map(|s| s.retry_count).unwrap_or(0),
            app,
            client,
            config,
            git,
            locks,
            cancel,
            cluster: None,
            revision: None,
            retry_at: None,
            external_sync: None,
        };
        worker.track_external_sync();
        // A sync of our own cut short by a restart is retried from scratch
        if worker.phase == AppPhase::Syncing && worker.external_sync.is_none() {
            worker.phase = AppPhase::OutOfSync;
        }
        worker
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WorkerMsg>) {
        let mut cancel = self.cancel.clone();
        let mut health_tick = tokio::time::interval(self.config.health_poll_interval);
        health_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(WorkerMsg::Spec(app)) => self.on_spec(*app).await,
                    Some(WorkerMsg::Revision(revision)) => self.on_revision(revision).await,
                    None => break,
                },
                _ = health_tick.tick() => self.reconcile(Trigger::Poll).await,
                _ = sleep_until_some(retry_at) => {
                    self.retry_at = None;
                    self.reconcile(Trigger::RetryDue).await;
                }
            }
        }

        info!("Worker for application {} stopped", self.name);
    }

    async fn on_spec(&mut self, app: Application) {
        let changed = app.metadata.generation != self.app.metadata.generation;
        self.app = app;
        self.track_external_sync();
        if !changed {
            // Status-only updates, often our own
            return;
        }

        info!("Application {} spec changed", self.name);
        // A changed destination server is picked up by destination()
        self.revision = None;
        self.last_attempted = None;
        self.retry_count = 0;
        self.retry_at = None;
        self.reconcile(Trigger::SpecChanged).await;
    }

    async fn on_revision(&mut self, revision: String) {
        if self.revision.as_deref() == Some(revision.as_str()) {
            return;
        }
        self.revision = Some(revision);
        self.reconcile(Trigger::NewRevision).await;
    }

    /// Follow a sync that another process records in status, and adopt its
    /// outcome once it finishes
    fn track_external_sync(&mut self) {
        if self.app.synced_by_other(initiators::OPERATOR) {
            if self.external_sync.is_none() {
                info!("Application {} is being synced by another process", self.name);
                self.external_sync = Some(Instant::now() + self.config.sync_stale_timeout);
                self.phase = AppPhase::Syncing;
                self.retry_at = None;
            }
            return;
        }
        if self.external_sync.take().is_none() {
            return;
        }

        let status = self.app.status.clone().unwrap_or_default();
        info!(
            "Sync of {} by another process finished, application is {:?}",
            self.name, status.phase
        );
        self.phase = status.phase;
        if let Some(revision) = status.operation_state.and_then(|op| op.revision) {
            self.last_attempted = Some(revision);
        }
        self.retry_count = status.retry_count;
    }

    #[instrument(skip(self), fields(app = %self.name))]
    async fn reconcile(&mut self, trigger: Trigger) {
        match self.try_reconcile(trigger).await {
            Ok(()) => {}
            Err(DriftwoodError::Cancelled(what)) => {
                debug!("Reconciliation of {} cancelled during {}", self.name, what)
            }
            Err(e) => {
                warn!("Reconciliation of {} failed: {}", self.name, e);
                self.fail_attempt(trigger, &e);
                self.report_error(&e).await;
            }
        }
    }

    /// Settle the phase after an error. A sync attempt that failed, including
    /// a due retry that never got to sync, ends in Error and is retried when
    /// the error is transient.
    fn fail_attempt(&mut self, trigger: Trigger, err: &DriftwoodError) {
        let attempted = self.phase == AppPhase::Syncing
            || (trigger == Trigger::RetryDue && self.phase == AppPhase::Error);
        if !attempted {
            return;
        }

        let transition = next_phase(
            AppPhase::Syncing,
            PhaseEvent::SyncFailed {
                transient: err.is_retryable(),
            },
            self.app.policy_flags(),
        );
        self.phase = transition.next;
        if transition.schedule_retry {
            self.schedule_retry();
        }
    }

    async fn try_reconcile(&mut self, trigger: Trigger) -> Result<()> {
        if let Some(abandoned_at) = self.external_sync {
            if Instant::now() < abandoned_at {
                debug!("Sync of {} by another process still running", self.name);
                return Ok(());
            }
            warn!(
                "Sync of {} by another process did not finish within {}s, taking over",
                self.name,
                self.config.sync_stale_timeout.as_secs()
            );
            self.external_sync = None;
            self.phase = AppPhase::OutOfSync;
        }

        self.app.spec.validate()?;
        let revision = self.current_revision().await?;
        let cluster = self.destination().await?;
        let flags = self.app.policy_flags();

        let comparison = compare(
            &self.app,
            &revision,
            flags.prune,
            &self.git,
            cluster.as_ref(),
            &self.cancel,
        )
        .await?;

        let event = match trigger {
            Trigger::RetryDue => PhaseEvent::RetryDue,
            Trigger::Poll | Trigger::SpecChanged | Trigger::NewRevision => PhaseEvent::Compared {
                in_sync: comparison.sync_status == SyncStatus::Synced,
                actionable: comparison.is_actionable(),
                new_revision: self.last_attempted.as_deref() != Some(revision.as_str()),
            },
        };
        let transition = next_phase(self.phase, event, flags);

        if !transition.start_sync {
            if transition.next == AppPhase::InSync {
                self.retry_count = 0;
                self.retry_at = None;
            }
            self.phase = transition.next;
            return self.write_status(&comparison, None).await;
        }

        self.run_sync(&revision, comparison, cluster.as_ref()).await
    }

    async fn run_sync(
        &mut self,
        revision: &str,
        comparison: Comparison,
        cluster: &dyn ClusterClient,
    ) -> Result<()> {
        let _guard = match self.locks.try_acquire(&self.name) {
            Ok(guard) => guard,
            Err(e) => {
                debug!("{}", e);
                return Ok(());
            }
        };

        info!("Syncing application {} to {}", self.name, revision);
        self.phase = AppPhase::Syncing;
        self.last_attempted = Some(revision.to_string());
        let running = running_operation(revision, initiators::OPERATOR, "sync in progress");
        self.write_status(&comparison, Some(running)).await?;

        let options = sync_options(&self.app, false, false);
        let report = sync(&comparison, &options, cluster, &self.cancel).await?;

        let outcome = if report.succeeded() {
            PhaseEvent::SyncSucceeded
        } else {
            PhaseEvent::SyncFailed {
                transient: report.is_transient(),
            }
        };
        let transition = next_phase(self.phase, outcome, self.app.policy_flags());
        self.phase = transition.next;
        if report.succeeded() {
            self.retry_count = 0;
            self.retry_at = None;
        } else if transition.schedule_retry {
            self.schedule_retry();
        } else {
            warn!("Sync of {} failed: {}", self.name, report.message());
        }

        let after = match compare(
            &self.app,
            revision,
            self.app.policy_flags().prune,
            &self.git,
            cluster,
            &self.cancel,
        )
        .await
        {
            Ok(after) => after,
            Err(e @ DriftwoodError::Cancelled(_)) => return Err(e),
            Err(e) => {
                warn!("Comparison after sync failed: {}", e);
                comparison
            }
        };
        let operation = operation_state(revision, initiators::OPERATOR, &report);
        self.write_status(&after, Some(operation)).await
    }

    fn schedule_retry(&mut self) {
        let strategy = self
            .app
            .spec
            .sync_policy
            .as_ref()
            .and_then(|p| p.retry.as_ref());
        let backoff = Backoff::from_strategy(strategy, &self.config);

        self.retry_count += 1;
        match backoff.delay(self.retry_count) {
            Some(delay) => {
                info!(
                    "Retrying sync of {} in {}s (attempt {} of {})",
                    self.name,
                    delay.as_secs(),
                    self.retry_count,
                    backoff.max_attempts
                );
                self.retry_at = Some(Instant::now() + delay);
            }
            None => warn!(
                "Giving up on syncing {} after {} attempts",
                self.name, backoff.max_attempts
            ),
        }
    }

    /// Commit to reconcile against, resolving the target revision on demand
    async fn current_revision(&mut self) -> Result<String> {
        if let Some(revision) = &self.revision {
            return Ok(revision.clone());
        }
        let revision = self
            .cancel
            .run(
                "resolve revision",
                self.git
                    .resolve_revision(&self.app.spec.source.repo_url, self.app.target_revision()),
            )
            .await?;
        self.revision = Some(revision.clone());
        Ok(revision)
    }

    async fn destination(&mut self) -> Result<Arc<dyn ClusterClient>> {
        let server = self.app.spec.destination.server().to_string();
        if let Some((cached, cluster)) = &self.cluster {
            if *cached == server {
                return Ok(cluster.clone());
            }
        }

        let client = self
            .cancel
            .run(
                "connect to destination",
                create_destination_client(
                    &self.client,
                    &self.app.spec.destination,
                    &self.config.namespace,
                ),
            )
            .await?;
        let cluster: Arc<dyn ClusterClient> =
            Arc::new(KubeCluster::new(client, self.config.api_timeout));
        self.cluster = Some((server, cluster.clone()));
        Ok(cluster)
    }

    async fn write_status(
        &mut self,
        comparison: &Comparison,
        operation: Option<OperationState>,
    ) -> Result<()> {
        let status = build_status(
            &self.app,
            comparison,
            self.phase,
            operation,
            self.retry_count,
        );
        self.patch_status(&status).await?;
        self.app.status = Some(status);
        Ok(())
    }

    /// Record a failed reconciliation without losing the last known resources
    async fn report_error(&mut self, err: &DriftwoodError) {
        let mut status = self.app.status.clone().unwrap_or_default();
        status.sync.status = SyncStatus::Unknown;
        status.health = HealthInfo {
            status: HealthStatus::Unknown,
            message: Some(err.to_string()),
        };
        status.phase = self.phase;
        status.retry_count = self.retry_count;
        status.observed_generation = self.app.metadata.generation;

        if let Err(e) = self.patch_status(&status).await {
            warn!("Failed to record error on {}: {}", self.name, e);
            return;
        }
        self.app.status = Some(status);
    }

    async fn patch_status(&self, status: &ApplicationStatus) -> Result<()> {
        let namespace = self
            .app
            .namespace()
            .unwrap_or_else(|| self.config.namespace.clone());
        let api: Api<Application> = Api::namespaced(self.client.clone(), &namespace);
        let patch = serde_json::json!({ "status": status });

        self.cancel
            .run("patch status", async {
                api.patch_status(&self.name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                    .map_err(DriftwoodError::from)
            })
            .await?;
        Ok(())
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::IN_CLUSTER_SERVER;
    use crate::source::git::tests::commit_files;
    use crate::test_utils::{status_json, FakeCluster, MockService};
    use crate::types::{OperationPhase, ResourceKey};
    use serde_json::{json, Value};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    const STATUS_PATH: &str =
        "/apis/driftwood.dev/v1alpha1/namespaces/driftwood/applications/guestbook/status";

    fn config_map(name: &str) -> String {
        format!(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {}\ndata:\n  key: value\n",
            name
        )
    }

    fn application(repo: &Path, sync_policy: Value) -> Application {
        serde_json::from_value(json!({
            "apiVersion": "driftwood.dev/v1alpha1",
            "kind": "Application",
            "metadata": { "name": "guestbook", "namespace": "driftwood", "generation": 1 },
            "spec": {
                "source": { "repoURL": repo.to_string_lossy(), "path": "app" },
                "destination": { "namespace": "dev" },
                "syncPolicy": sync_policy
            }
        }))
        .unwrap()
    }

    fn settings() -> ResourceKey {
        ResourceKey::new("", "ConfigMap", Some("dev"), "settings")
    }

    struct Fixture {
        upstream: TempDir,
        _cache: TempDir,
        git: Arc<GitSource>,
        cluster: Arc<FakeCluster>,
        mock: MockService,
        sha: String,
    }

    impl Fixture {
        async fn new() -> Self {
            let upstream = TempDir::new().unwrap();
            let sha = commit_files(
                upstream.path(),
                &[("app/settings.yaml", config_map("settings").as_str())],
                "initial",
            );
            let cache = TempDir::new().unwrap();
            let git = Arc::new(GitSource::new(cache.path(), Duration::from_secs(30)));
            git.fetch(&upstream.path().to_string_lossy()).await.unwrap();
            Self {
                upstream,
                _cache: cache,
                git,
                cluster: Arc::new(FakeCluster::new()),
                mock: MockService::new(),
                sha,
            }
        }

        /// Answer status writes with `code`
        fn status_responds(&self, code: u16, app: &Application) {
            let body = match code {
                200 => serde_json::to_string(app).unwrap(),
                _ => status_json(code, "ServiceUnavailable", "the server is restarting"),
            };
            self.mock.clone().on_patch(STATUS_PATH, code, &body);
        }

        fn worker_with(&self, app: Application, cancel: CancelToken) -> AppWorker {
            let mut worker = AppWorker::new(
                app,
                self.mock.clone().into_client(),
                Config::default(),
                self.git.clone(),
                SyncLocks::new(),
                cancel,
            );
            worker.revision = Some(self.sha.clone());
            let cluster: Arc<dyn ClusterClient> = self.cluster.clone();
            worker.cluster = Some((IN_CLUSTER_SERVER.to_string(), cluster));
            worker
        }

        fn worker(&self, app: Application) -> AppWorker {
            self.worker_with(app, CancelToken::never())
        }

        fn applies(&self) -> usize {
            self.cluster
                .calls()
                .iter()
                .filter(|c| c.starts_with("apply"))
                .count()
        }

        fn status_patches(&self) -> usize {
            self.mock
                .requests()
                .iter()
                .filter(|(method, path, _, _)| method == "PATCH" && path == STATUS_PATH)
                .count()
        }
    }

    fn synced_elsewhere(app: &Application, revision: &str, phase: AppPhase) -> Application {
        let mut operation = running_operation(revision, initiators::CLI, "sync from the command line");
        if phase != AppPhase::Syncing {
            operation.phase = OperationPhase::Succeeded;
        }
        let mut app = app.clone();
        app.status = Some(ApplicationStatus {
            phase,
            operation_state: Some(operation),
            ..Default::default()
        });
        app
    }

    #[tokio::test]
    async fn test_handle_delivers_events() {
        let (handle, mut rx) = SyncManagerHandle::channel();

        handle
            .send(SyncEvent::RevisionChanged {
                name: "guestbook".to_string(),
                revision: "abc123".to_string(),
            })
            .await;

        match rx.recv().await {
            Some(SyncEvent::RevisionChanged { name, revision }) => {
                assert_eq!(name, "guestbook");
                assert_eq!(revision, "abc123");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_retry_deadline_never_fires() {
        assert!(timeout(Duration::from_millis(20), sleep_until_some(None))
            .await
            .is_err());

        let soon = Instant::now() + Duration::from_millis(5);
        assert!(timeout(Duration::from_secs(1), sleep_until_some(Some(soon)))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_tracker_is_told_only_about_new_sources() {
        let cache = TempDir::new().unwrap();
        let git = Arc::new(GitSource::new(cache.path(), Duration::from_secs(5)));
        let (manager, _handle) =
            SyncManager::new(MockService::new().into_client(), Config::default(), git);
        let (tracker, mut commands) = TrackerHandle::channel();
        let mut manager = manager.with_tracker(tracker);

        let mut app = application(&cache.path().join("missing"), json!({}));
        for _ in 0..3 {
            manager
                .handle_event(SyncEvent::ApplicationChanged {
                    app: Box::new(app.clone()),
                })
                .await;
        }
        app.spec.source.target_revision = Some("v2".to_string());
        manager
            .handle_event(SyncEvent::ApplicationChanged {
                app: Box::new(app.clone()),
            })
            .await;
        manager
            .handle_event(SyncEvent::ApplicationDeleted {
                name: "guestbook".to_string(),
            })
            .await;

        let mut received = Vec::new();
        while let Ok(command) = commands.try_recv() {
            received.push(command);
        }
        assert!(
            matches!(
                received.as_slice(),
                [
                    TrackerCommand::Watch { revision: first, .. },
                    TrackerCommand::Watch { revision: second, .. },
                    TrackerCommand::Unwatch { .. },
                ] if first == "HEAD" && second == "v2"
            ),
            "{:?}",
            received
        );
        assert!(manager.workers.is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_when_starting_sync_is_retried() {
        let fx = Fixture::new().await;
        let app = application(
            fx.upstream.path(),
            json!({
                "automated": { "selfHeal": true },
                "retry": { "limit": 3, "backoff": { "durationSeconds": 1 } }
            }),
        );
        fx.status_responds(503, &app);
        let mut worker = fx.worker(app.clone());

        worker.reconcile(Trigger::Poll).await;
        assert_eq!(worker.phase, AppPhase::Error);
        assert_eq!(worker.retry_count, 1);
        assert!(worker.retry_at.is_some());
        assert_eq!(fx.applies(), 0);

        // Polling the same commit waits for the retry
        worker.reconcile(Trigger::Poll).await;
        assert_eq!(worker.phase, AppPhase::Error);
        assert_eq!(fx.applies(), 0);

        fx.status_responds(200, &app);
        worker.retry_at = None;
        worker.reconcile(Trigger::RetryDue).await;

        assert_eq!(worker.phase, AppPhase::InSync);
        assert_eq!(worker.retry_count, 0);
        assert!(worker.retry_at.is_none());
        assert!(fx.cluster.contains(&settings()));
    }

    #[tokio::test]
    async fn test_retries_stop_at_limit_until_new_revision() {
        let fx = Fixture::new().await;
        let app = application(
            fx.upstream.path(),
            json!({
                "automated": {},
                "retry": { "limit": 1, "backoff": { "durationSeconds": 1 } }
            }),
        );
        fx.status_responds(503, &app);
        let mut worker = fx.worker(app.clone());

        worker.reconcile(Trigger::Poll).await;
        assert_eq!(worker.retry_count, 1);
        assert!(worker.retry_at.is_some());

        worker.retry_at = None;
        worker.reconcile(Trigger::RetryDue).await;
        assert_eq!(worker.phase, AppPhase::Error);
        assert_eq!(worker.retry_count, 2);
        assert!(worker.retry_at.is_none());

        fx.status_responds(200, &app);
        worker.reconcile(Trigger::Poll).await;
        assert_eq!(worker.phase, AppPhase::Error);
        assert_eq!(fx.applies(), 0);

        let second = commit_files(
            fx.upstream.path(),
            &[("app/extra.yaml", config_map("extra").as_str())],
            "second",
        );
        fx.git.fetch(&fx.upstream.path().to_string_lossy()).await.unwrap();
        worker.on_revision(second.clone()).await;

        assert_eq!(worker.phase, AppPhase::InSync);
        assert_eq!(worker.retry_count, 0);
        assert_eq!(worker.last_attempted.as_deref(), Some(second.as_str()));
        assert!(fx
            .cluster
            .contains(&ResourceKey::new("", "ConfigMap", Some("dev"), "extra")));
    }

    #[tokio::test]
    async fn test_spec_change_enables_sync() {
        let fx = Fixture::new().await;
        let manual = application(fx.upstream.path(), json!({}));
        fx.status_responds(200, &manual);
        let mut worker = fx.worker(manual.clone());

        worker.reconcile(Trigger::Poll).await;
        assert_eq!(worker.phase, AppPhase::OutOfSync);
        assert_eq!(fx.applies(), 0);

        // Status-only updates never trigger a sync
        let mut echoed = manual.clone();
        echoed.status = worker.app.status.clone();
        let patches = fx.status_patches();
        worker.on_spec(echoed).await;
        assert_eq!(fx.status_patches(), patches);

        let mut automated = application(fx.upstream.path(), json!({ "automated": {} }));
        automated.metadata.generation = Some(2);
        worker.on_spec(automated).await;

        assert_eq!(worker.phase, AppPhase::InSync);
        assert_eq!(worker.last_attempted.as_deref(), Some(fx.sha.as_str()));
        assert_eq!(fx.applies(), 1);
    }

    #[tokio::test]
    async fn test_sync_started_elsewhere_is_not_duplicated() {
        let fx = Fixture::new().await;
        let app = application(fx.upstream.path(), json!({ "automated": { "selfHeal": true } }));
        fx.status_responds(200, &app);
        let mut worker = fx.worker(app.clone());

        worker
            .on_spec(synced_elsewhere(&app, &fx.sha, AppPhase::Syncing))
            .await;
        worker.reconcile(Trigger::Poll).await;
        assert_eq!(fx.applies(), 0);
        assert_eq!(fx.status_patches(), 0);

        // The other process applies and records its outcome
        let comparison = compare(
            &app,
            &fx.sha,
            false,
            &fx.git,
            fx.cluster.as_ref(),
            &CancelToken::never(),
        )
        .await
        .unwrap();
        sync(
            &comparison,
            &sync_options(&app, false, false),
            fx.cluster.as_ref(),
            &CancelToken::never(),
        )
        .await
        .unwrap();
        worker
            .on_spec(synced_elsewhere(&app, &fx.sha, AppPhase::InSync))
            .await;
        assert_eq!(worker.phase, AppPhase::InSync);
        assert_eq!(worker.last_attempted.as_deref(), Some(fx.sha.as_str()));

        worker.reconcile(Trigger::Poll).await;
        assert_eq!(worker.phase, AppPhase::InSync);
        assert_eq!(fx.applies(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_sync_elsewhere_is_taken_over() {
        let fx = Fixture::new().await;
        let app = application(fx.upstream.path(), json!({ "automated": { "selfHeal": true } }));
        fx.status_responds(200, &app);
        let mut worker = fx.worker(app.clone());
        worker.config.sync_stale_timeout = Duration::ZERO;

        worker
            .on_spec(synced_elsewhere(&app, &fx.sha, AppPhase::Syncing))
            .await;
        worker.reconcile(Trigger::Poll).await;

        assert!(worker.external_sync.is_none());
        assert_eq!(worker.phase, AppPhase::InSync);
        assert!(fx.cluster.contains(&settings()));
    }

    #[tokio::test]
    async fn test_own_running_sync_is_not_mistaken_for_another() {
        let fx = Fixture::new().await;
        let mut app = application(fx.upstream.path(), json!({ "automated": {} }));
        app.status = Some(ApplicationStatus {
            phase: AppPhase::Syncing,
            operation_state: Some(running_operation(
                &fx.sha,
                initiators::OPERATOR,
                "sync in progress",
            )),
            ..Default::default()
        });

        // Restarted in the middle of its own sync
        let worker = fx.worker(app);
        assert!(worker.external_sync.is_none());
        assert_eq!(worker.phase, AppPhase::OutOfSync);
    }

    #[tokio::test]
    async fn test_worker_syncs_and_stops_when_cancelled() {
        let fx = Fixture::new().await;
        let app = application(fx.upstream.path(), json!({ "automated": { "selfHeal": true } }));
        fx.status_responds(200, &app);
        let (cancel, token) = cancellation();
        let worker = fx.worker_with(app, token);

        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(worker.run(rx));
        tx.send(WorkerMsg::Revision(fx.sha.clone())).unwrap();

        let synced = timeout(Duration::from_secs(20), async {
            while !fx.cluster.contains(&settings()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(synced.is_ok());

        cancel.cancel();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
