// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Periodic polling of the repositories that Applications track.

use crate::error::{DriftwoodError, Result};
use crate::source::GitSource;
use crate::sync::{SyncEvent, SyncManagerHandle};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Commands accepted by the SourceTracker
#[derive(Debug, Clone)]
pub enum TrackerCommand {
    /// Start or update tracking of an application's source
    Watch {
        name: String,
        repo_url: String,
        revision: String,
    },
    Unwatch { name: String },
}

/// Handle to send commands to the SourceTracker.
///
/// Sending never blocks: the tracker itself waits on the SyncManager's queue
/// when it reports revisions, so the manager must never wait on the tracker.
#[derive(Clone)]
pub struct TrackerHandle {
    command_tx: mpsc::UnboundedSender<TrackerCommand>,
}

impl TrackerHandle {
    pub fn send(&self, command: TrackerCommand) {
        if let Err(e) = self.command_tx.send(command) {
            error!("Failed to send command to SourceTracker: {}", e);
        }
    }

    /// A handle whose commands are delivered to the returned receiver
    #[cfg(test)]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TrackerCommand>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        (Self { command_tx }, command_rx)
    }
}

struct Watched {
    repo_url: String,
    revision: String,
    last_seen: Option<String>,
}

/// Outcome of polling one repository
struct PollResult {
    repo_url: String,
    resolved: Vec<(String, Result<String>)>,
}

/// Polls tracked repositories and reports new commits to the SyncManager.
///
/// Each repository is polled in its own task, so a slow remote only delays
/// the applications that use it.
pub struct SourceTracker {
    git: Arc<GitSource>,
    interval: Duration,
    command_rx: mpsc::UnboundedReceiver<TrackerCommand>,
    events: SyncManagerHandle,
    watched: HashMap<String, Watched>,
    in_flight: HashSet<String>,
}

impl SourceTracker {
    pub fn new(
        git: Arc<GitSource>,
        interval: Duration,
        events: SyncManagerHandle,
    ) -> (Self, TrackerHandle) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let tracker = Self {
            git,
            interval,
            command_rx,
            events,
            watched: HashMap::new(),
            in_flight: HashSet::new(),
        };
        (tracker, TrackerHandle { command_tx })
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        info!(
            "SourceTracker started, polling every {}s",
            self.interval.as_secs()
        );
        let (result_tx, mut result_rx) = mpsc::channel::<PollResult>(64);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                _ = ticker.tick() => self.poll_all(&result_tx),
                Some(result) = result_rx.recv() => self.handle_result(result).await,
            }
        }

        info!("SourceTracker stopped");
        Ok(())
    }

    fn handle_command(&mut self, command: TrackerCommand) {
        match command {
            TrackerCommand::Watch {
                name,
                repo_url,
                revision,
            } => {
                let unchanged = self
                    .watched
                    .get(&name)
                    .is_some_and(|w| w.repo_url == repo_url && w.revision == revision);
                if !unchanged {
                    debug!("Tracking {}@{} for application {}", repo_url, revision, name);
                    let previous = self.watched.insert(
                        name,
                        Watched {
                            repo_url,
                            revision,
                            last_seen: None,
                        },
                    );
                    if let Some(previous) = previous {
                        self.release_repository(&previous.repo_url);
                    }
                }
            }
            TrackerCommand::Unwatch { name } => {
                if let Some(previous) = self.watched.remove(&name) {
                    debug!("Stopped tracking source of application {}", name);
                    self.release_repository(&previous.repo_url);
                }
            }
        }
    }

    /// Drop the cache of a repository once no application tracks it
    fn release_repository(&self, repo_url: &str) {
        if self.watched.values().any(|w| w.repo_url == repo_url) {
            return;
        }
        info!("No application tracks {} anymore, dropping its cache", repo_url);
        let git = self.git.clone();
        let repo_url = repo_url.to_string();
        tokio::spawn(async move { git.forget(&repo_url).await });
    }

    fn poll_all(&mut self, result_tx: &mpsc::Sender<PollResult>) {
        let mut repos: HashMap<&str, BTreeSet<String>> = HashMap::new();
        for watched in self.watched.values() {
            repos
                .entry(watched.repo_url.as_str())
                .or_default()
                .insert(watched.revision.clone());
        }

        for (repo_url, revisions) in repos {
            if self.in_flight.contains(repo_url) {
                debug!("Previous poll of {} still running, skipping", repo_url);
                continue;
            }
            self.in_flight.insert(repo_url.to_string());

            let git = self.git.clone();
            let repo_url = repo_url.to_string();
            let result_tx = result_tx.clone();
            tokio::spawn(async move {
                let resolved = poll_repository(&git, &repo_url, revisions).await;
                let _ = result_tx.send(PollResult { repo_url, resolved }).await;
            });
        }
    }

    async fn handle_result(&mut self, result: PollResult) {
        self.in_flight.remove(&result.repo_url);

        for (name, watched) in self.watched.iter_mut() {
            if watched.repo_url != result.repo_url {
                continue;
            }
            let Some((_, resolved)) = result
                .resolved
                .iter()
                .find(|(revision, _)| *revision == watched.revision)
            else {
                continue;
            };

            match resolved {
                Ok(sha) if watched.last_seen.as_deref() != Some(sha.as_str()) => {
                    info!(
                        "Revision {} of {} resolved to {}",
                        watched.revision, watched.repo_url, sha
                    );
                    watched.last_seen = Some(sha.clone());
                    self.events
                        .send(SyncEvent::RevisionChanged {
                            name: name.clone(),
                            revision: sha.clone(),
                        })
                        .await;
                }
                Ok(_) => {}
                Err(e) => warn!(
                    "Failed to poll {} for application {}: {}",
                    watched.repo_url, name, e
                ),
            }
        }
    }
}

/// Fetch a repository once and resolve every requested revision
async fn poll_repository(
    git: &GitSource,
    repo_url: &str,
    revisions: BTreeSet<String>,
) -> Vec<(String, Result<String>)> {
    if let Err(e) = git.fetch(repo_url).await {
        let message = e.to_string();
        let retryable = e.is_retryable();
        return revisions
            .into_iter()
            .map(|revision| {
                let err = if retryable {
                    DriftwoodError::GitNetwork(message.clone())
                } else {
                    DriftwoodError::Git(message.clone())
                };
                (revision, Err(err))
            })
            .collect();
    }

    let mut resolved = Vec::with_capacity(revisions.len());
    for revision in revisions {
        let sha = git.resolve_fetched(repo_url, &revision).await;
        resolved.push((revision, sha));
    }
    resolved
}
