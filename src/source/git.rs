// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Git repository mirrors, revision resolution and commit checkouts.

use crate::error::{classify_git_error, DriftwoodError, Result};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

/// Checkouts kept per repository unless configured otherwise
pub const DEFAULT_RETAINED_CHECKOUTS: usize = 5;

/// Local cache of remote repositories
pub struct GitSource {
    cache_dir: PathBuf,
    timeout: Duration,
    retained_checkouts: usize,
    repo_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    /// Checked out commits per repository, most recently used first
    recent: Mutex<HashMap<String, VecDeque<String>>>,
}

impl GitSource {
    pub fn new(cache_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            timeout,
            retained_checkouts: DEFAULT_RETAINED_CHECKOUTS,
            repo_locks: Mutex::new(HashMap::new()),
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Keep at most `count` checkouts per repository; at least one is kept
    pub fn with_retained_checkouts(mut self, count: usize) -> Self {
        self.retained_checkouts = count.max(1);
        self
    }

    /// Directory name for a repository URL, readable and collision free
    fn cache_name(repo_url: &str) -> String {
        let mut hasher = DefaultHasher::new();
        repo_url.hash(&mut hasher);

        let tail: String = repo_url
            .trim_end_matches('/')
            .trim_end_matches(".git")
            .rsplit(['/', ':'])
            .next()
            .unwrap_or("repo")
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        format!("{}-{:016x}", tail, hasher.finish())
    }

    fn mirror_dir(&self, repo_url: &str) -> PathBuf {
        self.cache_dir.join("mirrors").join(Self::cache_name(repo_url))
    }

    fn checkouts_dir(&self, repo_url: &str) -> PathBuf {
        self.cache_dir.join("checkouts").join(Self::cache_name(repo_url))
    }

    fn checkout_dir(&self, repo_url: &str, sha: &str) -> PathBuf {
        self.checkouts_dir(repo_url).join(sha)
    }

    fn repo_lock(&self, repo_url: &str) -> Arc<tokio::sync::Mutex<()>> {
        // A poisoned map only loses locks, which are recreated on demand
        let mut locks = self
            .repo_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(repo_url.to_string()).or_default().clone()
    }

    /// Clone or update the mirror of a repository
    #[instrument(skip(self))]
    pub async fn fetch(&self, repo_url: &str) -> Result<()> {
        let lock = self.repo_lock(repo_url);
        let _guard = lock.lock().await;

        let mirror = self.mirror_dir(repo_url);
        if mirror.join("HEAD").exists() {
            debug!("Updating mirror {}", mirror.display());
            self.git(Some(&mirror), &["remote", "update", "--prune"])
                .await?;
            return Ok(());
        }

        info!("Cloning {} into {}", repo_url, mirror.display());
        if let Some(parent) = mirror.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DriftwoodError::Git(format!("creating cache directory: {}", e)))?;
        }
        let target = mirror.to_string_lossy().to_string();
        let cloned = self
            .git(None, &["clone", "--mirror", "--quiet", "--", repo_url, &target])
            .await;
        if cloned.is_err() {
            let _ = tokio::fs::remove_dir_all(&mirror).await;
        }
        cloned.map(|_| ())
    }

    /// Fetch a repository and resolve a revision to a commit SHA
    pub async fn resolve_revision(&self, repo_url: &str, revision: &str) -> Result<String> {
        self.fetch(repo_url).await?;
        self.resolve_fetched(repo_url, revision).await
    }

    /// Resolve a revision against the mirror as last fetched.
    ///
    /// Branches, tags and (abbreviated) SHAs are accepted; empty means HEAD.
    #[instrument(skip(self))]
    pub async fn resolve_fetched(&self, repo_url: &str, revision: &str) -> Result<String> {
        let revision = match revision.trim() {
            "" => "HEAD",
            rev => rev,
        };
        let lock = self.repo_lock(repo_url);
        let _guard = lock.lock().await;

        let spec = format!("{}^{{commit}}", revision);
        let output = self
            .git(
                Some(&self.mirror_dir(repo_url)),
                &["rev-parse", "--verify", "--quiet", &spec],
            )
            .await
            .map_err(|e| match e {
                DriftwoodError::Git(_) => DriftwoodError::Git(format!(
                    "revision '{}' not found in {}",
                    revision, repo_url
                )),
                other => other,
            })?;
        Ok(output.trim().to_string())
    }

    /// Materialize the tree of a commit, reusing an earlier checkout.
    ///
    /// Only the most recently used checkouts of a repository are kept on
    /// disk; older ones are removed when a new one is created.
    #[instrument(skip(self))]
    pub async fn checkout(&self, repo_url: &str, sha: &str) -> Result<PathBuf> {
        let target = self.checkout_dir(repo_url, sha);
        if target.is_dir() {
            self.mark_used(repo_url, sha);
            return Ok(target);
        }

        let lock = self.repo_lock(repo_url);
        let _guard = lock.lock().await;
        if target.is_dir() {
            self.mark_used(repo_url, sha);
            return Ok(target);
        }

        let staging = target.with_extension("tmp");
        let _ = tokio::fs::remove_dir_all(&staging).await;
        if let Some(parent) = staging.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DriftwoodError::Git(format!("creating checkout directory: {}", e)))?;
        }

        let mirror = self.mirror_dir(repo_url).to_string_lossy().to_string();
        let staging_arg = staging.to_string_lossy().to_string();
        self.git(
            None,
            &["clone", "--quiet", "--shared", "--no-checkout", &mirror, &staging_arg],
        )
        .await?;
        self.git(Some(&staging), &["checkout", "--quiet", "--detach", sha])
            .await?;

        tokio::fs::rename(&staging, &target)
            .await
            .map_err(|e| DriftwoodError::Git(format!("finalizing checkout of {}: {}", sha, e)))?;
        debug!("Checked out {} at {}", sha, target.display());

        self.mark_used(repo_url, sha);
        self.remove_stale_checkouts(repo_url).await;
        Ok(target)
    }

    fn mark_used(&self, repo_url: &str, sha: &str) {
        let mut recent = self.recent.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let shas = recent.entry(repo_url.to_string()).or_default();
        shas.retain(|s| s != sha);
        shas.push_front(sha.to_string());
        shas.truncate(self.retained_checkouts);
    }

    /// Remove checkouts outside the retained window. Caller holds the repo lock.
    async fn remove_stale_checkouts(&self, repo_url: &str) {
        let keep: HashSet<String> = {
            let recent = self.recent.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            recent
                .get(repo_url)
                .map(|shas| shas.iter().cloned().collect())
                .unwrap_or_default()
        };

        let Ok(mut entries) = tokio::fs::read_dir(self.checkouts_dir(repo_url)).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            if keep.contains(&*entry.file_name().to_string_lossy()) {
                continue;
            }
            let path = entry.path();
            debug!("Removing checkout {}", path.display());
            if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                warn!("Failed to remove checkout {}: {}", path.display(), e);
            }
        }
    }

    /// Drop the mirror and checkouts of a repository that is no longer tracked
    #[instrument(skip(self))]
    pub async fn forget(&self, repo_url: &str) {
        let lock = self.repo_lock(repo_url);
        let _guard = lock.lock().await;

        for dir in [self.mirror_dir(repo_url), self.checkouts_dir(repo_url)] {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => debug!("Removed {}", dir.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", dir.display(), e),
            }
        }
        self.recent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(repo_url);

        // Held by the map and by us only; otherwise someone is waiting on it
        let mut locks = self
            .repo_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if Arc::strong_count(&lock) == 2 {
            locks.remove(repo_url);
        }
    }

    /// Run git with a timeout and without ever prompting for credentials
    async fn git(&self, dir: Option<&Path>, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("git");
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        cmd.args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(output) => output
                .map_err(|e| DriftwoodError::Git(format!("failed to run git: {}", e)))?,
            Err(_) => {
                return Err(DriftwoodError::GitNetwork(format!(
                    "git {} timed out after {}s",
                    args.first().unwrap_or(&""),
                    self.timeout.as_secs()
                )))
            }
        };

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = if stderr.trim().is_empty() {
                format!("git {} exited with {}", args.join(" "), output.status)
            } else {
                stderr.to_string()
            };
            Err(classify_git_error(&stderr))
        }
    }
}
