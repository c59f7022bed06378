// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::source::git::DEFAULT_RETAINED_CHECKOUTS;
use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Operator configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace holding Application resources and cluster secrets
    pub namespace: String,
    /// Directory where repository mirrors and checkouts are cached
    pub repo_cache_dir: PathBuf,
    /// Commit checkouts kept on disk per repository
    pub retained_checkouts: usize,
    pub git_poll_interval: Duration,
    pub health_poll_interval: Duration,
    /// Upper bound for a single cluster API call
    pub api_timeout: Duration,
    /// Upper bound for a single git invocation
    pub git_timeout: Duration,
    /// Sync attempts before an application stays in Error
    pub sync_retry_limit: u32,
    pub sync_retry_base: Duration,
    pub sync_retry_max: Duration,
    /// How long a sync recorded by another process blocks automated syncs
    pub sync_stale_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            namespace: "driftwood".to_string(),
            repo_cache_dir: env::temp_dir().join("driftwood"),
            retained_checkouts: DEFAULT_RETAINED_CHECKOUTS,
            git_poll_interval: Duration::from_secs(180),
            health_poll_interval: Duration::from_secs(30),
            api_timeout: Duration::from_secs(30),
            git_timeout: Duration::from_secs(90),
            sync_retry_limit: 5,
            sync_retry_base: Duration::from_secs(5),
            sync_retry_max: Duration::from_secs(180),
            sync_stale_timeout: Duration::from_secs(900),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        Ok(Config {
            namespace: env::var("APPLICATION_NAMESPACE").unwrap_or(defaults.namespace),
            repo_cache_dir: env::var("REPO_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.repo_cache_dir),
            retained_checkouts: parsed_var("RETAINED_CHECKOUTS", defaults.retained_checkouts)?,
            git_poll_interval: secs_var("GIT_POLL_INTERVAL_SECS", defaults.git_poll_interval)?,
            health_poll_interval: secs_var(
                "HEALTH_POLL_INTERVAL_SECS",
                defaults.health_poll_interval,
            )?,
            api_timeout: secs_var("API_TIMEOUT_SECS", defaults.api_timeout)?,
            git_timeout: secs_var("GIT_TIMEOUT_SECS", defaults.git_timeout)?,
            sync_retry_limit: parsed_var("SYNC_RETRY_LIMIT", defaults.sync_retry_limit)?,
            sync_retry_base: secs_var("SYNC_RETRY_BASE_SECS", defaults.sync_retry_base)?,
            sync_retry_max: secs_var("SYNC_RETRY_MAX_SECS", defaults.sync_retry_max)?,
            sync_stale_timeout: secs_var("SYNC_STALE_TIMEOUT_SECS", defaults.sync_stale_timeout)?,
        })
    }
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value '{}'", name, value)),
        Err(_) => Ok(default),
    }
}

fn secs_var(name: &str, default: Duration) -> Result<Duration> {
    parsed_var(name, default.as_secs()).map(Duration::from_secs)
}
