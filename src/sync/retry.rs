// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Bounded exponential backoff for sync retries.

use crate::config::Config;
use crate::types::application::RetryStrategy;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: u32,
    pub max: Duration,
    /// Attempts after the first one; zero disables retrying
    pub max_attempts: u32,
}

impl Backoff {
    /// Backoff of an Application's retry strategy, with configured defaults
    pub fn from_strategy(strategy: Option<&RetryStrategy>, config: &Config) -> Self {
        let backoff = strategy.and_then(|s| s.backoff.as_ref());
        Self {
            initial: backoff
                .and_then(|b| b.duration_seconds)
                .map(Duration::from_secs)
                .unwrap_or(config.sync_retry_base),
            factor: backoff.and_then(|b| b.factor).unwrap_or(2).max(1),
            max: backoff
                .and_then(|b| b.max_duration_seconds)
                .map(Duration::from_secs)
                .unwrap_or(config.sync_retry_max),
            max_attempts: strategy
                .and_then(|s| s.limit)
                .unwrap_or(config.sync_retry_limit),
        }
    }

    /// Retries of a single API call during a sync, independent of the
    /// Application's retry strategy
    pub fn api_calls() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 2,
            max: Duration::from_secs(5),
            max_attempts: 3,
        }
    }

    /// No retries at all
    pub fn none() -> Self {
        Self {
            initial: Duration::ZERO,
            factor: 1,
            max: Duration::ZERO,
            max_attempts: 0,
        }
    }

    /// Delay before retry number `attempt` (1-based), None once exhausted
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let multiplier = self.factor.saturating_pow(attempt - 1);
        Some(self.initial.saturating_mul(multiplier).min(self.max))
    }
}
