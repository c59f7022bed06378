// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Derived status values reported on Applications and their resources.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether live state matches the desired manifests
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, schemars::JsonSchema)]
pub enum SyncStatus {
    Synced,
    OutOfSync,
    #[default]
    Unknown,
}

/// Runtime health of a resource or an application.
///
/// Variants are declared from best to worst, so the derived ordering can be
/// used to pick the pessimistic aggregate.
#[derive(
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    schemars::JsonSchema,
)]
pub enum HealthStatus {
    Healthy,
    Progressing,
    Missing,
    Degraded,
    #[default]
    Unknown,
}

/// Self-heal state of an application
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, schemars::JsonSchema)]
pub enum AppPhase {
    InSync,
    #[default]
    OutOfSync,
    Syncing,
    Error,
}

/// What a sync needs to do with a resource
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, schemars::JsonSchema)]
pub enum SyncAction {
    Create,
    Update,
    Delete,
    NoOp,
}

/// Outcome of one resource within a sync operation
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, schemars::JsonSchema)]
pub enum ResultCode {
    Synced,
    Pruned,
    SyncFailed,
    Skipped,
}

/// Outcome of a whole sync operation
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, schemars::JsonSchema)]
pub enum OperationPhase {
    Running,
    Succeeded,
    Failed,
    Terminated,
}

macro_rules! display_as_debug {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // pad honours width and alignment, unlike derived Debug
                f.pad(&format!("{:?}", self))
            }
        })*
    };
}

display_as_debug!(
    SyncStatus,
    HealthStatus,
    AppPhase,
    SyncAction,
    ResultCode,
    OperationPhase
);
