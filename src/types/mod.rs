// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Custom resource and status types.

pub mod application;
pub mod resource;
pub mod status;

pub use application::{Application, ApplicationSpec, ApplicationStatus, PolicyFlags};
pub use resource::{DesiredResource, ResourceKey};
pub use status::{AppPhase, HealthStatus, OperationPhase, ResultCode, SyncAction, SyncStatus};
