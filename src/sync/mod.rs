// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Sync planning, execution and the per-application reconciliation loop.

pub mod app;
pub mod cancel;
pub mod executor;
pub mod locks;
pub mod manager;
pub mod plan;
pub mod retry;
pub mod state;

pub use app::{
    await_healthy, build_status, compare, operation_state, running_operation, sync, sync_options,
    Comparison,
};
pub use cancel::{cancellation, CancelHandle, CancelToken};
pub use executor::{SyncOptions, SyncReport};
pub use locks::SyncLocks;
pub use manager::{SyncEvent, SyncManager, SyncManagerHandle};
pub use plan::SyncPlan;
pub use state::{next_phase, PhaseEvent, Transition};
