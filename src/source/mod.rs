// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Git sources of desired state.

pub mod git;
pub mod tracker;

pub use git::GitSource;
pub use tracker::{SourceTracker, TrackerCommand, TrackerHandle};
