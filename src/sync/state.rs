// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Self-heal state machine of an application.

use crate::types::application::PolicyFlags;
use crate::types::AppPhase;

/// Something that happened to an application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    /// Desired and live state were compared
    Compared {
        in_sync: bool,
        /// The diff contains at least one create, update or delete
        actionable: bool,
        /// The revision differs from the last one synced
        new_revision: bool,
    },
    /// A sync was explicitly requested
    SyncRequested,
    SyncSucceeded,
    SyncFailed { transient: bool },
    RetryDue,
}

/// Outcome of feeding an event into the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub next: AppPhase,
    pub start_sync: bool,
    pub schedule_retry: bool,
}

impl Transition {
    fn to(phase: AppPhase) -> Self {
        Self {
            next: phase,
            start_sync: false,
            schedule_retry: false,
        }
    }

    fn sync() -> Self {
        Self {
            next: AppPhase::Syncing,
            start_sync: true,
            schedule_retry: false,
        }
    }
}

pub fn next_phase(current: AppPhase, event: PhaseEvent, policy: PolicyFlags) -> Transition {
    use AppPhase::*;

    match (current, event) {
        (
            _,
            PhaseEvent::Compared {
                in_sync,
                actionable,
                new_revision,
            },
        ) => match current {
            Syncing => Transition::to(Syncing),
            _ if in_sync => Transition::to(InSync),
            // A failed application only resyncs on its own for new commits
            Error if policy.automated && new_revision && actionable => Transition::sync(),
            Error => Transition::to(Error),
            _ if policy.automated && (policy.self_heal || new_revision) && actionable => {
                Transition::sync()
            }
            _ => Transition::to(OutOfSync),
        },
        (Syncing, PhaseEvent::SyncRequested) => Transition::to(Syncing),
        (_, PhaseEvent::SyncRequested) => Transition::sync(),
        (_, PhaseEvent::SyncSucceeded) => Transition::to(InSync),
        (_, PhaseEvent::SyncFailed { transient }) => Transition {
            next: Error,
            start_sync: false,
            schedule_retry: transient,
        },
        (Error, PhaseEvent::RetryDue) => Transition::sync(),
        (phase, PhaseEvent::RetryDue) => Transition::to(phase),
    }
}
