// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Structural comparison of desired and live state.
//!
//! Desired manifests are compared as a subset of the live object: fields the
//! manifest does not mention (defaults, status, server-managed metadata) never
//! produce a difference, and map key order is irrelevant.

use crate::observe::LiveState;
use crate::types::{DesiredResource, ResourceKey, SyncAction, SyncStatus};
use kube::api::DynamicObject;
use serde_json::{Map, Value};

/// Result of comparing one resource
#[derive(Clone, Debug)]
pub struct ResourceDiff {
    pub key: ResourceKey,
    pub action: SyncAction,
    /// JSON paths whose desired value differs from live
    pub changed_fields: Vec<String>,
    /// Live object absent from Git that is kept because prune is disabled
    pub requires_pruning: bool,
    pub desired: Option<DesiredResource>,
    pub live: Option<DynamicObject>,
}

impl ResourceDiff {
    pub fn sync_status(&self) -> SyncStatus {
        if self.action == SyncAction::NoOp && !self.requires_pruning {
            SyncStatus::Synced
        } else {
            SyncStatus::OutOfSync
        }
    }

    pub fn wave(&self) -> i32 {
        match &self.desired {
            Some(desired) => desired.wave,
            None => self
                .live
                .as_ref()
                .and_then(|live| live.metadata.annotations.as_ref())
                .and_then(|a| a.get(crate::constants::annotations::SYNC_WAVE))
                .and_then(|w| w.trim().parse().ok())
                .unwrap_or(0),
        }
    }
}

/// Compare one desired resource with its live counterpart
pub fn diff_resource(desired: &DesiredResource, live: Option<&DynamicObject>) -> ResourceDiff {
    let (action, changed_fields) = match live {
        None => (SyncAction::Create, Vec::new()),
        Some(live) => {
            let changed = changed_fields(&desired.object, live);
            if changed.is_empty() {
                (SyncAction::NoOp, changed)
            } else {
                (SyncAction::Update, changed)
            }
        }
    };

    ResourceDiff {
        key: desired.key.clone(),
        action,
        changed_fields,
        requires_pruning: false,
        desired: Some(desired.clone()),
        live: live.cloned(),
    }
}

/// Compare all desired resources of an application with live state.
///
/// Live objects without a desired counterpart become Delete when `prune` is
/// set and are otherwise left alone with `requires_pruning` flagged.
pub fn diff_application(
    desired: &[DesiredResource],
    live: &LiveState,
    prune: bool,
) -> Vec<ResourceDiff> {
    let mut diffs: Vec<ResourceDiff> = desired
        .iter()
        .map(|d| diff_resource(d, live.objects.get(&d.key)))
        .collect();

    for (key, object) in &live.objects {
        if desired.iter().any(|d| &d.key == key) {
            continue;
        }
        diffs.push(ResourceDiff {
            key: key.clone(),
            action: if prune {
                SyncAction::Delete
            } else {
                SyncAction::NoOp
            },
            changed_fields: Vec::new(),
            requires_pruning: !prune,
            desired: None,
            live: Some(object.clone()),
        });
    }

    diffs.sort_by(|a, b| a.key.cmp(&b.key));
    diffs
}

/// Application sync status derived from its resource diffs
pub fn sync_status(diffs: &[ResourceDiff]) -> SyncStatus {
    if diffs.iter().all(|d| d.sync_status() == SyncStatus::Synced) {
        SyncStatus::Synced
    } else {
        SyncStatus::OutOfSync
    }
}

/// Whether a sync would change anything in the cluster
pub fn has_pending_changes(diffs: &[ResourceDiff]) -> bool {
    diffs.iter().any(|d| d.action != SyncAction::NoOp)
}

/// Paths where the desired object differs from the live one
pub fn changed_fields(desired: &DynamicObject, live: &DynamicObject) -> Vec<String> {
    let mut changed = Vec::new();

    for field in ["labels", "annotations"] {
        let desired_map = metadata_map(desired, field);
        let live_map = metadata_map(live, field);
        compare(
            &desired_map,
            &live_map,
            &format!("metadata.{}", field),
            &mut changed,
        );
    }

    if let Value::Object(desired_data) = &desired.data {
        let empty = Map::new();
        let live_data = live.data.as_object().unwrap_or(&empty);
        for (key, value) in desired_data {
            if key == "status" {
                continue;
            }
            compare(
                value,
                live_data.get(key).unwrap_or(&Value::Null),
                key,
                &mut changed,
            );
        }
    }

    changed
}

fn metadata_map(obj: &DynamicObject, field: &str) -> Value {
    let map = match field {
        "labels" => obj.metadata.labels.as_ref(),
        _ => obj.metadata.annotations.as_ref(),
    };
    match map {
        Some(entries) => Value::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        ),
        None => Value::Null,
    }
}

fn compare(desired: &Value, live: &Value, path: &str, changed: &mut Vec<String>) {
    match (desired, live) {
        (Value::Object(d), Value::Object(l)) => {
            for (key, value) in d {
                compare(
                    value,
                    l.get(key).unwrap_or(&Value::Null),
                    &format!("{}.{}", path, key),
                    changed,
                );
            }
        }
        (Value::Object(d), Value::Null) => {
            if d.values().any(|v| !is_empty(v)) {
                changed.push(path.to_string());
            }
        }
        (Value::Array(d), Value::Array(l)) => {
            if d.len() != l.len() {
                changed.push(path.to_string());
                return;
            }
            for (index, (dv, lv)) in d.iter().zip(l).enumerate() {
                compare(dv, lv, &format!("{}[{}]", path, index), changed);
            }
        }
        (d, l) => {
            if !scalars_equal(d, l) {
                changed.push(path.to_string());
            }
        }
    }
}

/// Values the API server omits when serializing, so a missing live field
/// holding one of these is equal to the desired value.
fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Object(m) => m.values().all(is_empty),
        Value::Array(a) => a.is_empty(),
    }
}

fn scalars_equal(desired: &Value, live: &Value) -> bool {
    match (desired, live) {
        (d, Value::Null) => is_empty(d),
        (Value::Number(d), Value::Number(l)) => match (d.as_i64(), l.as_i64()) {
            (Some(d), Some(l)) => d == l,
            _ => d.as_f64() == l.as_f64(),
        },
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => {
            n.to_string() == *s
        }
        (d, l) => d == l,
    }
}
