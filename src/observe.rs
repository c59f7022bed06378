// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Live-state observation: which objects of an application exist in the cluster.

use crate::constants::{labels, TRACKED_KINDS};
use crate::error::Result;
use crate::kubernetes::ClusterClient;
use crate::sync::cancel::CancelToken;
use crate::types::resource::{api_resource, tracking_label};
use crate::types::{DesiredResource, ResourceKey};
use futures::future::try_join_all;
use kube::api::{ApiResource, DynamicObject};
use std::collections::BTreeMap;
use tracing::{debug, instrument};

/// Live objects of one application, keyed by identity
#[derive(Clone, Debug, Default)]
pub struct LiveState {
    pub objects: BTreeMap<ResourceKey, DynamicObject>,
}

impl LiveState {
    pub fn get(&self, key: &ResourceKey) -> Option<&DynamicObject> {
        self.objects.get(key)
    }
}

/// Observe the live counterparts of an application's resources.
///
/// Every kind that is desired, previously managed or in the default tracked
/// set is listed by tracking label, so objects removed from Git are found.
/// Desired objects that exist without the label are fetched by name.
#[instrument(skip(cluster, desired, previously_managed, cancel))]
pub async fn observe(
    cluster: &dyn ClusterClient,
    app_name: &str,
    desired: &[DesiredResource],
    previously_managed: &[ApiResource],
    cancel: &CancelToken,
) -> Result<LiveState> {
    let selector = format!("{}={}", labels::INSTANCE, app_name);

    let mut kinds: BTreeMap<(String, String), ApiResource> = BTreeMap::new();
    let tracked = TRACKED_KINDS
        .iter()
        .map(|(group, version, kind)| api_resource(group, version, kind));
    for ar in tracked
        .chain(previously_managed.iter().cloned())
        .chain(desired.iter().map(|d| d.api_resource.clone()))
    {
        kinds.insert((ar.group.clone(), ar.kind.clone()), ar);
    }

    let listings = try_join_all(
        kinds
            .values()
            .map(|ar| cancel.run("list live objects", cluster.list(ar, &selector))),
    )
    .await?;

    let mut state = LiveState::default();
    for object in listings.into_iter().flatten() {
        if tracking_label(&object) != Some(app_name) {
            continue;
        }
        if let Some(key) = ResourceKey::of(&object) {
            state.objects.insert(key, object);
        }
    }

    let unlabelled: Vec<&DesiredResource> = desired
        .iter()
        .filter(|d| !state.objects.contains_key(&d.key))
        .collect();
    let fetched = try_join_all(
        unlabelled
            .iter()
            .map(|d| cancel.run("get live object", cluster.get(&d.api_resource, &d.key))),
    )
    .await?;
    for (resource, object) in unlabelled.into_iter().zip(fetched) {
        if let Some(object) = object {
            debug!("Found unlabelled live object {}", resource.key);
            state.objects.insert(resource.key.clone(), object);
        }
    }

    debug!(
        "Observed {} live objects for application {}",
        state.objects.len(),
        app_name
    );
    Ok(state)
}
