// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Identity of managed cluster objects.

use crate::constants::{labels, CLUSTER_SCOPED_KINDS};
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a cluster object: group/kind/namespace/name
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, schemars::JsonSchema,
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceKey {
    pub group: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceKey {
    pub fn new(group: &str, kind: &str, namespace: Option<&str>, name: &str) -> Self {
        Self {
            group: group.to_string(),
            kind: kind.to_string(),
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }

    /// Build the key of an object; None when type information or name is missing
    pub fn of(obj: &DynamicObject) -> Option<Self> {
        let types = obj.types.as_ref()?;
        let (group, _) = split_api_version(&types.api_version);
        let name = obj.metadata.name.as_deref()?;
        Some(Self::new(
            group,
            &types.kind,
            obj.metadata.namespace.as_deref(),
            name,
        ))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let group = if self.group.is_empty() {
            "core"
        } else {
            &self.group
        };
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}/{}", group, self.kind, ns, self.name),
            None => write!(f, "{}/{}/{}", group, self.kind, self.name),
        }
    }
}

/// Split an apiVersion into group and version; the core group is empty
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// Whether objects of this kind live outside namespaces
pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// API resource for an object, derived from its apiVersion and kind
pub fn api_resource_of(obj: &DynamicObject) -> Option<ApiResource> {
    let types = obj.types.as_ref()?;
    let (group, version) = split_api_version(&types.api_version);
    Some(api_resource(group, version, &types.kind))
}

pub fn api_resource(group: &str, version: &str, kind: &str) -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(group, version, kind))
}

/// Name of the application that manages an object, from its tracking label
pub fn tracking_label(obj: &DynamicObject) -> Option<&str> {
    obj.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(labels::INSTANCE))
        .map(String::as_str)
}

/// A manifest rendered from Git, ready to be compared and applied
#[derive(Clone, Debug)]
pub struct DesiredResource {
    pub key: ResourceKey,
    pub api_resource: ApiResource,
    pub object: DynamicObject,
    /// Sync wave; lower waves are applied first
    pub wave: i32,
}
