// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Access to a destination cluster's objects.

use crate::constants::OPERATOR_NAME;
use crate::error::{DriftwoodError, Result};
use crate::kubernetes::ensure_namespace_exists;
use crate::types::ResourceKey;
use async_trait::async_trait;
use kube::{
    api::{ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, TypeMeta},
    Api, Client,
};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, instrument};

/// How an object is written to the cluster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyParams {
    /// Take ownership of fields managed by someone else
    pub force: bool,
    pub dry_run: bool,
}

/// Operations the reconciler needs from a destination cluster
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch one object, None when it does not exist
    async fn get(&self, resource: &ApiResource, key: &ResourceKey) -> Result<Option<DynamicObject>>;

    /// List objects of a kind across all namespaces matching a label selector
    async fn list(&self, resource: &ApiResource, label_selector: &str) -> Result<Vec<DynamicObject>>;

    /// Create or update an object with server-side apply
    async fn apply(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
        params: ApplyParams,
    ) -> Result<DynamicObject>;

    /// Delete an object; deleting a missing object succeeds
    async fn delete(&self, resource: &ApiResource, key: &ResourceKey, dry_run: bool) -> Result<()>;

    async fn ensure_namespace(&self, namespace: &str) -> Result<()>;
}

/// `ClusterClient` backed by the Kubernetes API, with every call bounded by a timeout
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    timeout: Duration,
}

impl KubeCluster {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    fn api(&self, resource: &ApiResource, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, resource),
            None => Api::all_with(self.client.clone(), resource),
        }
    }

    async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, kube::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result.map_err(DriftwoodError::from),
            Err(_) => Err(DriftwoodError::ApiUnreachable(format!(
                "{} timed out after {}s",
                what,
                self.timeout.as_secs()
            ))),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    #[instrument(skip(self, resource), fields(resource = %key))]
    async fn get(&self, resource: &ApiResource, key: &ResourceKey) -> Result<Option<DynamicObject>> {
        let api = self.api(resource, key.namespace.as_deref());
        let object = self.bounded("get", api.get_opt(&key.name)).await?;
        Ok(object.map(|o| with_types(o, resource)))
    }

    #[instrument(skip(self, resource), fields(kind = %resource.kind))]
    async fn list(&self, resource: &ApiResource, label_selector: &str) -> Result<Vec<DynamicObject>> {
        let api = self.api(resource, None);
        let lp = ListParams::default().labels(label_selector);
        match self.bounded("list", api.list(&lp)).await {
            Ok(list) => Ok(list
                .items
                .into_iter()
                .map(|o| with_types(o, resource))
                .collect()),
            // Kind not served by this cluster (e.g. CRD not installed yet)
            Err(DriftwoodError::NotFound(_)) => {
                debug!("Kind {} is not served, treating as empty", resource.kind);
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, resource, object), fields(name = ?object.metadata.name))]
    async fn apply(
        &self,
        resource: &ApiResource,
        object: &DynamicObject,
        params: ApplyParams,
    ) -> Result<DynamicObject> {
        let name = object.metadata.name.as_deref().ok_or_else(|| {
            DriftwoodError::Validation("object to apply has no metadata.name".to_string())
        })?;
        let api = self.api(resource, object.metadata.namespace.as_deref());

        let mut pp = PatchParams::apply(OPERATOR_NAME);
        if params.force {
            pp = pp.force();
        }
        pp.dry_run = params.dry_run;

        let applied = self
            .bounded("apply", api.patch(name, &pp, &Patch::Apply(object)))
            .await?;
        Ok(with_types(applied, resource))
    }

    #[instrument(skip(self, resource), fields(resource = %key))]
    async fn delete(&self, resource: &ApiResource, key: &ResourceKey, dry_run: bool) -> Result<()> {
        let api = self.api(resource, key.namespace.as_deref());
        let dp = DeleteParams {
            dry_run,
            ..DeleteParams::background()
        };

        match self.bounded("delete", api.delete(&key.name, &dp)).await {
            Ok(_) | Err(DriftwoodError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        match tokio::time::timeout(self.timeout, ensure_namespace_exists(&self.client, namespace))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(DriftwoodError::ApiUnreachable(format!(
                "ensuring namespace {} timed out",
                namespace
            ))),
        }
    }
}

/// List items come back without apiVersion/kind; fill them in from the resource
fn with_types(mut object: DynamicObject, resource: &ApiResource) -> DynamicObject {
    if object.types.is_none() {
        object.types = Some(TypeMeta {
            api_version: resource.api_version.clone(),
            kind: resource.kind.clone(),
        });
    }
    object
}
