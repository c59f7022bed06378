// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Namespace management for destinations synced with `CreateNamespace=true`

use crate::error::{DriftwoodError, Result};
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{ObjectMeta, PostParams},
    Api, Client,
};
use tracing::{debug, info, instrument};

/// Ensure a namespace exists in the cluster, create if it doesn't
#[instrument(skip(client))]
pub async fn ensure_namespace_exists(client: &Client, namespace: &str) -> Result<()> {
    let namespaces: Api<Namespace> = Api::all(client.clone());

    match namespaces.get_opt(namespace).await {
        Ok(Some(_)) => {
            debug!("Namespace {} already exists", namespace);
            Ok(())
        }
        Ok(None) => {
            info!("Creating namespace {}", namespace);
            let ns = Namespace {
                metadata: ObjectMeta {
                    name: Some(namespace.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            };
            match namespaces.create(&PostParams::default(), &ns).await {
                Ok(_) => {
                    info!("Namespace {} created successfully", namespace);
                    Ok(())
                }
                // Created concurrently by someone else
                Err(kube::Error::Api(err)) if err.code == 409 => Ok(()),
                Err(e) => Err(DriftwoodError::from(e)),
            }
        }
        Err(e) => match DriftwoodError::from(e) {
            transient @ DriftwoodError::ApiUnreachable(_) => Err(transient),
            other => Err(DriftwoodError::NamespaceError(format!(
                "Failed to check/create namespace {}: {}",
                namespace, other
            ))),
        },
    }
}
