// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Destination cluster client creation and kubeconfig utilities

use crate::constants::{cluster_secret, labels, IN_CLUSTER_SERVER};
use crate::error::{DriftwoodError, Result};
use crate::types::application::ApplicationDestination;
use k8s_openapi::api::core::v1::Secret;
use kube::{
    api::ListParams,
    config::{KubeConfigOptions, Kubeconfig},
    Api, Client,
};
use tracing::{debug, info, instrument};

/// Create a Kubernetes client for an application's destination cluster
#[instrument(skip(manager_client, destination), fields(server = %destination.server()))]
pub async fn create_destination_client(
    manager_client: &Client,
    destination: &ApplicationDestination,
    namespace: &str,
) -> Result<Client> {
    let server = destination.server();
    if is_in_cluster(server) {
        debug!("Destination is the local cluster");
        return Ok(manager_client.clone());
    }

    let kubeconfig = get_cluster_kubeconfig(manager_client, server, namespace).await?;
    create_client_from_kubeconfig(&kubeconfig).await
}

fn is_in_cluster(server: &str) -> bool {
    server.trim_end_matches('/') == IN_CLUSTER_SERVER
}

/// Get the kubeconfig registered for a destination server
#[instrument(skip(client))]
async fn get_cluster_kubeconfig(client: &Client, server: &str, namespace: &str) -> Result<String> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let selector = format!("{}={}", labels::SECRET_TYPE, labels::SECRET_TYPE_CLUSTER);

    info!(
        "Looking up cluster secret for '{}' in namespace '{}'...",
        server, namespace
    );

    let list = secrets
        .list(&ListParams::default().labels(&selector))
        .await
        .map_err(|e| {
            DriftwoodError::KubeconfigError(format!(
                "Failed to list cluster secrets in {}: {}",
                namespace, e
            ))
        })?;

    find_cluster_kubeconfig(&list.items, server)
}

/// Pick the kubeconfig of the cluster secret whose `server` matches
pub fn find_cluster_kubeconfig(secrets: &[Secret], server: &str) -> Result<String> {
    let wanted = server.trim_end_matches('/');

    let data = secrets
        .iter()
        .filter_map(|s| s.data.as_ref())
        .find(|data| {
            data.get(cluster_secret::SERVER)
                .and_then(|v| std::str::from_utf8(&v.0).ok())
                .is_some_and(|v| v.trim().trim_end_matches('/') == wanted)
        })
        .ok_or_else(|| {
            DriftwoodError::KubeconfigError(format!("No cluster secret registered for {}", server))
        })?;

    let Some(kubeconfig_data) = data.get(cluster_secret::KUBECONFIG) else {
        return Err(DriftwoodError::KubeconfigError(format!(
            "Cluster secret for {} does not contain '{}' key",
            server,
            cluster_secret::KUBECONFIG
        )));
    };

    String::from_utf8(kubeconfig_data.0.clone()).map_err(|e| {
        DriftwoodError::KubeconfigError(format!(
            "Failed to decode kubeconfig for cluster {}: {}",
            server, e
        ))
    })
}

/// Create a Kubernetes client from a kubeconfig string
async fn create_client_from_kubeconfig(kubeconfig: &str) -> Result<Client> {
    let kubeconfig_parsed: Kubeconfig = serde_yaml::from_str(kubeconfig).map_err(|e| {
        DriftwoodError::KubeconfigError(format!("Failed to parse kubeconfig: {}", e))
    })?;

    let client_config =
        kube::Config::from_custom_kubeconfig(kubeconfig_parsed, &KubeConfigOptions::default())
            .await
            .map_err(|e| {
                DriftwoodError::KubeconfigError(format!("Failed to create config: {}", e))
            })?;

    Client::try_from(client_config)
        .map_err(|e| DriftwoodError::KubeconfigError(format!("Failed to create client: {}", e)))
}
