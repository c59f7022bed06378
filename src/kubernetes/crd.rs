// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Waiting for the Application CRD to be served

use crate::constants::crd::{POLL_INTERVAL_SECS, POLL_MAX_INTERVAL_SECS};
use crate::error::{DriftwoodError, Result};
use crate::types::Application;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{Api, Client, CustomResourceExt};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Wait until the Application CRD is established, backing off from
/// POLL_INTERVAL_SECS up to POLL_MAX_INTERVAL_SECS between checks.
pub async fn wait_for_application_crd(client: &Client) -> Result<()> {
    let name = Application::crd_name();
    let mut interval = POLL_INTERVAL_SECS;

    loop {
        match application_crd_established(client).await {
            Ok(true) => {
                info!("CRD {} is established", name);
                return Ok(());
            }
            Ok(false) => info!("CRD {} not yet established, waiting {}s", name, interval),
            Err(e) => warn!("Checking CRD {} failed: {}, retrying in {}s", name, e, interval),
        }

        sleep(Duration::from_secs(interval)).await;
        interval = (interval * 2).min(POLL_MAX_INTERVAL_SECS);
    }
}

async fn application_crd_established(client: &Client) -> Result<bool> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let crd = crds
        .get_opt(Application::crd_name())
        .await
        .map_err(DriftwoodError::from)?;

    Ok(crd
        .as_ref()
        .and_then(|crd| crd.status.as_ref())
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Established" && c.status == "True")
        }))
}
