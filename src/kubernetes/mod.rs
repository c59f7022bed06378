// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Kubernetes utilities for CRD discovery, destination clients, object access and namespaces.

pub mod client;
pub mod cluster;
pub mod crd;
pub mod namespaces;

pub use client::create_destination_client;
pub use cluster::{ApplyParams, ClusterClient, KubeCluster};
pub use crd::wait_for_application_crd;
pub use namespaces::ensure_namespace_exists;
