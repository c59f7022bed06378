// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriftwoodError {
    #[error("Failed to parse manifest '{path}': {message}")]
    ManifestParse { path: PathBuf, message: String },

    #[error("Cluster API unreachable: {0}")]
    ApiUnreachable(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Apply conflict: {0}")]
    ApplyConflict(String),

    #[error("Timed out after {secs}s waiting for {target} to become healthy")]
    HealthCheckTimeout { target: String, secs: u64 },

    #[error("Git operation failed: {0}")]
    Git(String),

    #[error("Git network error: {0}")]
    GitNetwork(String),

    #[error("Failed to parse kubeconfig: {0}")]
    KubeconfigError(String),

    #[error("Namespace creation failed: {0}")]
    NamespaceError(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("A sync is already running for application {0}")]
    SyncInProgress(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Finalizer error: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<DriftwoodError>>),

    #[error("Kubernetes API error: {0}")]
    KubeError(#[source] kube::Error),
}

impl DriftwoodError {
    /// Returns true if the error is transient and the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DriftwoodError::ApiUnreachable(_)
                | DriftwoodError::GitNetwork(_)
                | DriftwoodError::HealthCheckTimeout { .. }
        )
    }
}

impl From<kube::Error> for DriftwoodError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => match resp.code {
                400 | 422 => DriftwoodError::Validation(resp.message),
                401 | 403 => DriftwoodError::Forbidden(resp.message),
                404 => DriftwoodError::NotFound(resp.message),
                409 => DriftwoodError::ApplyConflict(resp.message),
                429 | 500..=599 => DriftwoodError::ApiUnreachable(format!(
                    "{} ({}): {}",
                    resp.reason, resp.code, resp.message
                )),
                _ => DriftwoodError::KubeError(kube::Error::Api(resp)),
            },
            kube::Error::HyperError(e) => DriftwoodError::ApiUnreachable(e.to_string()),
            kube::Error::Service(e) => DriftwoodError::ApiUnreachable(e.to_string()),
            other => DriftwoodError::KubeError(other),
        }
    }
}

/// Classifies git stderr output into a network (retryable) or generic error.
pub fn classify_git_error(stderr: &str) -> DriftwoodError {
    let lower = stderr.to_lowercase();
    let network = [
        "could not resolve host",
        "connection refused",
        "connection timed out",
        "network is unreachable",
        "unable to access",
        "failed to connect",
        "the remote end hung up unexpectedly",
        "early eof",
    ];

    if network.iter().any(|needle| lower.contains(needle)) {
        DriftwoodError::GitNetwork(stderr.trim().to_string())
    } else {
        DriftwoodError::Git(stderr.trim().to_string())
    }
}

pub type Result<T> = std::result::Result<T, DriftwoodError>;
