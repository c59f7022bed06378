// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Application reconciler - watches Applications and hands them to the sync manager.

use crate::constants::FINALIZER;
use crate::error::{DriftwoodError, Result};
use crate::sync::{SyncEvent, SyncManagerHandle};
use crate::types::Application;
use futures::StreamExt;
use kube::{
    runtime::{
        controller::Action,
        finalizer::{finalizer, Event as Finalizer},
        Controller,
    },
    Api, Client, ResourceExt,
};
use kube_runtime::watcher::Config as WatcherConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct ApplicationReconciler {
    client: Client,
    namespace: String,
    sync_handle: SyncManagerHandle,
}

impl ApplicationReconciler {
    pub fn new(client: Client, namespace: &str, sync_handle: SyncManagerHandle) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            sync_handle,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let applications: Api<Application> = Api::namespaced(self.client.clone(), &self.namespace);
        let context = Arc::new(self);

        Controller::new(applications, WatcherConfig::default())
            .run(reconcile, error_policy, context)
            .for_each(|res| async move {
                match res {
                    Ok(o) => debug!("Reconciled application: {:?}", o),
                    Err(e) => warn!("Reconciliation error: {:?}", e),
                }
            })
            .await;

        Ok(())
    }
}

async fn reconcile(app: Arc<Application>, ctx: Arc<ApplicationReconciler>) -> Result<Action> {
    let namespace = app.namespace().unwrap_or_else(|| ctx.namespace.clone());
    let api: Api<Application> = Api::namespaced(ctx.client.clone(), &namespace);

    debug!("Reconciling application: {}/{}", namespace, app.name_any());

    finalizer(&api, FINALIZER, app, |event| async move {
        match event {
            Finalizer::Apply(app) => {
                ctx.sync_handle
                    .send(SyncEvent::ApplicationChanged {
                        app: Box::new((*app).clone()),
                    })
                    .await;
                Ok(Action::await_change())
            }
            Finalizer::Cleanup(app) => {
                info!("Application {} is being deleted", app.name_any());
                ctx.sync_handle
                    .send(SyncEvent::ApplicationDeleted {
                        name: app.name_any(),
                    })
                    .await;
                Ok::<_, DriftwoodError>(Action::await_change())
            }
        }
    })
    .await
    .map_err(|e| DriftwoodError::Finalizer(Box::new(e)))
}

fn error_policy(
    _app: Arc<Application>,
    error: &DriftwoodError,
    _ctx: Arc<ApplicationReconciler>,
) -> Action {
    error!("Reconciliation error: {}", error);
    Action::requeue(Duration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockService;
    use serde_json::json;

    fn application(finalizers: &[&str], deleting: bool) -> Application {
        let mut metadata = json!({
            "name": "guestbook",
            "namespace": "driftwood",
            "generation": 1,
            "resourceVersion": "12",
            "finalizers": finalizers,
        });
        if deleting {
            metadata["deletionTimestamp"] = json!("2026-01-01T00:00:00Z");
        }
        serde_json::from_value(json!({
            "apiVersion": "driftwood.dev/v1alpha1",
            "kind": "Application",
            "metadata": metadata,
            "spec": {
                "source": { "repoURL": "https://github.com/example/gitops-demo.git", "path": "guestbook" },
                "destination": { "namespace": "dev" }
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_finalized_application_is_handed_to_manager() {
        let mock = MockService::new();
        let client = mock.clone().into_client();
        let (handle, mut rx) = SyncManagerHandle::channel();
        let ctx = Arc::new(ApplicationReconciler::new(client, "driftwood", handle));

        let action = reconcile(Arc::new(application(&[FINALIZER], false)), ctx)
            .await
            .unwrap();

        assert_eq!(action, Action::await_change());
        match rx.try_recv() {
            Ok(SyncEvent::ApplicationChanged { app }) => assert_eq!(app.name_any(), "guestbook"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(mock.requests().is_empty());
    }

    #[tokio::test]
    async fn test_new_application_gets_finalizer() {
        let path = "/apis/driftwood.dev/v1alpha1/namespaces/driftwood/applications/guestbook";
        let updated = serde_json::to_string(&application(&[FINALIZER], false)).unwrap();
        let mock = MockService::new().on_patch(path, 200, &updated);
        let client = mock.clone().into_client();
        let (handle, mut rx) = SyncManagerHandle::channel();
        let ctx = Arc::new(ApplicationReconciler::new(client, "driftwood", handle));

        reconcile(Arc::new(application(&[], false)), ctx)
            .await
            .unwrap();

        let requests = mock.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "PATCH");
        assert!(requests[0].3.contains(FINALIZER));
        // The watch event for the patched object triggers the sync
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_deleted_application_stops_tracking() {
        let path = "/apis/driftwood.dev/v1alpha1/namespaces/driftwood/applications/guestbook";
        let released = serde_json::to_string(&application(&[], true)).unwrap();
        let mock = MockService::new().on_patch(path, 200, &released);
        let client = mock.clone().into_client();
        let (handle, mut rx) = SyncManagerHandle::channel();
        let ctx = Arc::new(ApplicationReconciler::new(client, "driftwood", handle));

        reconcile(Arc::new(application(&[FINALIZER], true)), ctx)
            .await
            .unwrap();

        match rx.try_recv() {
            Ok(SyncEvent::ApplicationDeleted { name }) => assert_eq!(name, "guestbook"),
            other => panic!("unexpected event {:?}", other),
        }
        let requests = mock.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0, "PATCH");
    }
}
