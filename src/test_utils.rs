// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Test utilities for mocking Kubernetes API responses and cluster state.

use crate::error::{DriftwoodError, Result};
use crate::kubernetes::{ApplyParams, ClusterClient};
use crate::types::resource::{api_resource_of, split_api_version};
use crate::types::{DesiredResource, ResourceKey};
use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use http_body_util::BodyExt;
use kube::api::{ApiResource, DynamicObject};
use kube::client::Body;
use kube::Client;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tower::Service;

/// A request seen by the mock: method, path, query and body
pub type RecordedRequest = (String, String, Option<String>, String);

/// A mock HTTP service that returns predefined responses based on request paths.
#[derive(Clone)]
pub struct MockService {
    responses: Arc<Mutex<HashMap<(String, String), (u16, String)>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

impl MockService {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(HashMap::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn on(self, method: &str, path: &str, status: u16, body: &str) -> Self {
        self.responses
            .lock()
            .unwrap()
            .insert((method.to_string(), path.to_string()), (status, body.to_string()));
        self
    }

    /// Add a response for GET requests matching the path
    pub fn on_get(self, path: &str, status: u16, body: &str) -> Self {
        self.on("GET", path, status, body)
    }

    /// Add a response for POST requests matching the path
    pub fn on_post(self, path: &str, status: u16, body: &str) -> Self {
        self.on("POST", path, status, body)
    }

    /// Add a response for PATCH requests matching the path
    pub fn on_patch(self, path: &str, status: u16, body: &str) -> Self {
        self.on("PATCH", path, status, body)
    }

    /// Add a response for DELETE requests matching the path
    pub fn on_delete(self, path: &str, status: u16, body: &str) -> Self {
        self.on("DELETE", path, status, body)
    }

    /// Requests received so far, oldest first
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Build a kube Client from this mock service
    pub fn into_client(self) -> Client {
        Client::new(self, "default")
    }

    fn find_response(&self, method: &str, path: &str) -> Option<(u16, String)> {
        let responses = self.responses.lock().unwrap();

        // Try exact match first
        if let Some(resp) = responses.get(&(method.to_string(), path.to_string())) {
            return Some(resp.clone());
        }

        // Fall back to the longest registered prefix
        responses
            .iter()
            .filter(|((m, p), _)| m == method && path.starts_with(p.as_str()))
            .max_by_key(|((_, p), _)| p.len())
            .map(|(_, resp)| resp.clone())
    }
}

impl Default for MockService {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<Request<Body>> for MockService {
    type Response = Response<Body>;
    type Error = tower::BoxError;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let method = req.method().to_string();
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);
        let response = self.find_response(&method, &path);
        let requests = self.requests.clone();

        Box::pin(async move {
            let body = req.into_body().collect().await?.to_bytes();
            requests.lock().unwrap().push((
                method,
                path,
                query,
                String::from_utf8_lossy(&body).to_string(),
            ));

            let (status, body) = response.unwrap_or_else(|| {
                // Default 404 for unmatched requests
                (404, not_found_json("resource", "unknown"))
            });
            Ok(Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(Body::from(Bytes::from(body)))
                .unwrap())
        })
    }
}

/// Create a mock namespace JSON response
pub fn namespace_json(name: &str) -> String {
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": {
            "name": name,
            "uid": "test-uid"
        }
    })
    .to_string()
}

/// Create a 404 not found response
pub fn not_found_json(resource: &str, name: &str) -> String {
    status_json(404, "NotFound", &format!("{} \"{}\" not found", resource, name))
}

/// Create a failure Status response
pub fn status_json(code: u16, reason: &str, message: &str) -> String {
    serde_json::json!({
        "kind": "Status",
        "apiVersion": "v1",
        "status": "Failure",
        "message": message,
        "reason": reason,
        "code": code
    })
    .to_string()
}

pub fn live_object(value: Value) -> DynamicObject {
    serde_json::from_value(value).unwrap()
}

/// A desired resource built directly from a manifest value
pub fn desired_resource(value: Value) -> DesiredResource {
    let object = live_object(value);
    let wave = object
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(crate::constants::annotations::SYNC_WAVE))
        .and_then(|w| w.parse().ok())
        .unwrap_or(0);
    DesiredResource {
        key: ResourceKey::of(&object).unwrap(),
        api_resource: api_resource_of(&object).unwrap(),
        object,
        wave,
    }
}

/// A failure injected into the next apply or delete of a resource
#[derive(Debug, Clone, Copy)]
pub enum FakeFailure {
    Unreachable,
    Invalid,
    Conflict,
}

/// In-memory cluster used to exercise sync logic without an API server
#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<BTreeMap<ResourceKey, DynamicObject>>,
    failures: Mutex<HashMap<ResourceKey, VecDeque<FakeFailure>>>,
    calls: Mutex<Vec<String>>,
    namespaces: Mutex<BTreeSet<String>>,
    fail_lists: Mutex<bool>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, object: DynamicObject) {
        let key = ResourceKey::of(&object).unwrap();
        self.objects.lock().unwrap().insert(key, object);
    }

    pub fn object(&self, key: &ResourceKey) -> Option<DynamicObject> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    /// Mutate a stored object, simulating out-of-band changes
    pub fn edit(&self, key: &ResourceKey, f: impl FnOnce(&mut DynamicObject)) {
        if let Some(object) = self.objects.lock().unwrap().get_mut(key) {
            f(object);
        }
    }

    pub fn fail_next(&self, key: &ResourceKey, failure: FakeFailure) {
        self.failures
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .push_back(failure);
    }

    pub fn fail_lists(&self) {
        *self.fail_lists.lock().unwrap() = true;
    }

    /// Calls made so far, e.g. "apply apps/Deployment/dev/web"
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn namespaces(&self) -> BTreeSet<String> {
        self.namespaces.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_failure(&self, key: &ResourceKey) -> Option<FakeFailure> {
        self.failures
            .lock()
            .unwrap()
            .get_mut(key)
            .and_then(|queue| queue.pop_front())
    }
}

fn matches_selector(object: &DynamicObject, selector: &str) -> bool {
    selector.split(',').filter(|s| !s.is_empty()).all(|term| {
        let (k, v) = term.split_once('=').unwrap_or((term, ""));
        object
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(k))
            .is_some_and(|value| value == v)
    })
}

fn merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(t), Value::Object(p)) => {
            for (k, v) in p {
                merge(t.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
        (t, p) => *t = p.clone(),
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get(&self, _resource: &ApiResource, key: &ResourceKey) -> Result<Option<DynamicObject>> {
        self.record(format!("get {}", key));
        Ok(self.object(key))
    }

    async fn list(&self, resource: &ApiResource, label_selector: &str) -> Result<Vec<DynamicObject>> {
        if *self.fail_lists.lock().unwrap() {
            return Err(DriftwoodError::ApiUnreachable("fake outage".to_string()));
        }
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.group == resource.group && key.kind == resource.kind)
            .filter(|(_, object)| matches_selector(object, label_selector))
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn apply(
        &self,
        _resource: &ApiResource,
        object: &DynamicObject,
        params: ApplyParams,
    ) -> Result<DynamicObject> {
        let key = ResourceKey::of(object).unwrap();
        self.record(format!(
            "apply{} {}",
            if params.force { "(force)" } else { "" },
            key
        ));

        match self.next_failure(&key) {
            Some(FakeFailure::Unreachable) => {
                return Err(DriftwoodError::ApiUnreachable("fake outage".to_string()))
            }
            Some(FakeFailure::Invalid) => {
                return Err(DriftwoodError::Validation(format!("{} is invalid", key)))
            }
            Some(FakeFailure::Conflict) if !params.force => {
                return Err(DriftwoodError::ApplyConflict(format!(
                    "{} has fields owned by another manager",
                    key
                )))
            }
            _ => {}
        }

        let mut merged = match self.object(&key) {
            Some(existing) => serde_json::to_value(existing).unwrap(),
            None => Value::Object(Default::default()),
        };
        merge(&mut merged, &serde_json::to_value(object).unwrap());
        let merged: DynamicObject = serde_json::from_value(merged).unwrap();

        if !params.dry_run {
            self.objects.lock().unwrap().insert(key, merged.clone());
        }
        Ok(merged)
    }

    async fn delete(&self, _resource: &ApiResource, key: &ResourceKey, dry_run: bool) -> Result<()> {
        self.record(format!("delete {}", key));
        if let Some(FakeFailure::Unreachable) = self.next_failure(key) {
            return Err(DriftwoodError::ApiUnreachable("fake outage".to_string()));
        }
        if !dry_run {
            self.objects.lock().unwrap().remove(key);
        }
        Ok(())
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        self.record(format!("namespace {}", namespace));
        self.namespaces.lock().unwrap().insert(namespace.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_selector_matching() {
        let object = live_object(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "a", "labels": { "app": "web", "tier": "front" } }
        }));
        assert!(matches_selector(&object, "app=web"));
        assert!(matches_selector(&object, "app=web,tier=front"));
        assert!(!matches_selector(&object, "app=db"));
    }

    #[test]
    fn test_api_version_helpers_agree() {
        let object = live_object(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "a" }
        }));
        let ar = api_resource_of(&object).unwrap();
        assert_eq!(split_api_version(&ar.api_version), ("apps", "v1"));
    }
}
