// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Desired-state rendering: turns a directory of manifests into typed resources.

use crate::constants::{annotations, labels};
use crate::error::{DriftwoodError, Result};
use crate::types::application::{validate_source_path, Application};
use crate::types::resource::{api_resource, is_cluster_scoped, split_api_version};
use crate::types::{DesiredResource, ResourceKey};
use kube::api::DynamicObject;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};
use walkdir::WalkDir;

const MANIFEST_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Settings that shape how manifests are rendered for one application
#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub app_name: String,
    pub default_namespace: String,
    pub recurse: bool,
}

impl RenderOptions {
    pub fn for_application(app: &Application) -> Self {
        use kube::ResourceExt;

        Self {
            app_name: app.name_any(),
            default_namespace: app.destination_namespace().to_string(),
            recurse: app
                .spec
                .source
                .directory
                .as_ref()
                .is_some_and(|d| d.recurse),
        }
    }
}

/// Render the manifests of an application from a checked-out repository tree
#[instrument(skip(app, checkout), fields(app = %kube::ResourceExt::name_any(app)))]
pub fn render_application(app: &Application, checkout: &Path) -> Result<Vec<DesiredResource>> {
    validate_source_path(&app.spec.source.path)?;
    let root = checkout.join(&app.spec.source.path);
    render_directory(&root, &RenderOptions::for_application(app))
}

/// Render every manifest file below `root`
pub fn render_directory(root: &Path, options: &RenderOptions) -> Result<Vec<DesiredResource>> {
    if !root.is_dir() {
        return Err(DriftwoodError::Validation(format!(
            "source path '{}' is not a directory",
            root.display()
        )));
    }

    let mut resources = Vec::new();
    let mut seen = BTreeSet::new();

    for path in manifest_files(root, options.recurse)? {
        let content = std::fs::read_to_string(&path).map_err(|e| DriftwoodError::ManifestParse {
            path: path.clone(),
            message: e.to_string(),
        })?;

        for object in parse_manifests(&content, &path)? {
            let resource = prepare(object, &path, options)?;
            if !seen.insert(resource.key.clone()) {
                return Err(DriftwoodError::Validation(format!(
                    "resource {} is declared more than once",
                    resource.key
                )));
            }
            resources.push(resource);
        }
    }

    debug!(
        "Rendered {} resources from {}",
        resources.len(),
        root.display()
    );
    Ok(resources)
}

fn manifest_files(root: &Path, recurse: bool) -> Result<Vec<PathBuf>> {
    let walker = WalkDir::new(root)
        .max_depth(if recurse { usize::MAX } else { 1 })
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| DriftwoodError::ManifestParse {
            path: root.to_path_buf(),
            message: e.to_string(),
        })?;
        let is_manifest = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| MANIFEST_EXTENSIONS.contains(&ext));
        if entry.file_type().is_file() && is_manifest {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Parse a (multi-document) YAML or JSON file into objects.
///
/// Empty documents are skipped and `List` documents are flattened.
pub fn parse_manifests(content: &str, path: &Path) -> Result<Vec<DynamicObject>> {
    let mut objects = Vec::new();

    for (index, document) in serde_yaml::Deserializer::from_str(content).enumerate() {
        let parse_error = |message: String| DriftwoodError::ManifestParse {
            path: path.to_path_buf(),
            message: format!("document {}: {}", index, message),
        };

        let yaml = serde_yaml::Value::deserialize(document).map_err(|e| parse_error(e.to_string()))?;
        if yaml.is_null() {
            continue;
        }
        let value = serde_json::to_value(&yaml).map_err(|e| parse_error(e.to_string()))?;

        if value.get("kind").and_then(Value::as_str) == Some("List") {
            let items = value
                .get("items")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for item in items {
                objects.push(to_object(item).map_err(&parse_error)?);
            }
        } else {
            objects.push(to_object(value).map_err(&parse_error)?);
        }
    }

    Ok(objects)
}

fn to_object(value: Value) -> std::result::Result<DynamicObject, String> {
    if !value.is_object() {
        return Err("manifest is not a mapping".to_string());
    }
    for (pointer, field) in [
        ("/apiVersion", "apiVersion"),
        ("/kind", "kind"),
        ("/metadata/name", "metadata.name"),
    ] {
        let present = value
            .pointer(pointer)
            .and_then(Value::as_str)
            .is_some_and(|s| !s.is_empty());
        if !present {
            return Err(format!("missing required field {}", field));
        }
    }

    let object: DynamicObject = serde_json::from_value(value).map_err(|e| e.to_string())?;
    if object.types.is_none() {
        return Err("missing apiVersion or kind".to_string());
    }
    Ok(object)
}

/// Default the namespace, add the tracking label and read the sync wave
fn prepare(mut object: DynamicObject, path: &Path, options: &RenderOptions) -> Result<DesiredResource> {
    let types = object.types.clone().ok_or_else(|| DriftwoodError::ManifestParse {
        path: path.to_path_buf(),
        message: "missing apiVersion or kind".to_string(),
    })?;
    let (group, version) = split_api_version(&types.api_version);

    if is_cluster_scoped(&types.kind) {
        object.metadata.namespace = None;
    } else if object.metadata.namespace.as_deref().map_or(true, str::is_empty) {
        object.metadata.namespace = Some(options.default_namespace.clone());
    }

    object
        .metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(labels::INSTANCE.to_string(), options.app_name.clone());

    let wave = match object
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(annotations::SYNC_WAVE))
    {
        Some(raw) => raw
            .trim()
            .parse::<i32>()
            .map_err(|_| DriftwoodError::ManifestParse {
                path: path.to_path_buf(),
                message: format!("invalid {} annotation '{}'", annotations::SYNC_WAVE, raw),
            })?,
        None => 0,
    };

    let name = object.metadata.name.clone().unwrap_or_default();
    let key = ResourceKey::new(
        group,
        &types.kind,
        object.metadata.namespace.as_deref(),
        &name,
    );

    Ok(DesiredResource {
        key,
        api_resource: api_resource(group, version, &types.kind),
        object,
        wave,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const DEPLOYMENT: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: guestbook-ui
spec:
  replicas: 2
  selector:
    matchLabels:
      app: guestbook-ui
  template:
    metadata:
      labels:
        app: guestbook-ui
    spec:
      containers:
        - name: guestbook-ui
          image: gcr.io/heptio-images/ks-guestbook-demo:0.2
"#;

    const SERVICE: &str = r#"
apiVersion: v1
kind: Service
metadata:
  name: guestbook-ui
  annotations:
    driftwood.dev/sync-wave: "1"
spec:
  ports:
    - port: 80
      targetPort: 80
  selector:
    app: guestbook-ui
"#;

    fn options() -> RenderOptions {
        RenderOptions {
            app_name: "guestbook".to_string(),
            default_namespace: "dev".to_string(),
            recurse: false,
        }
    }

    fn write(dir: &Path, name: &str, content: &str) {
        let path = dir.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_render_directory_defaults_namespace_and_labels() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "deployment.yaml", DEPLOYMENT);
        write(dir.path(), "service.yml", SERVICE);
        write(dir.path(), "README.md", "# not a manifest");

        let resources = render_directory(dir.path(), &options()).unwrap();

        assert_eq!(resources.len(), 2);
        let deployment = &resources[0];
        assert_eq!(
            deployment.key,
            ResourceKey::new("apps", "Deployment", Some("dev"), "guestbook-ui")
        );
        assert_eq!(deployment.api_resource.plural, "deployments");
        assert_eq!(deployment.wave, 0);
        assert_eq!(
            deployment.object.metadata.labels.as_ref().unwrap()[labels::INSTANCE],
            "guestbook"
        );
        assert_eq!(resources[1].key.kind, "Service");
        assert_eq!(resources[1].wave, 1);
    }

    #[test]
    fn test_multi_document_and_list_manifests() {
        let content = format!(
            "{}\n---\n---\n{}",
            DEPLOYMENT,
            r#"
apiVersion: v1
kind: List
items:
  - apiVersion: v1
    kind: ConfigMap
    metadata:
      name: settings
  - apiVersion: v1
    kind: Namespace
    metadata:
      name: dev
      namespace: ignored
"#
        );

        let objects = parse_manifests(&content, Path::new("all.yaml")).unwrap();
        assert_eq!(objects.len(), 3);

        let dir = TempDir::new().unwrap();
        write(dir.path(), "all.yaml", &content);
        let resources = render_directory(dir.path(), &options()).unwrap();
        let namespace = resources.iter().find(|r| r.key.kind == "Namespace").unwrap();
        assert_eq!(namespace.key.namespace, None);
    }

    #[test]
    fn test_explicit_namespace_is_kept() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "cm.yaml",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: shared\n  namespace: tools\n",
        );

        let resources = render_directory(dir.path(), &options()).unwrap();
        assert_eq!(resources[0].key.namespace.as_deref(), Some("tools"));
    }

    #[test]
    fn test_missing_name_is_a_parse_error() {
        let err = parse_manifests(
            "apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n",
            Path::new("cm.yaml"),
        )
        .unwrap_err();

        match err {
            DriftwoodError::ManifestParse { path, message } => {
                assert_eq!(path, PathBuf::from("cm.yaml"));
                assert!(message.contains("metadata.name"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_yaml_is_a_parse_error() {
        let err = parse_manifests("kind: [unterminated", Path::new("bad.yaml")).unwrap_err();
        assert!(matches!(err, DriftwoodError::ManifestParse { .. }));
    }

    #[test]
    fn test_duplicate_resources_are_rejected() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.yaml", DEPLOYMENT);
        write(dir.path(), "b.yaml", DEPLOYMENT);

        let err = render_directory(dir.path(), &options()).unwrap_err();
        assert!(matches!(err, DriftwoodError::Validation(_)));
    }

    #[test]
    fn test_recurse_controls_subdirectories() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "deployment.yaml", DEPLOYMENT);
        write(dir.path(), "nested/service.yaml", SERVICE);
        write(dir.path(), ".hidden/cm.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: x\n");

        let flat = render_directory(dir.path(), &options()).unwrap();
        assert_eq!(flat.len(), 1);

        let mut recursive = options();
        recursive.recurse = true;
        let all = render_directory(dir.path(), &recursive).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn test_invalid_sync_wave() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "svc.yaml",
            &SERVICE.replace("\"1\"", "\"first\""),
        );

        let err = render_directory(dir.path(), &options()).unwrap_err();
        assert!(matches!(err, DriftwoodError::ManifestParse { .. }));
    }

    #[test]
    fn test_json_manifest() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            "cm.json",
            r#"{"apiVersion":"v1","kind":"ConfigMap","metadata":{"name":"settings"},"data":{"a":"1"}}"#,
        );

        let resources = render_directory(dir.path(), &options()).unwrap();
        assert_eq!(resources[0].key.kind, "ConfigMap");
        assert_eq!(resources[0].object.data["data"]["a"], "1");
    }
}
