use k8s_openapi::api::apps::v1::{DaemonSet, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::Container;
use kube::core::TypeMeta;
use serde::Deserialize;
use serde_json::{Map, Value};

/// The workload kinds whose pod templates carry image change triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadKind {
    ReplicaSet,
    DaemonSet,
    StatefulSet,
}

impl WorkloadKind {
    fn from_type_meta(types: &TypeMeta) -> Option<Self> {
        let kind = match types.kind.as_str() {
            k if k == <ReplicaSet as k8s_openapi::Resource>::KIND => WorkloadKind::ReplicaSet,
            k if k == <DaemonSet as k8s_openapi::Resource>::KIND => WorkloadKind::DaemonSet,
            k if k == <StatefulSet as k8s_openapi::Resource>::KIND => WorkloadKind::StatefulSet,
            _ => return None,
        };
        kind.api_versions()
            .contains(&types.api_version.as_str())
            .then_some(kind)
    }

    /// Groups a kind is served from, legacy ones included.
    fn api_versions(self) -> &'static [&'static str] {
        match self {
            WorkloadKind::ReplicaSet | WorkloadKind::DaemonSet => {
                &["apps/v1", "apps/v1beta2", "extensions/v1beta1"]
            }
            WorkloadKind::StatefulSet => &["apps/v1", "apps/v1beta2", "apps/v1beta1"],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkloadKind::ReplicaSet => <ReplicaSet as k8s_openapi::Resource>::KIND,
            WorkloadKind::DaemonSet => <DaemonSet as k8s_openapi::Resource>::KIND,
            WorkloadKind::StatefulSet => <StatefulSet as k8s_openapi::Resource>::KIND,
        }
    }
}

/// A recognized workload, kept as the document it was read from.
///
/// Containers are read through the typed k8s-openapi view, writes only touch
/// `metadata.annotations` so every other field survives a rewrite.
#[derive(Debug, Clone, PartialEq)]
pub struct Workload {
    kind: WorkloadKind,
    containers: Vec<Container>,
    value: Value,
}

impl Workload {
    /// Reads `value` as a workload if its apiVersion and kind are recognized.
    ///
    /// Returns `Ok(None)` for every other resource, and an error when the pod
    /// template containers do not deserialize.
    pub fn from_value(value: &Value) -> Result<Option<Self>, serde_json::Error> {
        let Some(kind) = TypeMeta::deserialize(value)
            .ok()
            .as_ref()
            .and_then(WorkloadKind::from_type_meta)
        else {
            return Ok(None);
        };
        let containers = match value.pointer("/spec/template/spec/containers") {
            Some(containers) => Vec::<Container>::deserialize(containers)?,
            None => Vec::new(),
        };
        Ok(Some(Self {
            kind,
            containers,
            value: value.clone(),
        }))
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn kind(&self) -> &'static str {
        self.kind.as_str()
    }

    pub fn name(&self) -> &str {
        self.value
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Containers of the pod template, empty when the template has no pod spec.
    pub fn containers(&self) -> &[Container] {
        &self.containers
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.value
            .pointer("/metadata/annotations")
            .and_then(|annotations| annotations.get(key))
            .and_then(Value::as_str)
    }

    pub fn has_annotation(&self, key: &str) -> bool {
        self.value
            .pointer("/metadata/annotations")
            .and_then(|annotations| annotations.get(key))
            .is_some()
    }

    /// Sets an annotation, creating `metadata` and `annotations` when missing.
    pub fn set_annotation(&mut self, key: &str, annotation: String) {
        let annotations = self
            .value
            .as_object_mut()
            .and_then(|resource| object_entry(resource, "metadata"))
            .and_then(|metadata| object_entry(metadata, "annotations"));
        if let Some(annotations) = annotations {
            annotations.insert(key.to_string(), Value::String(annotation));
        }
    }
}

/// The object under `key`, replacing whatever non-object value sat there.
fn object_entry<'a>(
    map: &'a mut Map<String, Value>,
    key: &str,
) -> Option<&'a mut Map<String, Value>> {
    let entry = map.entry(key).or_insert_with(|| Value::Object(Map::new()));
    if !entry.is_object() {
        *entry = Value::Object(Map::new());
    }
    entry.as_object_mut()
}
