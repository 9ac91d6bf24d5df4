use crate::Error;
use json_patch::{AddOperation, PatchOperation, RemoveOperation, ReplaceOperation};
use oauth2_proxy_injector_k8s_api as k8s;
use serde_json::{json, Value};

/// Which parent objects already exist on the object under mutation.
///
/// JSON-Patch `add` into a missing map or array fails at apply time, so the
/// builder creates missing parents lazily on first use.
#[derive(Clone, Copy, Debug, Default)]
pub struct ParentHints {
    pub annotations: bool,
    pub labels: bool,
    pub volumes: bool,
    pub init_containers: bool,
}

impl ParentHints {
    pub fn from_pod(pod: &k8s::Pod) -> Self {
        Self {
            annotations: pod.metadata.annotations.is_some(),
            labels: pod.metadata.labels.is_some(),
            volumes: pod
                .spec
                .as_ref()
                .is_some_and(|spec| spec.volumes.is_some()),
            init_containers: pod
                .spec
                .as_ref()
                .is_some_and(|spec| spec.init_containers.is_some()),
        }
    }

    pub fn from_service(svc: &k8s::Service) -> Self {
        Self {
            annotations: svc.metadata.annotations.is_some(),
            labels: svc.metadata.labels.is_some(),
            ..Self::default()
        }
    }
}

/// Probe slots that can be rewritten.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeType {
    Liveness,
    Readiness,
    Startup,
}

impl ProbeType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Liveness => "livenessProbe",
            Self::Readiness => "readinessProbe",
            Self::Startup => "startupProbe",
        }
    }
}

/// Probe handlers that carry a rewritable port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerType {
    HttpGet,
    TcpSocket,
}

impl HandlerType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::HttpGet => "httpGet",
            Self::TcpSocket => "tcpSocket",
        }
    }
}

/// Accumulates JSON-Patch operations in caller order.
///
/// Callers must arrange that every path an operation references exists in the
/// document implied by the preceding operations; in particular, removals by
/// array index use pre-patch indices and must precede other edits of the same
/// array. Appends (`/-`) never disturb existing indices.
#[derive(Debug, Default)]
pub struct PatchBuilder {
    ops: Vec<PatchOperation>,
    hints: ParentHints,
}

impl PatchBuilder {
    pub fn new(hints: ParentHints) -> Self {
        Self {
            ops: Vec::new(),
            hints,
        }
    }

    /// Appends a container to `/spec/containers`.
    pub fn add_container(&mut self, container: &k8s::Container) -> Result<(), Error> {
        let value = serde_json::to_value(container)?;
        self.add("/spec/containers/-", value);
        Ok(())
    }

    /// Appends an init container, creating `/spec/initContainers` first if the
    /// pod had none.
    pub fn add_init_container(&mut self, container: &k8s::Container) -> Result<(), Error> {
        if !self.hints.init_containers {
            self.add("/spec/initContainers", json!([]));
            self.hints.init_containers = true;
        }
        let value = serde_json::to_value(container)?;
        self.add("/spec/initContainers/-", value);
        Ok(())
    }

    /// Appends a volume, creating `/spec/volumes` first if the pod had none.
    pub fn add_volume(&mut self, volume: &k8s::Volume) -> Result<(), Error> {
        if !self.hints.volumes {
            self.add("/spec/volumes", json!([]));
            self.hints.volumes = true;
        }
        let value = serde_json::to_value(volume)?;
        self.add("/spec/volumes/-", value);
        Ok(())
    }

    /// Appends a volume mount to the container at `container_index`. When
    /// `create_array` is set the `volumeMounts` array is created first.
    pub fn add_volume_mount(
        &mut self,
        container_index: usize,
        create_array: bool,
        mount: &k8s::VolumeMount,
    ) -> Result<(), Error> {
        if create_array {
            self.add(
                format!("/spec/containers/{container_index}/volumeMounts"),
                json!([]),
            );
        }
        let value = serde_json::to_value(mount)?;
        self.add(
            format!("/spec/containers/{container_index}/volumeMounts/-"),
            value,
        );
        Ok(())
    }

    /// Adds or overwrites an annotation, creating `/metadata/annotations`
    /// first if the object had none.
    pub fn add_annotation(&mut self, key: &str, value: &str) {
        if !self.hints.annotations {
            self.add("/metadata/annotations", json!({}));
            self.hints.annotations = true;
        }
        self.add(
            format!("/metadata/annotations/{}", escape_pointer(key)),
            Value::String(value.to_string()),
        );
    }

    /// Adds or overwrites a label, creating `/metadata/labels` first if the
    /// object had none.
    pub fn add_label(&mut self, key: &str, value: &str) {
        if !self.hints.labels {
            self.add("/metadata/labels", json!({}));
            self.hints.labels = true;
        }
        self.add(
            format!("/metadata/labels/{}", escape_pointer(key)),
            Value::String(value.to_string()),
        );
    }

    /// Removes a container port by pre-patch indices.
    pub fn remove_container_port(&mut self, container_index: usize, port_index: usize) {
        self.ops.push(PatchOperation::Remove(RemoveOperation {
            path: format!("/spec/containers/{container_index}/ports/{port_index}"),
        }));
    }

    /// Replaces a probe handler's port with a numeric port.
    pub fn replace_probe_port(
        &mut self,
        container_index: usize,
        probe: ProbeType,
        handler: HandlerType,
        port: i32,
    ) {
        self.ops.push(PatchOperation::Replace(ReplaceOperation {
            path: format!(
                "/spec/containers/{container_index}/{}/{}/port",
                probe.as_str(),
                handler.as_str()
            ),
            value: json!(port),
        }));
    }

    /// Replaces the value of a container's environment variable.
    pub fn replace_env_value(&mut self, container_index: usize, env_index: usize, value: &str) {
        self.ops.push(PatchOperation::Replace(ReplaceOperation {
            path: format!("/spec/containers/{container_index}/env/{env_index}/value"),
            value: Value::String(value.to_string()),
        }));
    }

    /// Sets a Service port's `targetPort`. Emitted as `add`, which overwrites
    /// an existing value and creates a missing one.
    pub fn set_service_target_port(&mut self, port_index: usize, port: i32) {
        self.add(format!("/spec/ports/{port_index}/targetPort"), json!(port));
    }

    /// Returns the accumulated operations in emission order.
    pub fn build(self) -> Vec<PatchOperation> {
        self.ops
    }

    fn add(&mut self, path: impl Into<String>, value: Value) {
        self.ops.push(PatchOperation::Add(AddOperation {
            path: path.into(),
            value,
        }));
    }
}

/// RFC 6901 escaping for map keys used in a JSON Pointer.
fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}
