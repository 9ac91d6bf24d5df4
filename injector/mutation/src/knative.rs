use oauth2_proxy_injector_k8s_api as k8s;

/// Name of Knative Serving's sidecar.
pub const QUEUE_PROXY_CONTAINER: &str = "queue-proxy";

/// Env var telling queue-proxy where to forward user traffic.
pub const USER_PORT_ENV: &str = "USER_PORT";

const KNATIVE_LABELS: [&str; 2] = [
    "serving.knative.dev/service",
    "serving.knative.dev/revision",
];

/// Returns true if the pod is managed by Knative Serving, either by label or
/// by carrying the queue-proxy container.
pub fn is_knative_pod(pod: &k8s::Pod) -> bool {
    if let Some(labels) = &pod.metadata.labels {
        if KNATIVE_LABELS.iter().any(|l| labels.contains_key(*l)) {
            return true;
        }
    }
    find_queue_proxy(pod).is_some()
}

/// Locates the queue-proxy container in the pod spec.
pub fn find_queue_proxy(pod: &k8s::Pod) -> Option<usize> {
    pod.spec
        .as_ref()?
        .containers
        .iter()
        .position(|c| c.name == QUEUE_PROXY_CONTAINER)
}

/// Finds the `USER_PORT` env var index in the given container.
pub fn find_user_port_env(pod: &k8s::Pod, container: usize) -> Option<usize> {
    pod.spec
        .as_ref()?
        .containers
        .get(container)?
        .env
        .as_ref()?
        .iter()
        .position(|e| e.name == USER_PORT_ENV)
}
