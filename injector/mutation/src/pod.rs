use crate::{
    init_container::build_init_container,
    knative,
    patch::{HandlerType, ParentHints, PatchBuilder, ProbeType},
    sidecar::{build_sidecar, calculate_port_mapping, PortMapping},
    Error, PROXY_PORT, SIDECAR_NAME,
};
use json_patch::PatchOperation;
use oauth2_proxy_injector_annotation::{self as annotation, keys};
use oauth2_proxy_injector_config::{self as config, ConfigLoader, ProxyConfig};
use oauth2_proxy_injector_k8s_api as k8s;
use std::{collections::BTreeMap, sync::Arc};
use tracing::debug;

/// Plans the sidecar-injection patch for admitted pods.
pub struct PodMutator {
    loader: Arc<dyn ConfigLoader>,

    /// ConfigMap used when a pod doesn't name one, if configured.
    default_config: Option<String>,

    /// Namespace of the default ConfigMap; typically the webhook's own.
    config_namespace: String,

    /// Image for the iptables init container.
    iptables_image: String,
}

impl PodMutator {
    pub fn new(
        loader: Arc<dyn ConfigLoader>,
        default_config: Option<String>,
        config_namespace: impl Into<String>,
        iptables_image: impl Into<String>,
    ) -> Self {
        Self {
            loader,
            default_config,
            config_namespace: config_namespace.into(),
            iptables_image: iptables_image.into(),
        }
    }

    /// Inspects the pod's annotations and returns the patch operations that
    /// inject oauth2-proxy, or an empty patch when the pod isn't opted in or
    /// was already mutated.
    pub async fn mutate(&self, pod: &k8s::Pod) -> Result<Vec<PatchOperation>, Error> {
        let empty = BTreeMap::new();
        let annotations = pod.metadata.annotations.as_ref().unwrap_or(&empty);

        let pod_cfg = annotation::parse(annotations)?;
        if !pod_cfg.enabled {
            return Ok(Vec::new());
        }
        if is_already_injected(pod) {
            debug!("sidecar already present, skipping");
            return Ok(Vec::new());
        }

        let base = match self.config_coordinates(&pod_cfg, pod) {
            Some((name, namespace)) => self.loader.load(&name, &namespace).await?,
            None => ProxyConfig::empty(),
        };

        let effective = config::merge(&base, &pod_cfg)?;
        debug!(%effective, "merged proxy config");

        let mapping = if effective.protected_port.is_empty() {
            // Upstream-only mode: no port mapping and no probe rewrites.
            PortMapping {
                tls_mode: effective.upstream_tls,
                ..PortMapping::default()
            }
        } else {
            calculate_port_mapping(&collect_container_ports(pod), &effective)?
        };

        let init_container = build_init_container(&effective, mapping, &self.iptables_image);
        let (sidecar, volumes) = build_sidecar(&effective, mapping);

        let mut builder = PatchBuilder::new(ParentHints::from_pod(pod));
        if let Some(init) = &init_container {
            builder.add_init_container(init)?;
        }
        builder.add_container(&sidecar)?;

        if annotation::is_named_port(&effective.protected_port) {
            // The sidecar takes over the name, so the app's own port entry
            // has to go; probes that referenced the name are repointed at the
            // original port number.
            if let Some((container, port)) = find_protected_port(pod, &effective.protected_port) {
                builder.remove_container_port(container, port);
            }
            for rw in takeover_probe_rewrites(pod, &effective.protected_port, mapping.proxy_port) {
                builder.replace_probe_port(rw.container, rw.probe, rw.handler, rw.port);
            }
        }

        if effective.block_direct_access {
            // Kubelet probes come from the node, which the packet filter
            // blocks; they have to go through the proxy instead.
            for rw in blocked_access_probe_rewrites(pod, &effective.protected_port, mapping)? {
                builder.replace_probe_port(rw.container, rw.probe, rw.handler, rw.port);
            }
        }

        for volume in &volumes {
            builder.add_volume(volume)?;
        }

        if knative::is_knative_pod(pod) {
            let container = knative::find_queue_proxy(pod)
                .ok_or(Error::UnexpectedPodShape("queue-proxy container not found"))?;
            let env = knative::find_user_port_env(pod, container).ok_or(
                Error::UnexpectedPodShape("USER_PORT env not found on queue-proxy"),
            )?;
            builder.replace_env_value(container, env, &PROXY_PORT.to_string());
        }

        builder.add_annotation(keys::INJECTED, "true");
        Ok(builder.build())
    }

    /// Picks the ConfigMap coordinates: the pod-annotated name under the
    /// pod's namespace, else the webhook default, else none (annotation-only
    /// deployment mode).
    fn config_coordinates(
        &self,
        cfg: &annotation::PodConfig,
        pod: &k8s::Pod,
    ) -> Option<(String, String)> {
        if let Some(name) = cfg.config_map_name.as_deref().filter(|n| !n.is_empty()) {
            let namespace = pod.metadata.namespace.clone().unwrap_or_default();
            return Some((name.to_string(), namespace));
        }
        self.default_config
            .as_deref()
            .filter(|n| !n.is_empty())
            .map(|name| (name.to_string(), self.config_namespace.clone()))
    }
}

/// A probe port that has to be rewritten.
struct ProbeRewrite {
    container: usize,
    probe: ProbeType,
    handler: HandlerType,
    port: i32,
}

fn containers(pod: &k8s::Pod) -> &[k8s::Container] {
    pod.spec
        .as_ref()
        .map(|spec| spec.containers.as_slice())
        .unwrap_or_default()
}

/// Gathers every container port in the pod, in declaration order.
fn collect_container_ports(pod: &k8s::Pod) -> Vec<k8s::ContainerPort> {
    containers(pod)
        .iter()
        .flat_map(|c| c.ports.iter().flatten().cloned())
        .collect()
}

/// Finds the `(containerIndex, portIndex)` of the named protected port.
fn find_protected_port(pod: &k8s::Pod, name: &str) -> Option<(usize, usize)> {
    for (i, c) in containers(pod).iter().enumerate() {
        for (j, p) in c.ports.iter().flatten().enumerate() {
            if p.name.as_deref() == Some(name) {
                return Some((i, j));
            }
        }
    }
    None
}

fn probes(c: &k8s::Container) -> [(ProbeType, Option<&k8s::Probe>); 3] {
    [
        (ProbeType::Liveness, c.liveness_probe.as_ref()),
        (ProbeType::Readiness, c.readiness_probe.as_ref()),
        (ProbeType::Startup, c.startup_probe.as_ref()),
    ]
}

/// Pass A: probes referencing the protected port *name* are repointed at the
/// original numeric port, preserving their target after the named port entry
/// is removed from the app container.
fn takeover_probe_rewrites(pod: &k8s::Pod, name: &str, original_port: i32) -> Vec<ProbeRewrite> {
    let mut rewrites = Vec::new();
    for (i, c) in containers(pod).iter().enumerate() {
        for (probe_type, probe) in probes(c) {
            let Some(probe) = probe else { continue };
            if let Some(handler) = handler_with_port_name(probe, name) {
                rewrites.push(ProbeRewrite {
                    container: i,
                    probe: probe_type,
                    handler,
                    port: original_port,
                });
            }
        }
    }
    rewrites
}

fn handler_with_port_name(probe: &k8s::Probe, name: &str) -> Option<HandlerType> {
    if let Some(get) = &probe.http_get {
        if matches!(&get.port, k8s::IntOrString::String(s) if s == name) {
            return Some(HandlerType::HttpGet);
        }
    }
    if let Some(tcp) = &probe.tcp_socket {
        if matches!(&tcp.port, k8s::IntOrString::String(s) if s == name) {
            return Some(HandlerType::TcpSocket);
        }
    }
    None
}

/// Pass B: with direct access blocked, probes targeting the protected port
/// (by name or number) are redirected to the proxy port. Only `httpGet` and
/// `tcpSocket` handlers carry ports; `grpc` and `exec` probes are untouched.
fn blocked_access_probe_rewrites(
    pod: &k8s::Pod,
    protected_port: &str,
    mapping: PortMapping,
) -> Result<Vec<ProbeRewrite>, Error> {
    let number = if annotation::is_named_port(protected_port) {
        mapping.proxy_port
    } else {
        protected_port.parse::<i32>().map_err(|_| {
            annotation::InvalidAnnotationValue::new(
                keys::PROTECTED_PORT,
                protected_port,
                "not a valid port number",
            )
        })?
    };

    let mut rewrites = Vec::new();
    for (i, c) in containers(pod).iter().enumerate() {
        for (probe_type, probe) in probes(c) {
            let Some(probe) = probe else { continue };
            let (handler, port) = if let Some(get) = &probe.http_get {
                (HandlerType::HttpGet, &get.port)
            } else if let Some(tcp) = &probe.tcp_socket {
                (HandlerType::TcpSocket, &tcp.port)
            } else {
                continue;
            };

            let matched = match port {
                k8s::IntOrString::String(s) => s == protected_port,
                k8s::IntOrString::Int(v) => *v == number,
            };
            if matched {
                rewrites.push(ProbeRewrite {
                    container: i,
                    probe: probe_type,
                    handler,
                    port: PROXY_PORT,
                });
            }
        }
    }

    Ok(rewrites)
}

/// The webhook's annotation alone isn't proof of injection; the sidecar must
/// also still be present for the pod to be skipped.
fn is_already_injected(pod: &k8s::Pod) -> bool {
    let annotated = pod
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(keys::INJECTED));
    annotated && containers(pod).iter().any(|c| c.name == SIDECAR_NAME)
}
