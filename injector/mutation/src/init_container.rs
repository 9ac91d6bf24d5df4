use crate::sidecar::PortMapping;
use oauth2_proxy_injector_config::EffectiveConfig;
use oauth2_proxy_injector_k8s_api as k8s;

/// Name of the packet-filter init container.
pub const INIT_CONTAINER_NAME: &str = "oauth2-proxy-iptables-init";

/// Builds the init container that blocks direct access to the protected port,
/// or `None` when the feature is disabled.
///
/// The container installs INPUT-chain rules accepting loopback traffic and
/// dropping everything else on the protected port, so external callers can
/// only reach the app through the sidecar. Kubelet probes originate from the
/// node and are blocked too; the orchestrator rewrites them to the proxy port
/// and operators are expected to list the probe paths in `ignore-paths`.
pub fn build_init_container(
    cfg: &EffectiveConfig,
    mapping: PortMapping,
    image: &str,
) -> Option<k8s::Container> {
    if !cfg.block_direct_access {
        return None;
    }

    Some(k8s::Container {
        name: INIT_CONTAINER_NAME.to_string(),
        image: Some(image.to_string()),
        command: Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            iptables_script(&[mapping.proxy_port]),
        ]),
        security_context: Some(k8s::SecurityContext {
            capabilities: Some(k8s::Capabilities {
                add: Some(vec!["NET_ADMIN".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Renders the packet-filter setup script. Rules are installed for both IPv4
/// and IPv6 so dual-stack pods can't be reached around the proxy.
fn iptables_script(ports: &[i32]) -> String {
    let mut script = String::from("#!/bin/sh\nset -e\n");
    for p in ports {
        script.push_str(&format!(
            "iptables -A INPUT -p tcp --dport {p} -s 127.0.0.1 -j ACCEPT\n"
        ));
        script.push_str(&format!("iptables -A INPUT -p tcp --dport {p} -j DROP\n"));
        script.push_str(&format!(
            "ip6tables -A INPUT -p tcp --dport {p} -s ::1 -j ACCEPT\n"
        ));
        script.push_str(&format!("ip6tables -A INPUT -p tcp --dport {p} -j DROP\n"));
    }
    script
}
