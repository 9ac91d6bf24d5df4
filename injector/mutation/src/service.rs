use crate::{
    patch::{ParentHints, PatchBuilder},
    Error, PROXY_PORT,
};
use json_patch::PatchOperation;
use oauth2_proxy_injector_annotation::{self as annotation, InvalidAnnotationValue};
use oauth2_proxy_injector_k8s_api as k8s;
use std::collections::BTreeMap;

pub mod keys {
    //! Annotation keys recognized on Services.

    /// Comma-separated port names or numbers whose `targetPort` should be
    /// routed through oauth2-proxy.
    pub const REWRITE_PORTS: &str = "spacemule.net/oauth2-proxy.rewrite-ports";

    /// The in-pod port oauth2-proxy listens on; what `targetPort` becomes.
    pub const PROXY_PORT: &str = "spacemule.net/oauth2-proxy.proxy-port";

    /// Written by the webhook after mutation to prevent double-mutation.
    pub const SERVICE_INJECTED: &str = "spacemule.net/oauth2-proxy.service-injected";

    /// Prefix under which original `targetPort` values are stashed, suffixed
    /// with the port's name or number.
    pub const ORIGINAL_TARGET_PREFIX: &str = "spacemule.net/oauth2-proxy.original-target.";
}

struct ServiceConfig {
    rewrite_ports: Vec<String>,
    proxy_port: i32,
}

/// Rewrites the `targetPort` of annotated Service ports to the proxy port,
/// stashing the original values in annotations.
///
/// Services opt in with the `rewrite-ports` annotation; its absence, or a
/// previously written `service-injected` marker, yields an empty patch.
pub fn mutate_service(svc: &k8s::Service) -> Result<Vec<PatchOperation>, Error> {
    let empty = BTreeMap::new();
    let annotations = svc.metadata.annotations.as_ref().unwrap_or(&empty);

    if annotations.contains_key(keys::SERVICE_INJECTED) {
        return Ok(Vec::new());
    }
    let Some(cfg) = parse_service_annotations(annotations)? else {
        return Ok(Vec::new());
    };

    let mut builder = PatchBuilder::new(ParentHints::from_service(svc));

    let ports = svc
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_deref())
        .unwrap_or_default();
    for (i, port) in ports.iter().enumerate() {
        let mut matched = false;
        for id in &cfg.rewrite_ports {
            if port_matches(port, id)? {
                matched = true;
                break;
            }
        }
        if !matched {
            continue;
        }

        let key = format!("{}{}", keys::ORIGINAL_TARGET_PREFIX, port_identifier(port));
        builder.add_annotation(&key, &stash_value(port));
        builder.set_service_target_port(i, cfg.proxy_port);
    }

    builder.add_annotation(keys::SERVICE_INJECTED, "true");
    Ok(builder.build())
}

/// Parses Service annotations; `None` means the Service isn't opted in.
fn parse_service_annotations(
    annotations: &BTreeMap<String, String>,
) -> Result<Option<ServiceConfig>, Error> {
    let Some(rewrite) = annotations.get(keys::REWRITE_PORTS) else {
        return Ok(None);
    };

    let rewrite_ports = rewrite
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();

    let proxy_port = match annotations.get(keys::PROXY_PORT) {
        None => PROXY_PORT,
        Some(v) => {
            let port: i64 = v.trim().parse().map_err(|_| {
                InvalidAnnotationValue::new(keys::PROXY_PORT, v, "not a valid port number")
            })?;
            if !(1..=65535).contains(&port) {
                return Err(InvalidAnnotationValue::new(
                    keys::PROXY_PORT,
                    v,
                    "not in valid port range",
                )
                .into());
            }
            port as i32
        }
    };

    Ok(Some(ServiceConfig {
        rewrite_ports,
        proxy_port,
    }))
}

/// Whether a Service port matches a rewrite identifier. Named identifiers
/// match the port's name; numeric identifiers match the `targetPort` number
/// or the `port` itself, which covers an unset `targetPort`.
fn port_matches(port: &k8s::ServicePort, id: &str) -> Result<bool, Error> {
    if annotation::is_named_port(id) {
        return Ok(port.name.as_deref() == Some(id));
    }

    let number: i32 = id.parse().map_err(|_| {
        InvalidAnnotationValue::new(keys::REWRITE_PORTS, id, "not a valid port number")
    })?;
    let target_matches = matches!(port.target_port, Some(k8s::IntOrString::Int(v)) if v == number);
    Ok(target_matches || port.port == number)
}

/// A stable identifier for a Service port: its name, else its port number.
fn port_identifier(port: &k8s::ServicePort) -> String {
    match port.name.as_deref() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => port.port.to_string(),
    }
}

/// The original `targetPort` rendered for the stash annotation: the numeric
/// value or the named string, falling back to `port` when unset.
fn stash_value(port: &k8s::ServicePort) -> String {
    match &port.target_port {
        Some(k8s::IntOrString::Int(v)) => v.to_string(),
        Some(k8s::IntOrString::String(s)) => s.clone(),
        None => port.port.to_string(),
    }
}
