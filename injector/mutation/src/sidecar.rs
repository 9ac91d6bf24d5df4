use crate::{Error, PROXY_PORT, SIDECAR_NAME};
use oauth2_proxy_injector_annotation::{self as annotation, keys, UpstreamTlsMode};
use oauth2_proxy_injector_config::EffectiveConfig;
use oauth2_proxy_injector_k8s_api as k8s;

/// The proxy-to-upstream port mapping for one pod.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortMapping {
    /// The app's original container port; the sidecar's upstream targets it.
    pub proxy_port: i32,

    /// TLS mode for the upstream connection.
    pub tls_mode: UpstreamTlsMode,
}

/// Finds the container port the annotation protects.
///
/// Named ports match on the port name, numeric ports on the port number; the
/// first match across the pod's containers wins.
pub fn calculate_port_mapping(
    ports: &[k8s::ContainerPort],
    cfg: &EffectiveConfig,
) -> Result<PortMapping, Error> {
    if annotation::is_named_port(&cfg.protected_port) {
        for p in ports {
            if p.name.as_deref() == Some(cfg.protected_port.as_str()) {
                return Ok(PortMapping {
                    proxy_port: p.container_port,
                    tls_mode: cfg.upstream_tls,
                });
            }
        }
    } else {
        let number: i32 = cfg.protected_port.parse().map_err(|_| {
            annotation::InvalidAnnotationValue::new(
                keys::PROTECTED_PORT,
                &cfg.protected_port,
                "not a valid port number",
            )
        })?;
        for p in ports {
            if p.container_port == number {
                return Ok(PortMapping {
                    proxy_port: p.container_port,
                    tls_mode: cfg.upstream_tls,
                });
            }
        }
    }

    Err(Error::ProtectedPortNotFound(cfg.protected_port.clone()))
}

/// Builds the oauth2-proxy sidecar container and any volumes it needs.
///
/// In takeover mode the container port reuses the protected port's name so
/// Services selecting by name route to the proxy; otherwise the port is named
/// after the sidecar and Service mutation handles routing.
pub fn build_sidecar(cfg: &EffectiveConfig, mapping: PortMapping) -> (k8s::Container, Vec<k8s::Volume>) {
    let port_name = if annotation::is_named_port(&cfg.protected_port) {
        cfg.protected_port.clone()
    } else {
        SIDECAR_NAME.to_string()
    };

    let ping = if cfg.ping_path.is_empty() {
        "/ping"
    } else {
        cfg.ping_path.as_str()
    };
    let ready = if cfg.ready_path.is_empty() {
        "/ready"
    } else {
        cfg.ready_path.as_str()
    };

    let container = k8s::Container {
        name: SIDECAR_NAME.to_string(),
        image: Some(cfg.proxy_image.clone()),
        args: Some(build_args(cfg, mapping)),
        env: Some(build_env(cfg)),
        ports: Some(vec![k8s::ContainerPort {
            name: Some(port_name),
            container_port: PROXY_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        liveness_probe: Some(build_probe(PROXY_PORT, ping)),
        readiness_probe: Some(build_probe(PROXY_PORT, ready)),
        resources: cfg.proxy_resources.clone(),
        ..Default::default()
    };

    (container, Vec::new())
}

/// Constructs the oauth2-proxy command line.
///
/// The field iteration order is fixed so equal inputs always produce the same
/// argument sequence. Boolean flags are emitted only when they differ from the
/// proxy's own default, in explicit `--flag=value` form.
fn build_args(cfg: &EffectiveConfig, mapping: PortMapping) -> Vec<String> {
    let mut args = vec![
        format!("--provider={}", cfg.provider),
        format!("--oidc-issuer-url={}", cfg.oidc_issuer_url),
        format!("--client-id={}", cfg.client_id),
        format!("--http-address=0.0.0.0:{PROXY_PORT}"),
    ];

    if cfg.upstream.is_empty() {
        match mapping.tls_mode {
            UpstreamTlsMode::Http => {
                args.push(format!("--upstream=http://127.0.0.1:{}", mapping.proxy_port));
            }
            UpstreamTlsMode::Https => {
                args.push(format!("--upstream=https://127.0.0.1:{}", mapping.proxy_port));
            }
            UpstreamTlsMode::HttpsInsecure => {
                args.push(format!("--upstream=https://127.0.0.1:{}", mapping.proxy_port));
                args.push("--ssl-upstream-insecure-skip-verify=true".to_string());
            }
        }
    } else {
        args.push(format!("--upstream={}", cfg.upstream));
        if cfg.upstream_tls == UpstreamTlsMode::HttpsInsecure {
            args.push("--ssl-upstream-insecure-skip-verify=true".to_string());
        }
    }

    if !cfg.cookie_secure {
        args.push("--cookie-secure=false".to_string());
    }
    if cfg.skip_provider_button {
        args.push("--skip-provider-button=true".to_string());
    }
    if cfg.skip_jwt_bearer_tokens {
        args.push("--skip-jwt-bearer-tokens=true".to_string());
    }
    if cfg.pass_access_token {
        args.push("--pass-access-token=true".to_string());
    }
    if cfg.set_xauthrequest {
        args.push("--set-xauthrequest=true".to_string());
    }
    if cfg.pass_authorization_header {
        args.push("--pass-authorization-header=true".to_string());
    }

    if cfg.pkce_enabled {
        args.push("--code-challenge-method=S256".to_string());
        args.push("--client-secret-file=/dev/null".to_string());
    }

    if !cfg.scope.is_empty() {
        args.push(format!("--scope={}", cfg.scope));
    }
    if !cfg.oidc_groups_claim.is_empty() {
        args.push(format!("--oidc-groups-claim={}", cfg.oidc_groups_claim));
    }
    if !cfg.redirect_url.is_empty() {
        args.push(format!("--redirect-url={}", cfg.redirect_url));
    }
    if !cfg.cookie_name.is_empty() {
        args.push(format!("--cookie-name={}", cfg.cookie_name));
    }
    if !cfg.ping_path.is_empty() {
        args.push(format!("--ping-path={}", cfg.ping_path));
    }
    if !cfg.ready_path.is_empty() {
        args.push(format!("--ready-path={}", cfg.ready_path));
    }

    if !cfg.extra_jwt_issuers.is_empty() {
        args.push(format!(
            "--extra-jwt-issuers={}",
            cfg.extra_jwt_issuers.join(",")
        ));
    }

    for d in &cfg.email_domains {
        args.push(format!("--email-domain={d}"));
    }
    for g in &cfg.allowed_groups {
        args.push(format!("--allowed-group={g}"));
    }
    for p in &cfg.ignore_paths {
        args.push(format!("--skip-auth-route={p}"));
    }
    for p in &cfg.api_paths {
        args.push(format!("--api-route={p}"));
    }
    for d in &cfg.cookie_domains {
        args.push(format!("--cookie-domain={d}"));
    }
    for d in &cfg.whitelist_domains {
        args.push(format!("--whitelist-domain={d}"));
    }

    args.extend(cfg.extra_args.iter().cloned());

    args
}

/// Secret-sourced environment for the sidecar. The client secret is omitted
/// under PKCE, where `--client-secret-file=/dev/null` stands in.
fn build_env(cfg: &EffectiveConfig) -> Vec<k8s::EnvVar> {
    let mut env = Vec::with_capacity(2);

    if let Some(r) = &cfg.cookie_secret_ref {
        env.push(secret_env("OAUTH2_PROXY_COOKIE_SECRET", r));
    }
    if let Some(r) = &cfg.client_secret_ref {
        env.push(secret_env("OAUTH2_PROXY_CLIENT_SECRET", r));
    }

    env
}

fn secret_env(name: &str, secret: &oauth2_proxy_injector_config::SecretRef) -> k8s::EnvVar {
    k8s::EnvVar {
        name: name.to_string(),
        value_from: Some(k8s::EnvVarSource {
            secret_key_ref: Some(k8s::SecretKeySelector {
                name: Some(secret.name.clone()),
                key: secret.key.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn build_probe(port: i32, path: &str) -> k8s::Probe {
    k8s::Probe {
        http_get: Some(k8s::HTTPGetAction {
            path: Some(path.to_string()),
            port: k8s::IntOrString::Int(port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(5),
        period_seconds: Some(10),
        timeout_seconds: Some(2),
        ..Default::default()
    }
}
