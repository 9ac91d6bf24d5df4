use crate::{
    types::{EffectiveConfig, ProxyConfig, SecretRef},
    Error,
};
use oauth2_proxy_injector_annotation::PodConfig;

/// Combines base ConfigMap settings with per-pod annotation overrides and
/// validates the result.
///
/// Scalar overrides replace the base value when set; list overrides replace
/// wholesale when set, including replacement with the empty list; fields that
/// only exist as annotations flow straight through.
pub fn merge(base: &ProxyConfig, pod: &PodConfig) -> Result<EffectiveConfig, Error> {
    let o = &pod.overrides;

    let cfg = EffectiveConfig {
        config_map_name: base.name.clone(),
        config_map_namespace: base.namespace.clone(),

        provider: override_str(&base.provider, &o.provider),
        oidc_issuer_url: override_str(&base.oidc_issuer_url, &o.oidc_issuer_url),
        oidc_groups_claim: override_str(&base.oidc_groups_claim, &o.oidc_groups_claim),
        scope: override_str(&base.scope, &o.scope),

        client_id: override_str(&base.client_id, &o.client_id),
        client_secret_ref: override_secret_ref(
            &base.client_secret_ref,
            &o.client_secret_ref,
            "client-secret",
        )?,
        pkce_enabled: o.pkce_enabled.unwrap_or(base.pkce_enabled),

        cookie_secret_ref: override_secret_ref(
            &base.cookie_secret_ref,
            &o.cookie_secret_ref,
            "cookie-secret",
        )?,
        cookie_domains: override_list(&base.cookie_domains, &o.cookie_domains),
        cookie_secure: o.cookie_secure.unwrap_or(base.cookie_secure),
        cookie_name: override_str(&base.cookie_name, &o.cookie_name),

        email_domains: override_list(&base.email_domains, &o.email_domains),
        allowed_groups: override_list(&base.allowed_groups, &o.allowed_groups),
        whitelist_domains: override_list(&base.whitelist_domains, &o.whitelist_domains),

        redirect_url: override_str(&base.redirect_url, &o.redirect_url),
        extra_jwt_issuers: override_list(&base.extra_jwt_issuers, &o.extra_jwt_issuers),

        pass_access_token: o.pass_access_token.unwrap_or(base.pass_access_token),
        set_xauthrequest: o.set_xauthrequest.unwrap_or(base.set_xauthrequest),
        pass_authorization_header: o
            .pass_authorization_header
            .unwrap_or(base.pass_authorization_header),
        skip_provider_button: o.skip_provider_button.unwrap_or(base.skip_provider_button),

        block_direct_access: pod.block_direct_access,
        protected_port: pod.protected_port.clone(),
        ignore_paths: pod.ignore_paths.clone(),
        api_paths: pod.api_paths.clone(),
        skip_jwt_bearer_tokens: pod.skip_jwt_bearer_tokens,
        upstream_tls: pod.upstream_tls,
        ping_path: pod.ping_path.clone(),
        ready_path: pod.ready_path.clone(),

        upstream: o.upstream.clone().unwrap_or_default(),

        extra_args: base.extra_args.clone(),
        proxy_image: override_str(&base.proxy_image, &o.proxy_image),
        proxy_resources: base.proxy_resources.clone(),
    };

    validate(&cfg)?;
    Ok(cfg)
}

fn override_str(base: &str, ovr: &Option<String>) -> String {
    ovr.clone().unwrap_or_else(|| base.to_string())
}

fn override_list(base: &[String], ovr: &Option<Vec<String>>) -> Vec<String> {
    ovr.clone().unwrap_or_else(|| base.to_vec())
}

fn override_secret_ref(
    base: &Option<SecretRef>,
    ovr: &Option<String>,
    default_key: &str,
) -> Result<Option<SecretRef>, Error> {
    match ovr {
        None => Ok(base.clone()),
        Some(v) => SecretRef::parse(v, default_key),
    }
}

fn validate(cfg: &EffectiveConfig) -> Result<(), Error> {
    let invalid = |msg: String| Error::InvalidEffectiveConfig(msg);

    if cfg.provider.is_empty() {
        return Err(invalid("provider unset".to_string()));
    }
    if cfg.provider == "oidc" && cfg.oidc_issuer_url.is_empty() {
        return Err(invalid(
            "provider type oidc requires oidc-issuer-url".to_string(),
        ));
    }
    if cfg.client_id.is_empty() {
        return Err(invalid("client-id unset".to_string()));
    }
    if !cfg.pkce_enabled && cfg.client_secret_ref.is_none() {
        return Err(invalid(
            "pkce must be enabled or client-secret-ref provided".to_string(),
        ));
    }
    if cfg.cookie_secret_ref.is_none() {
        return Err(invalid("cookie-secret-ref unset".to_string()));
    }
    if !cfg.redirect_url.is_empty() {
        // Relative callbacks like "/oauth2/callback" are valid; only an
        // outright unparseable value is rejected.
        if let Err(error) = url::Url::parse(&cfg.redirect_url) {
            if error != url::ParseError::RelativeUrlWithoutBase {
                return Err(invalid(format!("redirect-url invalid: {error}")));
            }
        }
    }
    for issuer in &cfg.extra_jwt_issuers {
        let parts: Vec<&str> = issuer.split('=').collect();
        if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
            return Err(invalid(format!(
                "extra-jwt-issuer {issuer:?} must be ISSUER=AUDIENCE"
            )));
        }
    }
    if cfg.protected_port.is_empty() && cfg.upstream.is_empty() {
        return Err(Error::MissingRequiredAnnotation(
            "protected-port or upstream must be set",
        ));
    }

    Ok(())
}
