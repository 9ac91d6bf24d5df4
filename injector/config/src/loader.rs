use crate::{
    types::{keys, ProxyConfig, SecretRef, DEFAULT_PROXY_IMAGE},
    Error,
};
use oauth2_proxy_injector_k8s_api as k8s;
use std::collections::BTreeMap;

/// Loads oauth2-proxy base configuration by `(name, namespace)`.
///
/// The trait seam keeps the cluster API out of the mutation planner so tests
/// can substitute a canned loader.
#[async_trait::async_trait]
pub trait ConfigLoader: Send + Sync {
    async fn load(&self, name: &str, namespace: &str) -> Result<ProxyConfig, Error>;
}

/// Reads configuration from Kubernetes ConfigMaps.
#[derive(Clone)]
pub struct ConfigMapLoader {
    client: k8s::Client,

    /// Used when the caller passes an empty namespace; typically the
    /// webhook's own namespace.
    default_namespace: String,
}

impl ConfigMapLoader {
    pub fn new(client: k8s::Client, default_namespace: impl Into<String>) -> Self {
        Self {
            client,
            default_namespace: default_namespace.into(),
        }
    }
}

#[async_trait::async_trait]
impl ConfigLoader for ConfigMapLoader {
    async fn load(&self, name: &str, namespace: &str) -> Result<ProxyConfig, Error> {
        let namespace = if namespace.is_empty() {
            self.default_namespace.as_str()
        } else {
            namespace
        };

        let api = k8s::Api::<k8s::ConfigMap>::namespaced(self.client.clone(), namespace);
        let cm = api.get(name).await.map_err(|source| Error::DocumentMissing {
            namespace: namespace.to_string(),
            name: name.to_string(),
            source,
        })?;

        tracing::debug!(%name, %namespace, "loaded configmap");
        parse_config_map(&cm.data.unwrap_or_default(), name, namespace)
    }
}

/// Parses ConfigMap data into a [`ProxyConfig`].
///
/// Only presence checks that catch an obviously broken document run here
/// (`provider`, `client-id`, `cookie-secret-ref`, and the conditional
/// `oidc-issuer-url` / `client-secret-ref` requirements); everything else is
/// validated after the per-pod merge.
pub fn parse_config_map(
    data: &BTreeMap<String, String>,
    name: &str,
    namespace: &str,
) -> Result<ProxyConfig, Error> {
    let mut cfg = ProxyConfig {
        name: name.to_string(),
        namespace: namespace.to_string(),
        ..ProxyConfig::default()
    };

    let missing = |key| Error::FieldMissing {
        name: name.to_string(),
        key,
    };
    let invalid = |key, reason: String| Error::InvalidField {
        name: name.to_string(),
        key,
        reason,
    };

    cfg.provider = data
        .get(keys::PROVIDER)
        .map(|v| v.trim().to_string())
        .ok_or_else(|| missing(keys::PROVIDER))?;

    match data.get(keys::OIDC_ISSUER_URL) {
        Some(v) => cfg.oidc_issuer_url = v.trim().to_string(),
        None if cfg.provider == "oidc" => return Err(missing(keys::OIDC_ISSUER_URL)),
        None => {}
    }

    cfg.client_id = data
        .get(keys::CLIENT_ID)
        .map(|v| v.trim().to_string())
        .ok_or_else(|| missing(keys::CLIENT_ID))?;

    cfg.pkce_enabled = match data.get(keys::PKCE_ENABLED) {
        Some(v) => parse_bool(v, false).map_err(|e| invalid(keys::PKCE_ENABLED, e))?,
        None => false,
    };

    match data.get(keys::CLIENT_SECRET_REF) {
        Some(v) => cfg.client_secret_ref = SecretRef::parse(v.trim(), "client-secret")?,
        None if !cfg.pkce_enabled => return Err(missing(keys::CLIENT_SECRET_REF)),
        None => {}
    }

    cfg.cookie_secret_ref = match data.get(keys::COOKIE_SECRET_REF) {
        Some(v) => SecretRef::parse(v.trim(), "cookie-secret")?,
        None => return Err(missing(keys::COOKIE_SECRET_REF)),
    };

    cfg.cookie_domains = data
        .get(keys::COOKIE_DOMAINS)
        .map(|v| split_and_trim(v, ','))
        .unwrap_or_default();

    cfg.cookie_secure = match data.get(keys::COOKIE_SECURE) {
        Some(v) => parse_bool(v, true).map_err(|e| invalid(keys::COOKIE_SECURE, e))?,
        None => true,
    };

    if let Some(v) = data.get(keys::COOKIE_NAME) {
        cfg.cookie_name = v.trim().to_string();
    }

    cfg.email_domains = data
        .get(keys::EMAIL_DOMAINS)
        .map(|v| split_and_trim(v, ','))
        .unwrap_or_default();

    if let Some(v) = data.get(keys::ALLOWED_GROUPS) {
        cfg.allowed_groups = split_and_trim(v, ',');
    }

    if let Some(v) = data.get(keys::WHITELIST_DOMAINS) {
        cfg.whitelist_domains = split_and_trim(v, ',');
    }

    if let Some(v) = data.get(keys::REDIRECT_URL) {
        cfg.redirect_url = v.trim().to_string();
    }

    if let Some(v) = data.get(keys::EXTRA_JWT_ISSUERS) {
        cfg.extra_jwt_issuers = split_and_trim(v, ',');
    }

    for (key, field) in [
        (keys::PASS_ACCESS_TOKEN, &mut cfg.pass_access_token),
        (keys::SET_XAUTHREQUEST, &mut cfg.set_xauthrequest),
        (
            keys::PASS_AUTHORIZATION_HEADER,
            &mut cfg.pass_authorization_header,
        ),
        (keys::SKIP_PROVIDER_BUTTON, &mut cfg.skip_provider_button),
    ] {
        if let Some(v) = data.get(key) {
            *field = parse_bool(v, false).map_err(|e| invalid(key, e))?;
        }
    }

    cfg.oidc_groups_claim = data
        .get(keys::OIDC_GROUPS_CLAIM)
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "groups".to_string());

    if let Some(v) = data.get(keys::SCOPE) {
        cfg.scope = v.trim().to_string();
    }

    if let Some(v) = data.get(keys::EXTRA_ARGS) {
        cfg.extra_args = split_and_trim(v, '\n');
    }

    cfg.proxy_image = data
        .get(keys::PROXY_IMAGE)
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| DEFAULT_PROXY_IMAGE.to_string());

    if let Some(v) = data.get(keys::PROXY_RESOURCES) {
        cfg.proxy_resources = Some(
            serde_json::from_str(v).map_err(|e| invalid(keys::PROXY_RESOURCES, e.to_string()))?,
        );
    }

    Ok(cfg)
}

/// Parses a boolean ConfigMap value; an empty value takes the default.
fn parse_bool(value: &str, default: bool) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "" => Ok(default),
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(format!("invalid boolean value {value:?}")),
    }
}

/// Splits on `sep`, trimming entries and dropping empties.
fn split_and_trim(value: &str, sep: char) -> Vec<String> {
    value
        .split(sep)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    fn minimal() -> BTreeMap<String, String> {
        btreemap! {
            keys::PROVIDER.to_string() => "oidc".to_string(),
            keys::OIDC_ISSUER_URL.to_string() => "https://auth.example.com/realms/main".to_string(),
            keys::CLIENT_ID.to_string() => "injector".to_string(),
            keys::CLIENT_SECRET_REF.to_string() => "oauth-secrets".to_string(),
            keys::COOKIE_SECRET_REF.to_string() => "oauth-secrets:cookie".to_string(),
        }
    }

    #[test]
    fn minimal_document() {
        let cfg = parse_config_map(&minimal(), "plex", "media").unwrap();
        assert_eq!(cfg.name, "plex");
        assert_eq!(cfg.namespace, "media");
        assert_eq!(cfg.provider, "oidc");
        assert_eq!(cfg.oidc_issuer_url, "https://auth.example.com/realms/main");
        assert_eq!(cfg.client_id, "injector");
        assert_eq!(
            cfg.client_secret_ref,
            Some(SecretRef {
                name: "oauth-secrets".to_string(),
                key: "client-secret".to_string()
            })
        );
        assert_eq!(
            cfg.cookie_secret_ref,
            Some(SecretRef {
                name: "oauth-secrets".to_string(),
                key: "cookie".to_string()
            })
        );
        // Defaults.
        assert!(cfg.cookie_secure);
        assert!(!cfg.pkce_enabled);
        assert_eq!(cfg.oidc_groups_claim, "groups");
        assert_eq!(cfg.proxy_image, DEFAULT_PROXY_IMAGE);
    }

    #[test]
    fn provider_is_required() {
        let mut data = minimal();
        data.remove(keys::PROVIDER);
        assert!(matches!(
            parse_config_map(&data, "plex", "media"),
            Err(Error::FieldMissing {
                key: keys::PROVIDER,
                ..
            })
        ));
    }

    #[test]
    fn oidc_provider_requires_issuer() {
        let mut data = minimal();
        data.remove(keys::OIDC_ISSUER_URL);
        assert!(matches!(
            parse_config_map(&data, "plex", "media"),
            Err(Error::FieldMissing {
                key: keys::OIDC_ISSUER_URL,
                ..
            })
        ));

        // Non-OIDC providers don't need it.
        let mut data = minimal();
        data.remove(keys::OIDC_ISSUER_URL);
        data.insert(keys::PROVIDER.to_string(), "github".to_string());
        assert!(parse_config_map(&data, "plex", "media").is_ok());
    }

    #[test]
    fn pkce_waives_client_secret() {
        let mut data = minimal();
        data.remove(keys::CLIENT_SECRET_REF);
        assert!(matches!(
            parse_config_map(&data, "plex", "media"),
            Err(Error::FieldMissing {
                key: keys::CLIENT_SECRET_REF,
                ..
            })
        ));

        data.insert(keys::PKCE_ENABLED.to_string(), "true".to_string());
        let cfg = parse_config_map(&data, "plex", "media").unwrap();
        assert!(cfg.pkce_enabled);
        assert_eq!(cfg.client_secret_ref, None);
    }

    #[test]
    fn cookie_secret_is_required() {
        let mut data = minimal();
        data.remove(keys::COOKIE_SECRET_REF);
        assert!(matches!(
            parse_config_map(&data, "plex", "media"),
            Err(Error::FieldMissing {
                key: keys::COOKIE_SECRET_REF,
                ..
            })
        ));
    }

    #[test]
    fn extra_args_split_on_newlines() {
        let mut data = minimal();
        data.insert(
            keys::EXTRA_ARGS.to_string(),
            "--silence-ping-logging\n\n--reverse-proxy=true\n".to_string(),
        );
        let cfg = parse_config_map(&data, "plex", "media").unwrap();
        assert_eq!(
            cfg.extra_args,
            vec!["--silence-ping-logging", "--reverse-proxy=true"]
        );
    }

    #[test]
    fn lists_and_booleans() {
        let mut data = minimal();
        data.insert(
            keys::EMAIL_DOMAINS.to_string(),
            "example.com, corp.example.com".to_string(),
        );
        data.insert(keys::COOKIE_SECURE.to_string(), "false".to_string());
        data.insert(keys::SKIP_PROVIDER_BUTTON.to_string(), "1".to_string());
        let cfg = parse_config_map(&data, "plex", "media").unwrap();
        assert_eq!(cfg.email_domains, vec!["example.com", "corp.example.com"]);
        assert!(!cfg.cookie_secure);
        assert!(cfg.skip_provider_button);
    }

    #[test]
    fn bad_boolean_is_invalid_field() {
        let mut data = minimal();
        data.insert(keys::PASS_ACCESS_TOKEN.to_string(), "maybe".to_string());
        assert!(matches!(
            parse_config_map(&data, "plex", "media"),
            Err(Error::InvalidField {
                key: keys::PASS_ACCESS_TOKEN,
                ..
            })
        ));
    }

    #[test]
    fn proxy_resources_parse_as_json() {
        let mut data = minimal();
        data.insert(
            keys::PROXY_RESOURCES.to_string(),
            r#"{"requests":{"cpu":"10m","memory":"32Mi"}}"#.to_string(),
        );
        let cfg = parse_config_map(&data, "plex", "media").unwrap();
        let resources = cfg.proxy_resources.unwrap();
        let requests = resources.requests.unwrap();
        assert_eq!(requests["cpu"].0, "10m");
        assert_eq!(requests["memory"].0, "32Mi");
    }
}
