#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Pod annotation parsing for oauth2-proxy sidecar injection.
//!
//! All annotations live under the `spacemule.net/oauth2-proxy.` prefix. The
//! parser lifts the flat annotation map into a typed [`PodConfig`]. Override
//! fields are tri-state: absence means "use the base config", presence (even
//! with an empty value, for list fields) means "override".

use std::collections::BTreeMap;
use thiserror::Error;

pub mod keys {
    //! Recognized annotation keys.
    //!
    //! `INJECTED` is written by the webhook after mutation and must not be set
    //! manually.

    pub const PREFIX: &str = "spacemule.net/oauth2-proxy.";

    // Core.
    pub const ENABLED: &str = "spacemule.net/oauth2-proxy.enabled";
    pub const CONFIG: &str = "spacemule.net/oauth2-proxy.config";
    pub const INJECTED: &str = "spacemule.net/oauth2-proxy.injected";
    pub const BLOCK_DIRECT_ACCESS: &str = "spacemule.net/oauth2-proxy.block-direct-access";

    // Port/routing (annotation-only).
    pub const PROTECTED_PORT: &str = "spacemule.net/oauth2-proxy.protected-port";
    pub const UPSTREAM: &str = "spacemule.net/oauth2-proxy.upstream";
    pub const UPSTREAM_TLS: &str = "spacemule.net/oauth2-proxy.upstream-tls";
    pub const IGNORE_PATHS: &str = "spacemule.net/oauth2-proxy.ignore-paths";
    pub const API_PATHS: &str = "spacemule.net/oauth2-proxy.api-paths";
    pub const SKIP_JWT_BEARER_TOKENS: &str = "spacemule.net/oauth2-proxy.skip-jwt-bearer-tokens";
    pub const PING_PATH: &str = "spacemule.net/oauth2-proxy.ping-path";
    pub const READY_PATH: &str = "spacemule.net/oauth2-proxy.ready-path";

    // Identity overrides.
    pub const CLIENT_ID: &str = "spacemule.net/oauth2-proxy.client-id";
    pub const CLIENT_SECRET_REF: &str = "spacemule.net/oauth2-proxy.client-secret-ref";
    pub const COOKIE_SECRET_REF: &str = "spacemule.net/oauth2-proxy.cookie-secret-ref";
    pub const SCOPE: &str = "spacemule.net/oauth2-proxy.scope";
    pub const PKCE_ENABLED: &str = "spacemule.net/oauth2-proxy.pkce-enabled";

    // Authorization overrides.
    pub const EMAIL_DOMAINS: &str = "spacemule.net/oauth2-proxy.email-domains";
    pub const ALLOWED_GROUPS: &str = "spacemule.net/oauth2-proxy.allowed-groups";
    pub const WHITELIST_DOMAINS: &str = "spacemule.net/oauth2-proxy.whitelist-domains";
    pub const COOKIE_NAME: &str = "spacemule.net/oauth2-proxy.cookie-name";
    pub const COOKIE_DOMAINS: &str = "spacemule.net/oauth2-proxy.cookie-domains";
    pub const COOKIE_SECURE: &str = "spacemule.net/oauth2-proxy.cookie-secure";

    // Routing overrides.
    pub const REDIRECT_URL: &str = "spacemule.net/oauth2-proxy.redirect-url";
    pub const EXTRA_JWT_ISSUERS: &str = "spacemule.net/oauth2-proxy.extra-jwt-issuers";

    // Header overrides.
    pub const PASS_ACCESS_TOKEN: &str = "spacemule.net/oauth2-proxy.pass-access-token";
    pub const SET_XAUTHREQUEST: &str = "spacemule.net/oauth2-proxy.set-xauthrequest";
    pub const PASS_AUTHORIZATION_HEADER: &str =
        "spacemule.net/oauth2-proxy.pass-authorization-header";

    // Behavior overrides.
    pub const SKIP_PROVIDER_BUTTON: &str = "spacemule.net/oauth2-proxy.skip-provider-button";

    // Provider overrides.
    pub const PROVIDER: &str = "spacemule.net/oauth2-proxy.provider";
    pub const OIDC_ISSUER_URL: &str = "spacemule.net/oauth2-proxy.oidc-issuer-url";
    pub const OIDC_GROUPS_CLAIM: &str = "spacemule.net/oauth2-proxy.oidc-groups-claim";

    // Container overrides.
    pub const PROXY_IMAGE: &str = "spacemule.net/oauth2-proxy.proxy-image";
}

/// TLS mode for connections from the sidecar to the upstream container.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UpstreamTlsMode {
    /// Plain HTTP to the upstream.
    #[default]
    Http,
    /// HTTPS with certificate verification.
    Https,
    /// HTTPS without certificate verification, for upstreams that terminate
    /// TLS with self-signed certificates.
    HttpsInsecure,
}

impl UpstreamTlsMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::HttpsInsecure => "https-insecure",
        }
    }
}

impl std::str::FromStr for UpstreamTlsMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "https-insecure" => Ok(Self::HttpsInsecure),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for UpstreamTlsMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recognized annotation carried an unparseable value.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid value {value:?} for annotation {key}: {reason}")]
pub struct InvalidAnnotationValue {
    pub key: String,
    pub value: String,
    pub reason: String,
}

impl InvalidAnnotationValue {
    pub fn new(key: &str, value: &str, reason: impl ToString) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Typed configuration parsed from a pod's annotations.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodConfig {
    /// Whether oauth2-proxy injection is enabled for this pod.
    pub enabled: bool,

    /// Optional ConfigMap name overriding the webhook's default.
    pub config_map_name: Option<String>,

    /// Whether to add an iptables init container that blocks direct access to
    /// the protected port.
    pub block_direct_access: bool,

    /// The container port to protect, by name or number, verbatim.
    pub protected_port: String,

    /// Paths that bypass authentication entirely.
    pub ignore_paths: Vec<String>,

    /// Paths that skip the login flow and require a JWT instead.
    pub api_paths: Vec<String>,

    /// Skip login for requests carrying a valid bearer token.
    pub skip_jwt_bearer_tokens: bool,

    /// TLS mode for the upstream connection.
    pub upstream_tls: UpstreamTlsMode,

    /// Path of oauth2-proxy's ping endpoint (empty means the proxy default).
    pub ping_path: String,

    /// Path of oauth2-proxy's ready endpoint (empty means the proxy default).
    pub ready_path: String,

    /// Per-pod overrides of base ConfigMap values.
    pub overrides: Overrides,
}

/// Per-pod overrides of the base configuration.
///
/// `None` means "use the base value". For list fields, `Some(vec![])` is a
/// meaningful override to the empty list.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Overrides {
    pub client_id: Option<String>,
    pub client_secret_ref: Option<String>,
    pub cookie_secret_ref: Option<String>,
    pub scope: Option<String>,
    pub pkce_enabled: Option<bool>,

    pub email_domains: Option<Vec<String>>,
    pub allowed_groups: Option<Vec<String>>,
    pub whitelist_domains: Option<Vec<String>>,
    pub cookie_name: Option<String>,
    pub cookie_domains: Option<Vec<String>>,

    pub redirect_url: Option<String>,
    pub extra_jwt_issuers: Option<Vec<String>>,

    pub pass_access_token: Option<bool>,
    pub set_xauthrequest: Option<bool>,
    pub pass_authorization_header: Option<bool>,
    pub skip_provider_button: Option<bool>,

    pub provider: Option<String>,
    pub oidc_issuer_url: Option<String>,
    pub oidc_groups_claim: Option<String>,

    pub cookie_secure: Option<bool>,
    pub proxy_image: Option<String>,

    /// Replaces the auto-calculated `http(s)://127.0.0.1:<port>` upstream.
    pub upstream: Option<String>,
}

/// Parses oauth2-proxy configuration from a pod's annotation map.
///
/// If the `enabled` annotation is not the literal `"true"`, a disabled config
/// is returned and no other annotation is consulted. Unrecognized keys under
/// the prefix are ignored for forward compatibility. Required-field checks are
/// deferred to the merge step.
pub fn parse(annotations: &BTreeMap<String, String>) -> Result<PodConfig, InvalidAnnotationValue> {
    if annotations.get(keys::ENABLED).map(String::as_str) != Some("true") {
        return Ok(PodConfig::default());
    }

    let mut cfg = PodConfig {
        enabled: true,
        ..PodConfig::default()
    };

    if let Some(v) = annotations.get(keys::CONFIG) {
        cfg.config_map_name = Some(v.trim().to_string());
    }

    if let Some(v) = annotations.get(keys::BLOCK_DIRECT_ACCESS) {
        cfg.block_direct_access = parse_bool(keys::BLOCK_DIRECT_ACCESS, v)?;
    }

    if let Some(v) = annotations.get(keys::PROTECTED_PORT) {
        cfg.protected_port = v.trim().to_string();
    }

    if let Some(v) = annotations.get(keys::IGNORE_PATHS) {
        cfg.ignore_paths = split_list(v);
    }

    if let Some(v) = annotations.get(keys::API_PATHS) {
        cfg.api_paths = split_list(v);
    }

    if let Some(v) = annotations.get(keys::SKIP_JWT_BEARER_TOKENS) {
        cfg.skip_jwt_bearer_tokens = parse_bool(keys::SKIP_JWT_BEARER_TOKENS, v)?;
    }

    if let Some(v) = annotations.get(keys::UPSTREAM_TLS) {
        cfg.upstream_tls = v.trim().parse().map_err(|()| {
            InvalidAnnotationValue::new(
                keys::UPSTREAM_TLS,
                v,
                "must be 'http', 'https', or 'https-insecure'",
            )
        })?;
    }

    if let Some(v) = annotations.get(keys::PING_PATH) {
        cfg.ping_path = v.trim().to_string();
    }

    if let Some(v) = annotations.get(keys::READY_PATH) {
        cfg.ready_path = v.trim().to_string();
    }

    let o = &mut cfg.overrides;

    o.client_id = trimmed(annotations, keys::CLIENT_ID);
    o.client_secret_ref = trimmed(annotations, keys::CLIENT_SECRET_REF);
    o.cookie_secret_ref = trimmed(annotations, keys::COOKIE_SECRET_REF);
    o.scope = trimmed(annotations, keys::SCOPE);
    o.pkce_enabled = parse_bool_override(annotations, keys::PKCE_ENABLED)?;

    o.email_domains = annotations.get(keys::EMAIL_DOMAINS).map(|v| split_list(v));
    o.allowed_groups = annotations
        .get(keys::ALLOWED_GROUPS)
        .map(|v| split_list(v));
    o.whitelist_domains = annotations
        .get(keys::WHITELIST_DOMAINS)
        .map(|v| split_list(v));
    o.cookie_name = trimmed(annotations, keys::COOKIE_NAME);
    o.cookie_domains = annotations
        .get(keys::COOKIE_DOMAINS)
        .map(|v| split_list(v));

    o.redirect_url = trimmed(annotations, keys::REDIRECT_URL);
    o.extra_jwt_issuers = annotations
        .get(keys::EXTRA_JWT_ISSUERS)
        .map(|v| split_list(v));

    o.pass_access_token = parse_bool_override(annotations, keys::PASS_ACCESS_TOKEN)?;
    o.set_xauthrequest = parse_bool_override(annotations, keys::SET_XAUTHREQUEST)?;
    o.pass_authorization_header =
        parse_bool_override(annotations, keys::PASS_AUTHORIZATION_HEADER)?;
    o.skip_provider_button = parse_bool_override(annotations, keys::SKIP_PROVIDER_BUTTON)?;

    o.provider = trimmed(annotations, keys::PROVIDER);
    o.oidc_issuer_url = trimmed(annotations, keys::OIDC_ISSUER_URL);
    o.oidc_groups_claim = trimmed(annotations, keys::OIDC_GROUPS_CLAIM);

    o.cookie_secure = parse_bool_override(annotations, keys::COOKIE_SECURE)?;
    o.proxy_image = trimmed(annotations, keys::PROXY_IMAGE);
    o.upstream = trimmed(annotations, keys::UPSTREAM);

    Ok(cfg)
}

/// Returns true if the protected port is specified by name (e.g. `"http"`)
/// rather than by number (e.g. `"8080"`).
///
/// The distinction drives the mutation mode: a named port is taken over by the
/// sidecar (the app's port entry is removed and probes are rewritten), while a
/// numbered port leaves the pod's ports alone and relies on Service rewriting.
pub fn is_named_port(protected_port: &str) -> bool {
    protected_port.chars().any(|c| !c.is_ascii_digit())
}

fn trimmed(annotations: &BTreeMap<String, String>, key: &str) -> Option<String> {
    annotations.get(key).map(|v| v.trim().to_string())
}

fn parse_bool(key: &str, value: &str) -> Result<bool, InvalidAnnotationValue> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(InvalidAnnotationValue::new(
            key,
            value,
            "must be 'true', 'false', '1', or '0'",
        )),
    }
}

/// Parses an override boolean: absent or empty means unset.
fn parse_bool_override(
    annotations: &BTreeMap<String, String>,
    key: &str,
) -> Result<Option<bool>, InvalidAnnotationValue> {
    match annotations.get(key) {
        None => Ok(None),
        Some(v) if v.trim().is_empty() => Ok(None),
        Some(v) => parse_bool(key, v).map(Some),
    }
}

/// Splits a comma-separated list, trimming entries and dropping empties.
fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    fn anns(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn disabled_without_enabled_annotation() {
        let cfg = parse(&BTreeMap::new()).unwrap();
        assert!(!cfg.enabled);
        assert_eq!(cfg, PodConfig::default());
    }

    #[test]
    fn disabled_unless_literally_true() {
        for v in ["false", "True", "TRUE", "1", "yes", ""] {
            let cfg = parse(&anns(&[(keys::ENABLED, v)])).unwrap();
            assert!(!cfg.enabled, "enabled={v:?} must not enable injection");
        }
    }

    #[test]
    fn disabled_ignores_other_annotations() {
        // An invalid boolean elsewhere must not fail parsing when disabled.
        let cfg = parse(&anns(&[
            (keys::ENABLED, "false"),
            (keys::PKCE_ENABLED, "bogus"),
        ]))
        .unwrap();
        assert!(!cfg.enabled);
    }

    #[test]
    fn core_annotations() {
        let cfg = parse(&anns(&[
            (keys::ENABLED, "true"),
            (keys::CONFIG, "plex"),
            (keys::BLOCK_DIRECT_ACCESS, "true"),
            (keys::PROTECTED_PORT, " http "),
        ]))
        .unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.config_map_name.as_deref(), Some("plex"));
        assert!(cfg.block_direct_access);
        assert_eq!(cfg.protected_port, "http");
    }

    #[test]
    fn boolean_forms() {
        for (v, expected) in [("true", true), ("1", true), ("FALSE", false), ("0", false)] {
            let cfg = parse(&anns(&[
                (keys::ENABLED, "true"),
                (keys::SKIP_JWT_BEARER_TOKENS, v),
            ]))
            .unwrap();
            assert_eq!(cfg.skip_jwt_bearer_tokens, expected, "value {v:?}");
        }

        let err = parse(&anns(&[
            (keys::ENABLED, "true"),
            (keys::SKIP_JWT_BEARER_TOKENS, "yes"),
        ]))
        .unwrap_err();
        assert_eq!(err.key, keys::SKIP_JWT_BEARER_TOKENS);
    }

    #[test]
    fn override_bool_distinguishes_unset_from_false() {
        let unset = parse(&anns(&[(keys::ENABLED, "true")])).unwrap();
        assert_eq!(unset.overrides.cookie_secure, None);

        let explicit = parse(&anns(&[(keys::ENABLED, "true"), (keys::COOKIE_SECURE, "false")]))
            .unwrap();
        assert_eq!(explicit.overrides.cookie_secure, Some(false));

        // Present-but-empty boolean overrides stay unset.
        let empty = parse(&anns(&[(keys::ENABLED, "true"), (keys::COOKIE_SECURE, "")])).unwrap();
        assert_eq!(empty.overrides.cookie_secure, None);
    }

    #[test]
    fn upstream_tls_modes() {
        for (v, mode) in [
            ("http", UpstreamTlsMode::Http),
            ("https", UpstreamTlsMode::Https),
            ("https-insecure", UpstreamTlsMode::HttpsInsecure),
        ] {
            let cfg =
                parse(&anns(&[(keys::ENABLED, "true"), (keys::UPSTREAM_TLS, v)])).unwrap();
            assert_eq!(cfg.upstream_tls, mode);
        }

        let err = parse(&anns(&[(keys::ENABLED, "true"), (keys::UPSTREAM_TLS, "tls")]))
            .unwrap_err();
        assert_eq!(err.key, keys::UPSTREAM_TLS);
    }

    #[test]
    fn list_annotations_split_and_trim() {
        let cfg = parse(&anns(&[
            (keys::ENABLED, "true"),
            (keys::IGNORE_PATHS, "/metrics, /healthz ,,/swagger"),
        ]))
        .unwrap();
        assert_eq!(cfg.ignore_paths, vec!["/metrics", "/healthz", "/swagger"]);
    }

    #[test]
    fn empty_list_override_is_set_to_empty() {
        let cfg = parse(&anns(&[(keys::ENABLED, "true"), (keys::EMAIL_DOMAINS, "")])).unwrap();
        assert_eq!(cfg.overrides.email_domains, Some(vec![]));

        let unset = parse(&anns(&[(keys::ENABLED, "true")])).unwrap();
        assert_eq!(unset.overrides.email_domains, None);
    }

    #[test]
    fn scalar_overrides_trimmed() {
        let cfg = parse(&anns(&[
            (keys::ENABLED, "true"),
            (keys::CLIENT_ID, " my-client "),
            (keys::UPSTREAM, "http://other:9000"),
            (keys::PROXY_IMAGE, "quay.io/oauth2-proxy/oauth2-proxy:v7.6.0"),
        ]))
        .unwrap();
        assert_eq!(cfg.overrides.client_id.as_deref(), Some("my-client"));
        assert_eq!(cfg.overrides.upstream.as_deref(), Some("http://other:9000"));
        assert_eq!(
            cfg.overrides.proxy_image.as_deref(),
            Some("quay.io/oauth2-proxy/oauth2-proxy:v7.6.0")
        );
    }

    #[test]
    fn unrecognized_prefixed_keys_are_ignored() {
        let cfg = parse(&btreemap! {
            keys::ENABLED.to_string() => "true".to_string(),
            format!("{}future-knob", keys::PREFIX) => "whatever".to_string(),
        })
        .unwrap();
        assert!(cfg.enabled);
    }

    #[test]
    fn named_port_detection() {
        assert!(is_named_port("http"));
        assert!(is_named_port("8080a"));
        assert!(is_named_port("-1"));
        assert!(!is_named_port("8080"));
        assert!(!is_named_port(""));
    }
}
