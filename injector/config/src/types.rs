use crate::Error;
use oauth2_proxy_injector_annotation::UpstreamTlsMode;
use oauth2_proxy_injector_k8s_api as k8s;

/// Image used for the sidecar when the ConfigMap doesn't name one.
pub const DEFAULT_PROXY_IMAGE: &str = "quay.io/oauth2-proxy/oauth2-proxy:v7.14.2";

pub mod keys {
    //! Expected keys in an oauth2-proxy ConfigMap.

    // Provider settings.
    pub const PROVIDER: &str = "provider";
    pub const OIDC_ISSUER_URL: &str = "oidc-issuer-url";
    pub const OIDC_GROUPS_CLAIM: &str = "oidc-groups-claim";
    pub const SCOPE: &str = "scope";

    // Identity settings.
    pub const CLIENT_ID: &str = "client-id";
    pub const CLIENT_SECRET_REF: &str = "client-secret-ref";
    pub const PKCE_ENABLED: &str = "pkce-enabled";

    // Cookie settings.
    pub const COOKIE_SECRET_REF: &str = "cookie-secret-ref";
    pub const COOKIE_DOMAINS: &str = "cookie-domains";
    pub const COOKIE_SECURE: &str = "cookie-secure";
    pub const COOKIE_NAME: &str = "cookie-name";

    // Authorization settings.
    pub const EMAIL_DOMAINS: &str = "email-domains";
    pub const ALLOWED_GROUPS: &str = "allowed-groups";
    pub const WHITELIST_DOMAINS: &str = "whitelist-domains";

    // Routing settings.
    pub const REDIRECT_URL: &str = "redirect-url";
    pub const EXTRA_JWT_ISSUERS: &str = "extra-jwt-issuers";

    // Header settings.
    pub const PASS_ACCESS_TOKEN: &str = "pass-access-token";
    pub const SET_XAUTHREQUEST: &str = "set-xauthrequest";
    pub const PASS_AUTHORIZATION_HEADER: &str = "pass-authorization-header";

    // Behavior settings.
    pub const SKIP_PROVIDER_BUTTON: &str = "skip-provider-button";

    // Container settings. `extra-args` is newline-separated and deliberately
    // not overridable from annotations.
    pub const EXTRA_ARGS: &str = "extra-args";
    pub const PROXY_IMAGE: &str = "proxy-image";
    pub const PROXY_RESOURCES: &str = "proxy-resources";
}

/// A reference to a key in a Kubernetes Secret, written `name` or `name:key`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecretRef {
    pub name: String,
    pub key: String,
}

impl SecretRef {
    /// Parses a secret reference. An empty input yields `None`; an empty key
    /// after a colon is an error; a bare name takes `default_key`.
    pub fn parse(value: &str, default_key: &str) -> Result<Option<Self>, Error> {
        if value.is_empty() {
            return Ok(None);
        }

        match value.split_once(':') {
            None => Ok(Some(Self {
                name: value.to_string(),
                key: default_key.to_string(),
            })),
            Some((_, "")) => Err(Error::InvalidSecretRef {
                value: value.to_string(),
            }),
            Some((name, key)) => Ok(Some(Self {
                name: name.to_string(),
                key: key.to_string(),
            })),
        }
    }
}

/// The base oauth2-proxy settings loaded from a ConfigMap.
///
/// Most fields can be overridden per-pod through annotations; `extra_args`,
/// the image, and resources are ConfigMap-only.
#[derive(Clone, Debug, Default)]
pub struct ProxyConfig {
    /// The ConfigMap this was loaded from, kept for log context.
    pub name: String,
    pub namespace: String,

    pub provider: String,
    pub oidc_issuer_url: String,
    pub oidc_groups_claim: String,
    pub scope: String,

    pub client_id: String,
    pub client_secret_ref: Option<SecretRef>,
    pub pkce_enabled: bool,

    pub cookie_secret_ref: Option<SecretRef>,
    pub cookie_domains: Vec<String>,
    pub cookie_secure: bool,
    pub cookie_name: String,

    pub email_domains: Vec<String>,
    pub allowed_groups: Vec<String>,
    pub whitelist_domains: Vec<String>,

    pub redirect_url: String,
    pub extra_jwt_issuers: Vec<String>,

    pub pass_access_token: bool,
    pub set_xauthrequest: bool,
    pub pass_authorization_header: bool,
    pub skip_provider_button: bool,

    pub extra_args: Vec<String>,
    pub proxy_image: String,
    pub proxy_resources: Option<k8s::ResourceRequirements>,
}

impl ProxyConfig {
    /// An empty base config with compiled-in defaults, used for
    /// annotation-only deployments that name no ConfigMap.
    pub fn empty() -> Self {
        Self {
            proxy_image: DEFAULT_PROXY_IMAGE.to_string(),
            cookie_secure: true,
            ..Self::default()
        }
    }
}

/// The merged, validated configuration handed to the sidecar builders.
#[derive(Clone, Debug, Default)]
pub struct EffectiveConfig {
    pub config_map_name: String,
    pub config_map_namespace: String,

    // Provider settings.
    pub provider: String,
    pub oidc_issuer_url: String,
    pub oidc_groups_claim: String,
    pub scope: String,

    // Identity settings.
    pub client_id: String,
    pub client_secret_ref: Option<SecretRef>,
    pub pkce_enabled: bool,

    // Cookie settings.
    pub cookie_secret_ref: Option<SecretRef>,
    pub cookie_domains: Vec<String>,
    pub cookie_secure: bool,
    pub cookie_name: String,

    // Authorization settings.
    pub email_domains: Vec<String>,
    pub allowed_groups: Vec<String>,
    pub whitelist_domains: Vec<String>,

    // Routing settings.
    pub redirect_url: String,
    pub extra_jwt_issuers: Vec<String>,

    // Header settings.
    pub pass_access_token: bool,
    pub set_xauthrequest: bool,
    pub pass_authorization_header: bool,

    // Behavior settings.
    pub skip_provider_button: bool,

    // Annotation-only settings.
    pub block_direct_access: bool,
    pub protected_port: String,
    pub ignore_paths: Vec<String>,
    pub api_paths: Vec<String>,
    pub skip_jwt_bearer_tokens: bool,
    pub upstream_tls: UpstreamTlsMode,
    pub ping_path: String,
    pub ready_path: String,

    /// Replaces the auto-calculated upstream when non-empty.
    pub upstream: String,

    // Container settings.
    pub extra_args: Vec<String>,
    pub proxy_image: String,
    pub proxy_resources: Option<k8s::ResourceRequirements>,
}

impl std::fmt::Display for EffectiveConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "EffectiveConfig{{configmap={}/{}, provider={}",
            self.config_map_name, self.config_map_namespace, self.provider
        )?;
        if !self.oidc_issuer_url.is_empty() {
            write!(f, ", oidc-issuer-url={}", self.oidc_issuer_url)?;
        }
        write!(f, ", client-id={}", self.client_id)?;
        if let Some(r) = &self.client_secret_ref {
            write!(f, ", client-secret-ref={}:{}", r.name, r.key)?;
        }
        if let Some(r) = &self.cookie_secret_ref {
            write!(f, ", cookie-secret-ref={}:{}", r.name, r.key)?;
        }
        write!(f, ", protected-port={}", self.protected_port)?;
        if !self.upstream.is_empty() {
            write!(f, ", upstream={}", self.upstream)?;
        }
        write!(f, ", allowed-groups=[{}]", self.allowed_groups.join(","))?;
        write!(f, ", email-domains=[{}]", self.email_domains.join(","))?;
        if !self.redirect_url.is_empty() {
            write!(f, ", redirect-url={}", self.redirect_url)?;
        }
        write!(f, "}}")
    }
}
