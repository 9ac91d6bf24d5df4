#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Base proxy configuration: ConfigMap loading and per-pod override merging.

mod loader;
mod merge;
mod types;

pub use self::{
    loader::{parse_config_map, ConfigLoader, ConfigMapLoader},
    merge::merge,
    types::{keys, EffectiveConfig, ProxyConfig, SecretRef, DEFAULT_PROXY_IMAGE},
};

use oauth2_proxy_injector_k8s_api as k8s;
use thiserror::Error;

/// Failures loading, merging, or validating proxy configuration.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to load configmap {namespace}/{name}: {source}")]
    DocumentMissing {
        namespace: String,
        name: String,
        #[source]
        source: k8s::Error,
    },

    #[error("configmap {name}: missing required key {key:?}")]
    FieldMissing { name: String, key: &'static str },

    #[error("configmap {name}: invalid value for key {key:?}: {reason}")]
    InvalidField {
        name: String,
        key: &'static str,
        reason: String,
    },

    #[error("secret reference {value:?} must be 'name' or 'name:key'")]
    InvalidSecretRef { value: String },

    #[error("missing required annotation: {0}")]
    MissingRequiredAnnotation(&'static str),

    #[error("invalid effective config: {0}")]
    InvalidEffectiveConfig(String),
}
