#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Mutation planning: turns an admitted Pod or Service into an RFC 6902
//! patch that injects the oauth2-proxy sidecar and rewrites routing.

mod init_container;
mod knative;
mod patch;
mod pod;
mod service;
mod sidecar;


pub use self::{
    init_container::{build_init_container, INIT_CONTAINER_NAME},
    patch::{HandlerType, ParentHints, PatchBuilder, ProbeType},
    pod::PodMutator,
    service::mutate_service,
    sidecar::{build_sidecar, calculate_port_mapping, PortMapping},
};

use oauth2_proxy_injector_annotation as annotation;
use oauth2_proxy_injector_config as config;
use thiserror::Error;

/// Name of the injected sidecar container.
pub const SIDECAR_NAME: &str = "oauth2-proxy";

/// Port the sidecar listens on inside the pod's network namespace.
pub const PROXY_PORT: i32 = 4180;

/// Failures while planning a mutation. Any of these denies the admission.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Annotation(#[from] annotation::InvalidAnnotationValue),

    #[error(transparent)]
    Config(#[from] config::Error),

    #[error("no container port matches protected port {0:?}")]
    ProtectedPortNotFound(String),

    #[error("unexpected pod shape: {0}")]
    UnexpectedPodShape(&'static str),

    #[error("failed to encode patch value: {0}")]
    Json(#[from] serde_json::Error),
}
