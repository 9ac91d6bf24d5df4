#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Typed re-exports of the Kubernetes API surface used by the injector.

pub use k8s_openapi::{
    api::core::v1::{
        Capabilities, ConfigMap, Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction,
        Pod, PodSpec, Probe, ResourceRequirements, SecretKeySelector, SecurityContext, Service,
        ServicePort, ServiceSpec, TCPSocketAction, Volume, VolumeMount,
    },
    apimachinery::pkg::util::intstr::IntOrString,
};
pub use kube::{
    api::{Api, ObjectMeta, Resource, ResourceExt},
    core::{admission, DynamicObject},
    Client, Config, Error,
};
