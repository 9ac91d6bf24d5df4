#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The oauth2-proxy injector: a mutating admission webhook that injects an
//! OAuth2 reverse-proxy sidecar into annotated pods and rewrites Service
//! routing to funnel traffic through it.

mod admission;
mod args;
mod server;

pub use self::{admission::WebhookService, args::Args};
