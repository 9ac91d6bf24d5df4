use crate::{admission::WebhookService, server};
use anyhow::{Context, Result};
use clap::Parser;
use oauth2_proxy_injector_config::ConfigMapLoader;
use oauth2_proxy_injector_k8s_api as k8s;
use oauth2_proxy_injector_mutation::PodMutator;
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tracing::{info, warn};

/// How long in-flight admissions may run after a shutdown signal.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[clap(
    name = "oauth2-proxy-injector",
    about = "A mutating admission webhook that injects oauth2-proxy sidecars"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "oauth2_proxy_injector=info,warn",
        env = "OAUTH2_PROXY_INJECTOR_LOG"
    )]
    log_level: String,

    /// HTTPS port to listen on.
    #[clap(long, default_value = "8443")]
    port: u16,

    /// Path to the TLS certificate.
    #[clap(long)]
    cert_file: PathBuf,

    /// Path to the TLS private key.
    #[clap(long)]
    key_file: PathBuf,

    /// Namespace for ConfigMaps, used when pods don't qualify one.
    #[clap(long, default_value = "")]
    config_namespace: String,

    /// Default configuration ConfigMap for pods that name none.
    #[clap(long)]
    default_config: Option<String>,

    /// Image for the iptables init container added by block-direct-access.
    #[clap(long, default_value = "alpine:3.20")]
    iptables_image: String,
}

// === impl Args ===

impl Args {
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_new(&self.log_level)
                    .context("invalid --log-level")?,
            )
            .init();

        let tls = server::load_tls(&self.cert_file, &self.key_file)?;

        let client = k8s::Client::try_default()
            .await
            .context("failed to create kubernetes client")?;

        let loader = Arc::new(ConfigMapLoader::new(
            client.clone(),
            self.config_namespace.clone(),
        ));
        let mutator = Arc::new(PodMutator::new(
            loader,
            self.default_config.clone(),
            self.config_namespace.clone(),
            self.iptables_image.clone(),
        ));
        let service = WebhookService::new(mutator, client);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let (signal, watch) = drain::channel();
        let srv = tokio::spawn(server::serve(addr, tls, service, watch));

        shutdown_signal().await;
        info!("shutting down");
        if tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, signal.drain())
            .await
            .is_err()
        {
            warn!("graceful shutdown timed out");
        }
        srv.abort();

        info!("server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for ctrl-c");
        info!("received SIGINT");
    }
}
