//! Machine Controller
//!
//! Watches Cluster API `Machine` resources and drives the SSH actuator:
//! machines being deleted are torn down, existing machines are updated to
//! their goal versions, everything else is created.
//!
//! The actuator is constructed here explicitly from its collaborators; the
//! controller never looks it up in a registry.

mod backoff;
mod config;
mod controller;
mod error;
mod reconciler;
mod watcher;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use controller::Controller;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // kube's rustls-tls feature leaves the crypto provider choice to the binary
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        info!("rustls crypto provider already installed");
    }

    info!("Starting Machine Controller");

    let config = ControllerConfig::from_env()?;
    info!("Configuration:");
    info!("  Setup catalog: {}", config.machine_setup_config_path);
    info!("  Namespace: {}", config.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  SSH timeout: {}s", config.ssh_timeout.as_secs());
    info!("  Update strategy: {:?}", config.actuator.update_strategy);
    info!("  Script delivery: {:?}", config.actuator.script_delivery);
    info!("  Requeue interval: {}s", config.requeue_interval.as_secs());

    let controller = Controller::new(config).await?;
    controller.run().await?;

    info!("Machine Controller stopped");
    Ok(())
}
