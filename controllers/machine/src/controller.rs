//! Main controller implementation.
//!
//! Builds the actuator from its Kubernetes-backed collaborators and runs the
//! Machine watcher in a background task.

use std::sync::Arc;

use crds::Machine;
use kube::{Api, Client};
use machine_actuator::{ActuatorParams, KubeEventRecorder, KubeObjectStore, KubeSecretStore, SshActuator};
use machine_setup::ConfigWatch;
use ssh_client::SshSessionConnector;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::ControllerConfig;
use crate::error::ControllerError;
use crate::reconciler::Reconciler;
use crate::watcher::Watcher;

/// Main controller for Machine lifecycle management.
pub struct Controller {
    machine_watcher: JoinHandle<Result<(), ControllerError>>,
}

impl Controller {
    /// Creates a new controller instance and starts watching.
    pub async fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        info!("Initializing Machine Controller");

        // Fail early when the catalog is missing rather than on the first machine
        let setup_configs = ConfigWatch::new(&config.machine_setup_config_path)?;
        info!("Reading machine setup catalog from {}", setup_configs.path().display());

        let kube_client = Client::try_default().await?;
        let store = Arc::new(KubeObjectStore::new(kube_client.clone()));

        let actuator = SshActuator::new(ActuatorParams {
            store: store.clone(),
            secrets: Arc::new(KubeSecretStore::new(kube_client.clone())),
            events: Arc::new(KubeEventRecorder::new(kube_client.clone())),
            ssh: Arc::new(SshSessionConnector::new(config.ssh_timeout)),
            setup_configs: Arc::new(setup_configs),
            options: config.actuator,
        });

        let reconciler = Arc::new(Reconciler::new(store, Arc::new(actuator), config.requeue_interval));

        let machine_api: Api<Machine> = match config.namespace.as_deref() {
            Some(ns) => Api::namespaced(kube_client, ns),
            None => Api::all(kube_client),
        };

        let watcher = Watcher::new(reconciler, machine_api);
        let machine_watcher = tokio::spawn(async move { watcher.watch_machines().await });

        Ok(Self { machine_watcher })
    }

    /// Runs the controller until shutdown.
    pub async fn run(self) -> Result<(), ControllerError> {
        info!("Machine Controller running");

        self.machine_watcher
            .await
            .map_err(|e| ControllerError::Watch(format!("Machine watcher panicked: {}", e)))?
    }
}
