//! Machine watcher.
//!
//! Drives [`Reconciler`] from a `kube_runtime::Controller` over `Machine`
//! resources. Failed reconciles are requeued with a per-machine Fibonacci
//! backoff; the loop stops on SIGTERM or Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use crds::Machine;
use futures::StreamExt;
use kube::Api;
use kube_runtime::controller::{Action, Config as ControllerConfig};
use kube_runtime::{watcher, Controller};
use tracing::{debug, error, info, warn};

use crate::error::ControllerError;
use crate::reconciler::Reconciler;

/// Watches Machines and dispatches them to the reconciler.
pub struct Watcher {
    reconciler: Arc<Reconciler>,
    machine_api: Api<Machine>,
}

impl Watcher {
    pub fn new(reconciler: Arc<Reconciler>, machine_api: Api<Machine>) -> Self {
        Self {
            reconciler,
            machine_api,
        }
    }

    /// Runs until a shutdown signal is received
    pub async fn watch_machines(self) -> Result<(), ControllerError> {
        info!("Starting Machine watcher");

        // Machines of one cluster depend on each other (workers need a
        // master), so debounce bursts and keep concurrency low
        let controller_config = ControllerConfig::default()
            .debounce(Duration::from_secs(1))
            .concurrency(4);

        Controller::new(self.machine_api, watcher::Config::default())
            .with_config(controller_config)
            .shutdown_on_signal()
            .run(reconcile, error_policy, self.reconciler)
            .for_each(|res| async move {
                match res {
                    Ok((obj, _)) => debug!("Reconciled machine {:?}/{}", obj.namespace, obj.name),
                    Err(e) => warn!("Machine controller error: {}", e),
                }
            })
            .await;

        info!("Machine watcher stopped");
        Ok(())
    }
}

async fn reconcile(machine: Arc<Machine>, reconciler: Arc<Reconciler>) -> Result<Action, ControllerError> {
    reconciler.reconcile_machine(&machine).await
}

fn error_policy(machine: Arc<Machine>, error: &ControllerError, reconciler: Arc<Reconciler>) -> Action {
    let key = machine.key();
    let delay = reconciler.backoff_for(&key, error.is_transient());
    error!("Reconciliation of machine {} failed: {}, retrying in {}s", key, error, delay.as_secs());
    Action::requeue(delay)
}
