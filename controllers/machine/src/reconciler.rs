//! Reconciliation logic for Machine resources.
//!
//! A machine with a deletion timestamp is torn down and released by removing
//! the finalizer. Any other machine first gets the finalizer, then is
//! updated when the actuator reports it as existing and created otherwise.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crds::Machine;
use kube_runtime::controller::Action;
use machine_actuator::{MachineActuator, NodeState, ObjectStore, StoreError};
use tracing::{debug, info, warn};

use crate::backoff::FibonacciBackoff;
use crate::error::ControllerError;

/// Finalizer keeping a Machine around until its host has been torn down
pub const MACHINE_FINALIZER: &str = "machine.cluster.k8s.io";

const TRANSIENT_BACKOFF_SECONDS: u64 = 10;
const PERMANENT_BACKOFF_SECONDS: u64 = 60;
const MAX_BACKOFF_SECONDS: u64 = 600;

/// Dispatches Machine events to the actuator.
pub struct Reconciler {
    store: Arc<dyn ObjectStore>,
    actuator: Arc<dyn MachineActuator>,
    requeue_interval: Duration,
    /// Backoff per machine (namespace/name), dropped on success
    backoff_states: Mutex<HashMap<String, FibonacciBackoff>>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ObjectStore>, actuator: Arc<dyn MachineActuator>, requeue_interval: Duration) -> Self {
        Self {
            store,
            actuator,
            requeue_interval,
            backoff_states: Mutex::new(HashMap::new()),
        }
    }

    pub async fn reconcile_machine(&self, machine: &Machine) -> Result<Action, ControllerError> {
        let key = machine.key();

        if machine.metadata.deletion_timestamp.is_some() {
            if !has_finalizer(machine) {
                debug!("Machine {} is being deleted and already released", key);
                return Ok(Action::await_change());
            }

            info!("Reconciling deletion of machine {}", key);
            match self.store.cluster_for_machine(machine).await {
                Ok(cluster) => self.actuator.delete(&cluster, machine).await?,
                Err(e @ (StoreError::NotFound { .. } | StoreError::ClusterUnresolved { .. })) => {
                    release_orphan(machine, e)?;
                }
                Err(e) => return Err(e.into()),
            }
            self.remove_finalizer(machine).await?;
            self.reset_backoff(&key);
            info!("Released machine {}", key);
            return Ok(Action::await_change());
        }

        debug!("Reconciling machine {}", key);
        let cluster = self.store.cluster_for_machine(machine).await?;
        if !has_finalizer(machine) {
            self.add_finalizer(machine).await?;
        }

        if self.actuator.exists(&cluster, machine).await? {
            self.actuator.update(&cluster, machine).await?;
        } else {
            self.actuator.create(&cluster, machine).await?;
        }

        self.reset_backoff(&key);
        Ok(Action::requeue(self.requeue_interval))
    }

    async fn add_finalizer(&self, machine: &Machine) -> Result<(), ControllerError> {
        let mut finalizers = machine.metadata.finalizers.clone().unwrap_or_default();
        finalizers.push(MACHINE_FINALIZER.to_string());
        self.store.set_machine_finalizers(machine, finalizers).await?;
        debug!("Added finalizer to machine {}", machine.key());
        Ok(())
    }

    /// The actuator may have written to the machine since it was watched,
    /// so the finalizer list is taken from the current record.
    async fn remove_finalizer(&self, machine: &Machine) -> Result<(), ControllerError> {
        let Some(current) = self
            .store
            .get_machine(machine.namespace_or_default(), machine.name())
            .await?
        else {
            debug!("Machine {} is already gone", machine.key());
            return Ok(());
        };

        let finalizers = current
            .metadata
            .finalizers
            .iter()
            .flatten()
            .filter(|f| f.as_str() != MACHINE_FINALIZER)
            .cloned()
            .collect();
        self.store.set_machine_finalizers(&current, finalizers).await?;
        Ok(())
    }

    /// Next retry delay for a failing machine
    ///
    /// Transient failures (unreachable host, no master yet) start at 10s,
    /// everything else at 60s. Both grow along the Fibonacci sequence up to
    /// ten minutes.
    pub fn backoff_for(&self, key: &str, transient: bool) -> Duration {
        match self.backoff_states.lock() {
            Ok(mut states) => states
                .entry(key.to_string())
                .or_insert_with(|| {
                    let min = if transient {
                        TRANSIENT_BACKOFF_SECONDS
                    } else {
                        PERMANENT_BACKOFF_SECONDS
                    };
                    FibonacciBackoff::new(min, MAX_BACKOFF_SECONDS)
                })
                .next_backoff(),
            Err(e) => {
                warn!("Failed to lock backoff_states: {}, using default backoff", e);
                Duration::from_secs(PERMANENT_BACKOFF_SECONDS)
            }
        }
    }

    fn reset_backoff(&self, key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            states.remove(key);
        }
    }
}

/// A machine whose cluster is gone can only be released when no host was
/// ever provisioned for it; otherwise the shutdown script has no cluster
/// to render against.
fn release_orphan(machine: &Machine, cause: StoreError) -> Result<(), ControllerError> {
    let state = NodeState::of(Some(machine));
    if state.is_provisioned() {
        return Err(ControllerError::OrphanedMachine {
            machine: machine.key(),
            source: cause,
        });
    }
    if state.is_corrupt() {
        warn!("Machine {} has an unreadable instance status, releasing without shutdown", machine.key());
    }
    info!("Cluster of machine {} is gone ({}), nothing to tear down", machine.key(), cause);
    Ok(())
}

fn has_finalizer(machine: &Machine) -> bool {
    machine
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|name| name == MACHINE_FINALIZER))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{Cluster, MachineRole};
    use machine_actuator::test_utils::*;
    use machine_actuator::{ActuatorError, INSTANCE_STATUS_ANNOTATION};

    /// Actuator recording which operations were dispatched
    #[derive(Default)]
    struct RecordingActuator {
        exists: bool,
        fail_with_validation: bool,
        calls: Mutex<Vec<String>>,
    }

    impl RecordingActuator {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, op: &str, machine: &Machine) -> Result<(), ActuatorError> {
            self.calls.lock().unwrap().push(format!("{op} {}", machine.name()));
            if self.fail_with_validation {
                return Err(ActuatorError::Validation("spec.versions.kubelet is required".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl MachineActuator for RecordingActuator {
        async fn create(&self, _cluster: &Cluster, machine: &Machine) -> Result<(), ActuatorError> {
            self.record("create", machine)
        }

        async fn delete(&self, _cluster: &Cluster, machine: &Machine) -> Result<(), ActuatorError> {
            self.record("delete", machine)
        }

        async fn update(&self, _cluster: &Cluster, goal: &Machine) -> Result<(), ActuatorError> {
            self.record("update", goal)
        }

        async fn exists(&self, _cluster: &Cluster, _machine: &Machine) -> Result<bool, ActuatorError> {
            Ok(self.exists)
        }
    }

    fn setup(actuator: RecordingActuator) -> (Reconciler, MemoryObjectStore, Arc<RecordingActuator>) {
        let store = MemoryObjectStore::new();
        store.add_cluster(test_cluster(NAMESPACE, CLUSTER, vec![endpoint(MASTER_HOST)]));
        let actuator = Arc::new(actuator);
        let reconciler = Reconciler::new(Arc::new(store.clone()), actuator.clone(), Duration::from_secs(600));
        (reconciler, store, actuator)
    }

    fn worker() -> Machine {
        test_machine("worker-0", MachineRole::Node, WORKER_HOST, versions("1.10.6", ""))
    }

    fn deleting(mut machine: Machine) -> Machine {
        machine.metadata.deletion_timestamp = Some(serde_json::from_value(serde_json::json!("2024-05-01T10:00:00Z")).unwrap());
        machine
    }

    fn finalizers(store: &MemoryObjectStore) -> Vec<String> {
        store
            .machine(NAMESPACE, "worker-0")
            .and_then(|m| m.metadata.finalizers)
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_new_machine_gets_finalizer_and_is_created() {
        let (reconciler, store, actuator) = setup(RecordingActuator::default());
        let machine = store.add_machine(worker());

        let action = reconciler.reconcile_machine(&machine).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(600)));
        assert_eq!(actuator.calls(), vec!["create worker-0"]);
        assert_eq!(finalizers(&store), vec![MACHINE_FINALIZER]);
    }

    #[tokio::test]
    async fn test_existing_machine_is_updated() {
        let (reconciler, store, actuator) = setup(RecordingActuator {
            exists: true,
            ..Default::default()
        });
        let mut machine = worker();
        machine.metadata.finalizers = Some(vec![MACHINE_FINALIZER.to_string()]);
        let machine = store.add_machine(machine);

        reconciler.reconcile_machine(&machine).await.unwrap();

        assert_eq!(actuator.calls(), vec!["update worker-0"]);
    }

    #[tokio::test]
    async fn test_deleted_machine_is_torn_down_then_released() {
        let (reconciler, store, actuator) = setup(RecordingActuator {
            exists: true,
            ..Default::default()
        });
        let mut machine = worker();
        machine.metadata.finalizers = Some(vec!["other.io/keep".to_string(), MACHINE_FINALIZER.to_string()]);
        let machine = store.add_machine(deleting(machine));

        let action = reconciler.reconcile_machine(&machine).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(actuator.calls(), vec!["delete worker-0"]);
        assert_eq!(finalizers(&store), vec!["other.io/keep"]);
    }

    #[tokio::test]
    async fn test_released_machine_is_left_alone() {
        let (reconciler, store, actuator) = setup(RecordingActuator::default());
        let machine = store.add_machine(deleting(worker()));

        reconciler.reconcile_machine(&machine).await.unwrap();
        assert!(actuator.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_delete_keeps_finalizer() {
        let (reconciler, store, _actuator) = setup(RecordingActuator {
            fail_with_validation: true,
            ..Default::default()
        });
        let mut machine = worker();
        machine.metadata.finalizers = Some(vec![MACHINE_FINALIZER.to_string()]);
        let machine = store.add_machine(deleting(machine));

        let err = reconciler.reconcile_machine(&machine).await.unwrap_err();

        assert!(matches!(err, ControllerError::Actuator(ActuatorError::Validation(_))));
        assert_eq!(finalizers(&store), vec![MACHINE_FINALIZER]);
    }

    #[tokio::test]
    async fn test_provisioned_machine_is_shut_down_and_released_in_one_pass() {
        let Harness { actuator, store, ssh, .. } = Harness::new();
        store.add_cluster(test_cluster(NAMESPACE, CLUSTER, vec![endpoint(MASTER_HOST)]));
        let mut machine = provisioned(test_machine(
            "master-0",
            MachineRole::Master,
            MASTER_HOST,
            versions("1.10.6", "1.10.6"),
        ));
        machine.metadata.finalizers = Some(vec![MACHINE_FINALIZER.to_string()]);
        let machine = store.add_machine(deleting(machine));
        let reconciler = Reconciler::new(Arc::new(store.clone()), Arc::new(actuator), Duration::from_secs(600));

        let action = reconciler.reconcile_machine(&machine).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(ssh.calls_to(MASTER_HOST).len(), 1);
        let stored = store.machine(NAMESPACE, "master-0").unwrap();
        assert!(stored.annotation(INSTANCE_STATUS_ANNOTATION).is_none());
        assert_eq!(stored.metadata.finalizers, Some(vec![]));
    }

    fn without_cluster() -> (Reconciler, MemoryObjectStore, Arc<RecordingActuator>) {
        let store = MemoryObjectStore::new();
        let actuator = Arc::new(RecordingActuator::default());
        let reconciler = Reconciler::new(Arc::new(store.clone()), actuator.clone(), Duration::from_secs(600));
        (reconciler, store, actuator)
    }

    #[tokio::test]
    async fn test_unprovisioned_machine_is_released_when_cluster_is_gone() {
        let (reconciler, store, actuator) = without_cluster();
        let mut machine = worker();
        machine.metadata.finalizers = Some(vec![MACHINE_FINALIZER.to_string()]);
        let machine = store.add_machine(deleting(machine));

        let action = reconciler.reconcile_machine(&machine).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert!(actuator.calls().is_empty());
        assert!(finalizers(&store).is_empty());
    }

    #[tokio::test]
    async fn test_provisioned_machine_keeps_finalizer_when_cluster_is_gone() {
        let (reconciler, store, actuator) = without_cluster();
        let mut machine = provisioned(worker());
        machine.metadata.finalizers = Some(vec![MACHINE_FINALIZER.to_string()]);
        let machine = store.add_machine(deleting(machine));

        let err = reconciler.reconcile_machine(&machine).await.unwrap_err();

        assert!(matches!(err, ControllerError::OrphanedMachine { .. }));
        assert!(!err.is_transient());
        assert!(actuator.calls().is_empty());
        assert_eq!(finalizers(&store), vec![MACHINE_FINALIZER]);
    }

    #[tokio::test]
    async fn test_backoff_grows_per_machine_and_resets_on_success() {
        let (reconciler, store, _actuator) = setup(RecordingActuator::default());
        let machine = store.add_machine(worker());
        let key = machine.key();

        assert_eq!(reconciler.backoff_for(&key, true), Duration::from_secs(10));
        assert_eq!(reconciler.backoff_for(&key, true), Duration::from_secs(10));
        assert_eq!(reconciler.backoff_for(&key, true), Duration::from_secs(20));
        assert_eq!(reconciler.backoff_for("default/other", false), Duration::from_secs(60));

        reconciler.reconcile_machine(&machine).await.unwrap();
        assert_eq!(reconciler.backoff_for(&key, false), Duration::from_secs(60));
    }
}
