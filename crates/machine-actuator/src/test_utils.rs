//! In-memory collaborators and fixtures for actuator tests

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use crds::{
    ApiEndpoint, Cluster, ClusterSpec, ClusterStatus, Machine, MachineRole, MachineSpec, MachineStatus,
    MachineVersionInfo, ProviderConfig, CLUSTER_NAME_LABEL,
};
use machine_setup::{MachineSetupConfigGetter, MachineSetupConfigs, SetupError};
use serde_json::json;
use ssh_client::{MockSshConnector, SshCredential};

use crate::actuator::{ActuatorOptions, ActuatorParams, SshActuator};
use crate::events::{EventKind, EventRecorder};
use crate::secrets::SecretStore;
use crate::status::{InstanceStatus, INSTANCE_STATUS_ANNOTATION, MACHINE_NAME_ANNOTATION};
use crate::store::{MachineStatusPatch, ObjectStore, StoreError};

pub const NAMESPACE: &str = "default";
pub const CLUSTER: &str = "test-cluster";
pub const SECRET: &str = "ssh-key";
pub const MASTER_HOST: &str = "10.0.0.1";
pub const WORKER_HOST: &str = "10.0.0.2";

pub const CATALOG: &str = r#"
items:
  - machineParams:
      roles: [Master]
      versions: { kubelet: 1.10.6, controlPlane: 1.10.6 }
    metadata:
      startupScript: echo start
      shutdownScript: echo stop
      upgradeScript: apt-get install -y kubelet=1.10.6-00
  - machineParams:
      roles: [Master]
      versions: { kubelet: 1.10.5, controlPlane: 1.10.5 }
    metadata:
      startupScript: echo start
      shutdownScript: echo stop
      upgradeScript: apt-get install -y kubelet=1.10.5-00
  - machineParams:
      roles: [Node]
      versions: { kubelet: 1.10.6 }
    metadata:
      startupScript: echo join
      shutdownScript: echo reset
      upgradeScript: apt-get install -y kubelet=1.10.6-00
  - machineParams:
      roles: [Node]
      versions: { kubelet: 1.10.5 }
    metadata:
      startupScript: echo join
      shutdownScript: echo reset
      upgradeScript: apt-get install -y kubelet=1.10.5-00
"#;

#[derive(Default)]
struct ObjectState {
    machines: BTreeMap<(String, String), Machine>,
    clusters: BTreeMap<(String, String), Cluster>,
    next_version: u64,
}

impl ObjectState {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

fn key_of(namespace: Option<&String>, name: Option<&String>) -> (String, String) {
    (
        namespace.cloned().unwrap_or_else(|| NAMESPACE.to_string()),
        name.cloned().unwrap_or_default(),
    )
}

/// Object store keeping records in memory, with resourceVersion checks
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    state: Arc<Mutex<ObjectState>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a machine (for test setup); returns it with its resourceVersion
    pub fn add_machine(&self, mut machine: Machine) -> Machine {
        let mut state = self.state.lock().unwrap();
        machine.metadata.resource_version = Some(state.bump());
        let key = key_of(machine.metadata.namespace.as_ref(), machine.metadata.name.as_ref());
        state.machines.insert(key, machine.clone());
        machine
    }

    /// Store a cluster (for test setup); returns it with its resourceVersion
    pub fn add_cluster(&self, mut cluster: Cluster) -> Cluster {
        let mut state = self.state.lock().unwrap();
        cluster.metadata.resource_version = Some(state.bump());
        let key = key_of(cluster.metadata.namespace.as_ref(), cluster.metadata.name.as_ref());
        state.clusters.insert(key, cluster.clone());
        cluster
    }

    pub fn machine(&self, namespace: &str, name: &str) -> Option<Machine> {
        let key = (namespace.to_string(), name.to_string());
        self.state.lock().unwrap().machines.get(&key).cloned()
    }

    pub fn cluster(&self, namespace: &str, name: &str) -> Option<Cluster> {
        let key = (namespace.to_string(), name.to_string());
        self.state.lock().unwrap().clusters.get(&key).cloned()
    }

    /// Simulate a concurrent writer touching the cluster
    pub fn touch_cluster(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        let version = state.bump();
        if let Some(cluster) = state.clusters.get_mut(&(namespace.to_string(), name.to_string())) {
            cluster.metadata.resource_version = Some(version);
        }
    }
}

fn check_version(kind: &'static str, stored: &Option<String>, given: &Option<String>, name: &str) -> Result<(), StoreError> {
    if given.is_some() && stored != given {
        return Err(StoreError::Conflict {
            kind,
            name: name.to_string(),
        });
    }
    Ok(())
}

#[async_trait::async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>, StoreError> {
        Ok(self.machine(namespace, name))
    }

    async fn list_machines(&self, namespace: &str) -> Result<Vec<Machine>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .machines
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, m)| m.clone())
            .collect())
    }

    async fn patch_machine_annotations(
        &self,
        machine: &Machine,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<Machine, StoreError> {
        let mut state = self.state.lock().unwrap();
        let version = state.bump();
        let key = key_of(machine.metadata.namespace.as_ref(), machine.metadata.name.as_ref());
        let stored = state.machines.get_mut(&key).ok_or_else(|| StoreError::NotFound {
            kind: "Machine",
            name: machine.key(),
        })?;
        check_version("Machine", &stored.metadata.resource_version, &machine.metadata.resource_version, &machine.key())?;

        let current = stored.metadata.annotations.get_or_insert_with(BTreeMap::new);
        for (key, value) in annotations {
            match value {
                Some(value) => current.insert(key, value),
                None => current.remove(&key),
            };
        }
        stored.metadata.resource_version = Some(version);
        Ok(stored.clone())
    }

    async fn patch_machine_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &MachineStatusPatch,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let stored = state
            .machines
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| StoreError::NotFound {
                kind: "Machine",
                name: format!("{namespace}/{name}"),
            })?;

        let status = stored.status.get_or_insert_with(MachineStatus::default);
        status.error_reason = patch.error_reason.clone();
        status.error_message = patch.error_message.clone();
        status.last_updated = Some(patch.last_updated);
        if let Some(versions) = &patch.versions {
            status.versions = Some(versions.clone());
        }
        Ok(())
    }

    async fn set_machine_finalizers(&self, machine: &Machine, finalizers: Vec<String>) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let version = state.bump();
        let key = key_of(machine.metadata.namespace.as_ref(), machine.metadata.name.as_ref());
        let stored = state.machines.get_mut(&key).ok_or_else(|| StoreError::NotFound {
            kind: "Machine",
            name: machine.key(),
        })?;
        check_version("Machine", &stored.metadata.resource_version, &machine.metadata.resource_version, &machine.key())?;

        stored.metadata.finalizers = Some(finalizers);
        stored.metadata.resource_version = Some(version);
        Ok(())
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, StoreError> {
        Ok(self.cluster(namespace, name))
    }

    async fn list_clusters(&self, namespace: &str) -> Result<Vec<Cluster>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .clusters
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn publish_api_endpoint(&self, cluster: &Cluster, endpoint: ApiEndpoint) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let version = state.bump();
        let key = key_of(cluster.metadata.namespace.as_ref(), cluster.metadata.name.as_ref());
        let name = key.1.clone();
        let stored = state.clusters.get_mut(&key).ok_or_else(|| StoreError::NotFound {
            kind: "Cluster",
            name: name.clone(),
        })?;
        check_version("Cluster", &stored.metadata.resource_version, &cluster.metadata.resource_version, &name)?;

        stored.status.get_or_insert_with(ClusterStatus::default).api_endpoints = vec![endpoint];
        stored.metadata.resource_version = Some(version);
        Ok(())
    }
}

/// Secret store keeping credentials and kubeconfigs in memory
#[derive(Clone, Default)]
pub struct MemorySecretStore {
    credentials: Arc<Mutex<HashMap<(String, String), SshCredential>>>,
    kubeconfigs: Arc<Mutex<HashMap<(String, String), String>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_credential(&self, namespace: &str, name: &str, credential: SshCredential) {
        self.credentials
            .lock()
            .unwrap()
            .insert((namespace.to_string(), name.to_string()), credential);
    }

    pub fn kubeconfig(&self, namespace: &str, cluster: &str) -> Option<String> {
        self.kubeconfigs
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), cluster.to_string()))
            .cloned()
    }
}

#[async_trait::async_trait]
impl SecretStore for MemorySecretStore {
    async fn get_ssh_credential(&self, namespace: &str, secret_name: &str) -> Result<SshCredential, StoreError> {
        self.credentials
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), secret_name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "Secret",
                name: format!("{namespace}/{secret_name}"),
            })
    }

    async fn save_kubeconfig(&self, namespace: &str, cluster_name: &str, kubeconfig: &str) -> Result<(), StoreError> {
        self.kubeconfigs
            .lock()
            .unwrap()
            .insert((namespace.to_string(), cluster_name.to_string()), kubeconfig.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub machine: String,
    pub kind: EventKind,
    pub reason: String,
    pub note: String,
}

/// Event recorder remembering every event
#[derive(Clone, Default)]
pub struct RecordingEvents {
    events: Arc<Mutex<Vec<RecordedEvent>>>,
}

impl RecordingEvents {
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }
}

#[async_trait::async_trait]
impl EventRecorder for RecordingEvents {
    async fn publish(&self, machine: &Machine, kind: EventKind, reason: &str, note: &str) {
        self.events.lock().unwrap().push(RecordedEvent {
            machine: machine.key(),
            kind,
            reason: reason.to_string(),
            note: note.to_string(),
        });
    }
}

/// Fixed catalog that tests can swap out
#[derive(Clone)]
pub struct StaticSetupConfigs {
    configs: Arc<Mutex<MachineSetupConfigs>>,
}

impl StaticSetupConfigs {
    pub fn from_yaml(yaml: &str) -> Self {
        Self {
            configs: Arc::new(Mutex::new(MachineSetupConfigs::load(yaml.as_bytes()).unwrap())),
        }
    }
}

impl MachineSetupConfigGetter for StaticSetupConfigs {
    fn get_machine_setup_config(&self) -> Result<MachineSetupConfigs, SetupError> {
        Ok(self.configs.lock().unwrap().clone())
    }
}

pub fn test_cluster(namespace: &str, name: &str, endpoints: Vec<ApiEndpoint>) -> Cluster {
    let mut spec = ClusterSpec::default();
    spec.cluster_network.pods.cidr_blocks = vec!["192.168.0.0/16".to_string()];
    spec.cluster_network.services.cidr_blocks = vec!["10.96.0.0/12".to_string()];
    spec.cluster_network.service_domain = "cluster.local".to_string();

    let mut cluster = Cluster::new(name, spec);
    cluster.metadata.namespace = Some(namespace.to_string());
    cluster.status = Some(ClusterStatus {
        api_endpoints: endpoints,
        ..Default::default()
    });
    cluster
}

pub fn endpoint(host: &str) -> ApiEndpoint {
    ApiEndpoint {
        host: host.to_string(),
        port: 443,
    }
}

pub fn versions(kubelet: &str, control_plane: &str) -> MachineVersionInfo {
    MachineVersionInfo {
        kubelet: kubelet.to_string(),
        control_plane: control_plane.to_string(),
    }
}

pub fn test_machine(name: &str, role: MachineRole, host: &str, versions: MachineVersionInfo) -> Machine {
    let mut machine = Machine::new(
        name,
        MachineSpec {
            provider_config: ProviderConfig {
                value: Some(json!({
                    "roles": [role],
                    "sshConfig": {
                        "username": "root",
                        "host": host,
                        "port": 22,
                        "secretName": SECRET
                    }
                })),
            },
            versions,
        },
    );
    machine.metadata.namespace = Some(NAMESPACE.to_string());
    machine.metadata.labels = Some(BTreeMap::from([(CLUSTER_NAME_LABEL.to_string(), CLUSTER.to_string())]));
    machine
}

/// `machine` carrying an instance status as if it had been created
pub fn provisioned(mut machine: Machine) -> Machine {
    let config = machine.ssh_provider_config().unwrap();
    let status = InstanceStatus::provisioned(&config, &machine.spec.versions, Utc::now());
    let name = machine.name().to_string();
    let annotations = machine.metadata.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert(INSTANCE_STATUS_ANNOTATION.to_string(), status.encode().unwrap());
    annotations.insert(MACHINE_NAME_ANNOTATION.to_string(), name);
    machine
}

/// Actuator wired to in-memory collaborators
pub struct Harness {
    pub actuator: SshActuator,
    pub store: MemoryObjectStore,
    pub secrets: MemorySecretStore,
    pub events: RecordingEvents,
    pub ssh: MockSshConnector,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_options(ActuatorOptions::default())
    }

    pub fn with_options(options: ActuatorOptions) -> Self {
        let store = MemoryObjectStore::new();
        let secrets = MemorySecretStore::new();
        secrets.add_credential(NAMESPACE, SECRET, SshCredential::new("test-key", ""));
        let events = RecordingEvents::default();
        let ssh = MockSshConnector::new();

        let actuator = SshActuator::new(ActuatorParams {
            store: Arc::new(store.clone()),
            secrets: Arc::new(secrets.clone()),
            events: Arc::new(events.clone()),
            ssh: Arc::new(ssh.clone()),
            setup_configs: Arc::new(StaticSetupConfigs::from_yaml(CATALOG)),
            options,
        });

        Self {
            actuator,
            store,
            secrets,
            events,
            ssh,
        }
    }
}
