//! Lifecycle actuator
//!
//! [`SshActuator`] is the single implementation of [`MachineActuator`] and
//! [`MachineDeployer`]. The hosting controller builds it explicitly from
//! [`ActuatorParams`]; there is no registry.

mod create;
mod delete;
mod deployer;
mod update;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use crds::{Cluster, Machine, SshMachineProviderConfig};
use machine_setup::{MachineParams, MachineSetupConfigGetter, Metadata, RenderParams, RenderedScripts, ScriptRenderer};
use ssh_client::{SshClientTrait, SshConnector, SshEndpoint};
use tracing::{debug, warn};

use crate::commands::CREATE_TOKEN_COMMAND;
use crate::error::{ActuatorError, INVALID_CONFIGURATION_REASON};
use crate::events::{EventKind, EventRecorder};
use crate::secrets::SecretStore;
use crate::status::{NodeState, INVALID_INSTANCE_STATUS_REASON};
use crate::store::{MachineStatusPatch, ObjectStore};

/// Lifecycle contract called once per machine per reconcile
#[async_trait::async_trait]
pub trait MachineActuator: Send + Sync {
    /// Provision the host. A no-op when the machine already exists.
    async fn create(&self, cluster: &Cluster, machine: &Machine) -> Result<(), ActuatorError>;

    /// Tear down the host. A no-op when the machine does not exist.
    async fn delete(&self, cluster: &Cluster, machine: &Machine) -> Result<(), ActuatorError>;

    /// Bring an existing host to the goal versions
    async fn update(&self, cluster: &Cluster, goal: &Machine) -> Result<(), ActuatorError>;

    /// Whether the machine carries a decodable instance status. Never
    /// contacts the host.
    async fn exists(&self, cluster: &Cluster, machine: &Machine) -> Result<bool, ActuatorError>;
}

/// Read-only queries used when deploying against a provisioned cluster
#[async_trait::async_trait]
pub trait MachineDeployer: Send + Sync {
    async fn get_ip(&self, cluster: &Cluster, machine: &Machine) -> Result<String, ActuatorError>;

    async fn get_kubeconfig(&self, cluster: &Cluster, master: &Machine) -> Result<String, ActuatorError>;
}

/// How updates reach the goal versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateStrategy {
    /// Upgrade packages on the running host, with drain and uncordon
    #[default]
    InPlace,
    /// Run delete for the current machine, then create for the goal
    Recreate,
}

impl FromStr for UpdateStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in-place" => Ok(UpdateStrategy::InPlace),
            "recreate" => Ok(UpdateStrategy::Recreate),
            other => Err(format!("unknown update strategy {other:?}, expected \"in-place\" or \"recreate\"")),
        }
    }
}

/// How scripts are handed to the host
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ScriptDelivery {
    /// Pass the whole script as the command
    #[default]
    Inline,
    /// Copy the script into `dir` and run it with bash
    Staged { dir: String },
}

#[derive(Debug, Clone)]
pub struct ActuatorOptions {
    pub update_strategy: UpdateStrategy,
    pub script_delivery: ScriptDelivery,
    /// Port published alongside a master's host as the API endpoint
    pub api_server_port: u16,
}

impl Default for ActuatorOptions {
    fn default() -> Self {
        Self {
            update_strategy: UpdateStrategy::default(),
            script_delivery: ScriptDelivery::default(),
            api_server_port: 443,
        }
    }
}

/// Collaborators of the actuator
pub struct ActuatorParams {
    pub store: Arc<dyn ObjectStore>,
    pub secrets: Arc<dyn SecretStore>,
    pub events: Arc<dyn EventRecorder>,
    pub ssh: Arc<dyn SshConnector>,
    pub setup_configs: Arc<dyn MachineSetupConfigGetter>,
    pub options: ActuatorOptions,
}

/// Lifecycle operation, used in event reasons
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Operation {
    Create,
    Delete,
    Update,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => f.write_str("Create"),
            Operation::Delete => f.write_str("Delete"),
            Operation::Update => f.write_str("Update"),
        }
    }
}

/// Actuator driving hosts over SSH
pub struct SshActuator {
    store: Arc<dyn ObjectStore>,
    secrets: Arc<dyn SecretStore>,
    events: Arc<dyn EventRecorder>,
    ssh: Arc<dyn SshConnector>,
    setup_configs: Arc<dyn MachineSetupConfigGetter>,
    renderer: ScriptRenderer,
    options: ActuatorOptions,
}

impl SshActuator {
    pub fn new(params: ActuatorParams) -> Self {
        Self {
            store: params.store,
            secrets: params.secrets,
            events: params.events,
            ssh: params.ssh,
            setup_configs: params.setup_configs,
            renderer: ScriptRenderer::new(),
            options: params.options,
        }
    }

    /// Decode the provider config and check the fields every operation needs.
    ///
    /// Failures are recorded on the machine and announced with a
    /// `Failed<Operation>` event before being returned.
    pub(crate) async fn decode_and_validate(
        &self,
        machine: &Machine,
        operation: Operation,
    ) -> Result<SshMachineProviderConfig, ActuatorError> {
        let result = machine
            .ssh_provider_config()
            .map_err(ActuatorError::from)
            .and_then(|config| validate(machine, &config).map(|()| config));

        match result {
            Ok(config) => Ok(config),
            Err(e) => Err(self.handle_machine_error(machine, e, operation).await),
        }
    }

    async fn handle_machine_error(&self, machine: &Machine, error: ActuatorError, operation: Operation) -> ActuatorError {
        warn!("{} of machine {} rejected: {}", operation, machine.key(), error);

        let namespace = machine.namespace_or_default();
        match self.store.get_machine(namespace, machine.name()).await {
            Ok(Some(_)) => {
                let patch = MachineStatusPatch::failed(INVALID_CONFIGURATION_REASON, &error.to_string(), Utc::now());
                if let Err(e) = self.store.patch_machine_status(namespace, machine.name(), &patch).await {
                    warn!("Failed to record error on machine {}: {}", machine.key(), e);
                }
            }
            Ok(None) => debug!("Machine {} not stored, not recording error", machine.key()),
            Err(e) => warn!("Failed to look up machine {}: {}", machine.key(), e),
        }

        self.events
            .publish(machine, EventKind::Warning, &format!("Failed{operation}"), &error.to_string())
            .await;
        error
    }

    /// Current record of `machine` and the state derived from it
    pub(crate) async fn node_state(&self, machine: &Machine) -> Result<(Option<Machine>, NodeState), ActuatorError> {
        let record = self
            .store
            .get_machine(machine.namespace_or_default(), machine.name())
            .await?;
        let state = NodeState::of(record.as_ref());
        Ok((record, state))
    }

    pub(crate) fn metadata_for(&self, config: &SshMachineProviderConfig, machine: &Machine) -> Result<Metadata, ActuatorError> {
        let params = MachineParams::new(config.roles.clone(), machine.spec.versions.clone());
        let catalog = self.setup_configs.get_machine_setup_config()?;
        Ok(catalog.get_metadata(&params)?.clone())
    }

    pub(crate) fn render(
        &self,
        cluster: &Cluster,
        machine: &Machine,
        config: &SshMachineProviderConfig,
        metadata: &Metadata,
        token: Option<&str>,
    ) -> Result<RenderedScripts, ActuatorError> {
        Ok(self.renderer.render(RenderParams {
            cluster,
            machine,
            provider_config: config,
            metadata,
            token,
        })?)
    }

    /// SSH client for the host described by `config`
    pub(crate) async fn client_for(
        &self,
        config: &SshMachineProviderConfig,
        namespace: &str,
    ) -> Result<Box<dyn SshClientTrait>, ActuatorError> {
        let ssh = &config.ssh_config;
        let credential = self.secrets.get_ssh_credential(namespace, &ssh.secret_name).await?;
        let endpoint = SshEndpoint::new(&ssh.username, &ssh.host, ssh.port);
        Ok(self.ssh.client(endpoint, credential))
    }

    /// First provisioned master of the cluster, by name
    pub(crate) async fn find_master(
        &self,
        cluster: &Cluster,
        namespace: &str,
    ) -> Result<(Machine, SshMachineProviderConfig), ActuatorError> {
        let cluster_name = cluster.metadata.name.as_deref().unwrap_or_default();
        let mut masters: Vec<(Machine, SshMachineProviderConfig)> = self
            .store
            .list_machines(namespace)
            .await?
            .into_iter()
            .filter(|m| m.cluster_name().is_none_or(|name| name == cluster_name))
            .filter(|m| NodeState::of(Some(m)).is_provisioned())
            .filter_map(|m| {
                let config = m.ssh_provider_config().ok()?;
                config.is_master().then_some((m, config))
            })
            .collect();
        masters.sort_by(|(a, _), (b, _)| a.name().cmp(b.name()));

        let (master, config) = masters.into_iter().next().ok_or_else(|| ActuatorError::MasterNotReady {
            cluster: cluster_name.to_string(),
        })?;
        debug!("Using master {} for cluster {}", master.key(), cluster_name);
        Ok((master, config))
    }

    /// Mint a join token on the cluster's master
    pub(crate) async fn join_token(&self, cluster: &Cluster, namespace: &str) -> Result<String, ActuatorError> {
        let (_, master_config) = self.find_master(cluster, namespace).await?;
        let master = self.client_for(&master_config, namespace).await?;
        let output = master
            .run_capture(CREATE_TOKEN_COMMAND)
            .await
            .map_err(|e| ActuatorError::remote(&master_config.ssh_config.host, e))?;
        Ok(output.trim().to_string())
    }

    /// Run a rendered script on the host
    pub(crate) async fn run_script(
        &self,
        client: &dyn SshClientTrait,
        machine: &Machine,
        purpose: &str,
        script: &str,
    ) -> Result<(), ActuatorError> {
        let host = client.endpoint().host.clone();
        let result = match &self.options.script_delivery {
            ScriptDelivery::Inline => client.run(script).await.map(|_| ()),
            ScriptDelivery::Staged { dir } => {
                let path = format!(
                    "{}/{}-{}-{}.sh",
                    dir.trim_end_matches('/'),
                    machine.namespace_or_default(),
                    machine.name(),
                    purpose
                );
                match client.put_file(script, &path).await {
                    Ok(()) => client.run(&format!("bash {path}")).await.map(|_| ()),
                    Err(e) => Err(e),
                }
            }
        };
        result.map_err(|e| ActuatorError::remote(host, e))
    }
}

fn validate(machine: &Machine, config: &SshMachineProviderConfig) -> Result<(), ActuatorError> {
    let missing = |field: &str| Err(ActuatorError::Validation(format!("{field} is required")));

    if config.roles.is_empty() {
        return missing("providerConfig roles");
    }
    if config.ssh_config.host.is_empty() {
        return missing("sshConfig.host");
    }
    if config.ssh_config.username.is_empty() {
        return missing("sshConfig.username");
    }
    if config.ssh_config.secret_name.is_empty() {
        return missing("sshConfig.secretName");
    }
    if machine.spec.versions.kubelet.is_empty() {
        return missing("spec.versions.kubelet");
    }
    if config.is_master() && machine.spec.versions.control_plane.is_empty() {
        return missing("spec.versions.controlPlane for master machines");
    }
    Ok(())
}

#[async_trait::async_trait]
impl MachineActuator for SshActuator {
    async fn create(&self, cluster: &Cluster, machine: &Machine) -> Result<(), ActuatorError> {
        self.create_machine(cluster, machine).await
    }

    async fn delete(&self, cluster: &Cluster, machine: &Machine) -> Result<(), ActuatorError> {
        self.delete_machine(cluster, machine).await
    }

    async fn update(&self, cluster: &Cluster, goal: &Machine) -> Result<(), ActuatorError> {
        self.update_machine(cluster, goal).await
    }

    async fn exists(&self, _cluster: &Cluster, machine: &Machine) -> Result<bool, ActuatorError> {
        let (_, state) = self.node_state(machine).await?;
        match state {
            NodeState::Provisioned(_) => Ok(true),
            NodeState::Error { reason, message } if reason == INVALID_INSTANCE_STATUS_REASON => Err(
                ActuatorError::State(format!("machine {} has an unreadable instance status: {}", machine.key(), message)),
            ),
            NodeState::Unprovisioned | NodeState::Error { .. } => Ok(false),
        }
    }
}
