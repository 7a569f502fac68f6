//! Create: run the startup script once, then record the host as provisioned

use std::collections::BTreeMap;

use chrono::Utc;
use crds::{ApiEndpoint, Cluster, Machine, SshMachineProviderConfig};
use ssh_client::SshClientTrait;
use tracing::{debug, info};

use super::{Operation, SshActuator};
use crate::error::ActuatorError;
use crate::events::EventKind;
use crate::status::{InstanceStatus, INSTANCE_STATUS_ANNOTATION, MACHINE_NAME_ANNOTATION};
use crate::store::MachineStatusPatch;

impl SshActuator {
    pub(crate) async fn create_machine(&self, cluster: &Cluster, machine: &Machine) -> Result<(), ActuatorError> {
        info!("Creating machine {} for cluster {}", machine.key(), cluster.metadata.name.as_deref().unwrap_or_default());

        let config = self.decode_and_validate(machine, Operation::Create).await?;
        if crate::MachineActuator::exists(self, cluster, machine).await? {
            debug!("Machine {} already provisioned, nothing to do", machine.key());
            return Ok(());
        }

        let namespace = machine.namespace_or_default();
        let metadata = self.metadata_for(&config, machine)?;
        let client = self.client_for(&config, namespace).await?;

        let token = if config.is_master() {
            None
        } else {
            ensure_endpoint(cluster)?;
            Some(self.join_token(cluster, namespace).await?)
        };
        let scripts = self.render(cluster, machine, &config, &metadata, token.as_deref())?;

        self.run_script(client.as_ref(), machine, "startup", &scripts.startup).await?;
        info!("Startup script finished on {}", config.ssh_config.host);

        if config.is_master() {
            self.publish_master(cluster, &config, client.as_ref()).await?;
        }

        self.record_provisioned(machine, &config).await?;
        self.events
            .publish(machine, EventKind::Normal, "Created", &format!("Created machine {}", machine.name()))
            .await;
        info!("Created machine {}", machine.key());
        Ok(())
    }

    /// Publish the first master's endpoint and store its kubeconfig.
    ///
    /// Endpoint publication is conditional on the cluster's resourceVersion.
    /// When two masters race, the loser gets a conflict and the retry finds
    /// the endpoint already published.
    async fn publish_master(
        &self,
        cluster: &Cluster,
        config: &SshMachineProviderConfig,
        client: &dyn SshClientTrait,
    ) -> Result<(), ActuatorError> {
        let namespace = cluster.metadata.namespace.as_deref().unwrap_or("default");
        let name = cluster.metadata.name.as_deref().unwrap_or_default();
        let current = self
            .store
            .get_cluster(namespace, name)
            .await?
            .ok_or_else(|| ActuatorError::State(format!("cluster {namespace}/{name} no longer exists")))?;

        if current.api_endpoints().is_empty() {
            let endpoint = ApiEndpoint {
                host: config.ssh_config.host.clone(),
                port: self.options.api_server_port,
            };
            info!("Publishing API endpoint {} for cluster {}", endpoint, name);
            self.store.publish_api_endpoint(&current, endpoint).await?;
        }

        let kubeconfig = client
            .get_kubeconfig()
            .await
            .map_err(|e| ActuatorError::remote(&config.ssh_config.host, e))?;
        self.secrets.save_kubeconfig(namespace, name, &kubeconfig).await?;
        Ok(())
    }

    async fn record_provisioned(&self, machine: &Machine, config: &SshMachineProviderConfig) -> Result<(), ActuatorError> {
        let namespace = machine.namespace_or_default();
        let record = self
            .store
            .get_machine(namespace, machine.name())
            .await?
            .ok_or_else(|| ActuatorError::State(format!("machine {} disappeared during create", machine.key())))?;

        let now = Utc::now();
        let status = InstanceStatus::provisioned(config, &machine.spec.versions, now);
        let annotations = BTreeMap::from([
            (INSTANCE_STATUS_ANNOTATION.to_string(), Some(status.encode()?)),
            (MACHINE_NAME_ANNOTATION.to_string(), Some(machine.name().to_string())),
        ]);
        self.store.patch_machine_annotations(&record, annotations).await?;
        self.store
            .patch_machine_status(namespace, machine.name(), &MachineStatusPatch::succeeded(&machine.spec.versions, now))
            .await?;
        Ok(())
    }
}

pub(super) fn ensure_endpoint(cluster: &Cluster) -> Result<(), ActuatorError> {
    if cluster.api_endpoints().is_empty() {
        return Err(ActuatorError::EndpointNotReady {
            cluster: cluster.metadata.name.clone().unwrap_or_default(),
        });
    }
    Ok(())
}
