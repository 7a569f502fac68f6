//! Update: bring a provisioned host to the goal versions
//!
//! The comparison baseline is what the host reports, not what the stored
//! spec claims. Every step can be re-run from the top: a half-finished
//! upgrade is picked up again on the next reconcile because the host still
//! reports the old version.

use std::collections::BTreeMap;

use chrono::Utc;
use crds::{Cluster, Machine, MachineVersionInfo, SshMachineProviderConfig};
use ssh_client::SshClientTrait;
use tracing::{debug, info};

use super::create::ensure_endpoint;
use super::{Operation, SshActuator, UpdateStrategy};
use crate::commands::{
    drain_command, find_node_name, install_kubeadm_command, parse_control_plane_version, parse_kubelet_version,
    uncordon_command, upgrade_control_plane_command, CONTROL_PLANE_VERSION_COMMAND, GET_NODES_COMMAND,
    KUBELET_VERSION_COMMAND,
};
use crate::error::ActuatorError;
use crate::events::EventKind;
use crate::status::{InstanceStatus, NodeState, INSTANCE_STATUS_ANNOTATION};
use crate::store::MachineStatusPatch;

impl SshActuator {
    pub(crate) async fn update_machine(&self, cluster: &Cluster, goal: &Machine) -> Result<(), ActuatorError> {
        info!("Updating machine {} to {}", goal.key(), goal.spec.versions);

        let config = self.decode_and_validate(goal, Operation::Update).await?;
        let (record, state) = self.node_state(goal).await?;
        let Some(record) = record else {
            return Err(ActuatorError::State(format!("machine {} not found", goal.key())));
        };
        let status = match state {
            NodeState::Provisioned(status) => status,
            NodeState::Unprovisioned => {
                return Err(ActuatorError::State(format!("machine {} is not provisioned", goal.key())));
            }
            NodeState::Error { reason, message } => {
                return Err(ActuatorError::State(format!(
                    "machine {} is in error state {}: {}",
                    goal.key(),
                    reason,
                    message
                )));
            }
        };

        let namespace = goal.namespace_or_default();
        let client = self.client_for(&config, namespace).await?;
        let observed = observed_versions(client.as_ref(), &config).await?;
        if versions_match(&observed, &goal.spec.versions, &config) {
            debug!("Machine {} already runs {}, nothing to do", goal.key(), observed);
            return Ok(());
        }
        info!("Machine {} runs {}, goal is {}", goal.key(), observed, goal.spec.versions);

        match self.options.update_strategy {
            UpdateStrategy::Recreate => {
                self.delete_machine(cluster, &record).await?;
                self.create_machine(cluster, goal).await?;
            }
            UpdateStrategy::InPlace => {
                if config.is_master() {
                    self.upgrade_master(cluster, goal, &config, client.as_ref(), &observed).await?;
                } else {
                    self.upgrade_worker(cluster, goal, &config, client.as_ref()).await?;
                }
                self.record_upgraded(goal, &status).await?;
            }
        }

        self.events
            .publish(goal, EventKind::Normal, "Updated", &format!("Updated machine {} to {}", goal.name(), goal.spec.versions))
            .await;
        info!("Updated machine {}", goal.key());
        Ok(())
    }

    /// Control plane first, then the node agent, both driven from the master itself
    async fn upgrade_master(
        &self,
        cluster: &Cluster,
        goal: &Machine,
        config: &SshMachineProviderConfig,
        client: &dyn SshClientTrait,
        observed: &MachineVersionInfo,
    ) -> Result<(), ActuatorError> {
        let host = &config.ssh_config.host;
        let target = &goal.spec.versions;

        if observed.control_plane != target.control_plane {
            info!("Upgrading control plane on {} to {}", host, target.control_plane);
            for command in [
                install_kubeadm_command(&target.control_plane),
                upgrade_control_plane_command(&target.control_plane),
            ] {
                client.run(&command).await.map_err(|e| ActuatorError::remote(host, e))?;
            }
        }

        if observed.kubelet != target.kubelet {
            let metadata = self.metadata_for(config, goal)?;
            let scripts = self.render(cluster, goal, config, &metadata, None)?;
            let node = node_name(client, goal, host).await?;

            info!("Upgrading kubelet on node {} to {}", node, target.kubelet);
            client.run(&drain_command(&node)).await.map_err(|e| ActuatorError::remote(host, e))?;
            self.run_script(client, goal, "upgrade", &scripts.upgrade).await?;
            client.run(&uncordon_command(&node)).await.map_err(|e| ActuatorError::remote(host, e))?;
        }
        Ok(())
    }

    /// Drain and uncordon run on the master, the package install on the worker
    async fn upgrade_worker(
        &self,
        cluster: &Cluster,
        goal: &Machine,
        config: &SshMachineProviderConfig,
        worker: &dyn SshClientTrait,
    ) -> Result<(), ActuatorError> {
        let namespace = goal.namespace_or_default();
        ensure_endpoint(cluster)?;

        let metadata = self.metadata_for(config, goal)?;
        let token = self.join_token(cluster, namespace).await?;
        let scripts = self.render(cluster, goal, config, &metadata, Some(&token))?;

        let (_, master_config) = self.find_master(cluster, namespace).await?;
        let master = self.client_for(&master_config, namespace).await?;
        let master_host = &master_config.ssh_config.host;
        let node = node_name(master.as_ref(), goal, master_host).await?;

        info!("Upgrading kubelet on node {} to {} via master {}", node, goal.spec.versions.kubelet, master_host);
        master
            .run(&drain_command(&node))
            .await
            .map_err(|e| ActuatorError::remote(master_host, e))?;
        self.run_script(worker, goal, "upgrade", &scripts.upgrade).await?;
        master
            .run(&uncordon_command(&node))
            .await
            .map_err(|e| ActuatorError::remote(master_host, e))?;
        Ok(())
    }

    async fn record_upgraded(&self, goal: &Machine, status: &InstanceStatus) -> Result<(), ActuatorError> {
        let namespace = goal.namespace_or_default();
        let record = self
            .store
            .get_machine(namespace, goal.name())
            .await?
            .ok_or_else(|| ActuatorError::State(format!("machine {} disappeared during update", goal.key())))?;

        let now = Utc::now();
        let status = status.upgraded(&goal.spec.versions, now);
        let annotations = BTreeMap::from([(INSTANCE_STATUS_ANNOTATION.to_string(), Some(status.encode()?))]);
        self.store.patch_machine_annotations(&record, annotations).await?;
        self.store
            .patch_machine_status(namespace, goal.name(), &MachineStatusPatch::succeeded(&goal.spec.versions, now))
            .await?;
        Ok(())
    }
}

/// Versions reported by the host. The control plane is only queried on masters.
async fn observed_versions(
    client: &dyn SshClientTrait,
    config: &SshMachineProviderConfig,
) -> Result<MachineVersionInfo, ActuatorError> {
    let host = &config.ssh_config.host;
    let output = client
        .run_capture(KUBELET_VERSION_COMMAND)
        .await
        .map_err(|e| ActuatorError::remote(host, e))?;
    let kubelet = parse_kubelet_version(&output)?;

    let control_plane = if config.is_master() {
        let output = client
            .run_capture(CONTROL_PLANE_VERSION_COMMAND)
            .await
            .map_err(|e| ActuatorError::remote(host, e))?;
        parse_control_plane_version(&output)?
    } else {
        String::new()
    };

    Ok(MachineVersionInfo { kubelet, control_plane })
}

fn versions_match(observed: &MachineVersionInfo, goal: &MachineVersionInfo, config: &SshMachineProviderConfig) -> bool {
    observed.kubelet == goal.kubelet && (!config.is_master() || observed.control_plane == goal.control_plane)
}

async fn node_name(client: &dyn SshClientTrait, machine: &Machine, host: &str) -> Result<String, ActuatorError> {
    let output = client
        .run_capture(GET_NODES_COMMAND)
        .await
        .map_err(|e| ActuatorError::remote(host, e))?;
    find_node_name(&output, machine)
}
