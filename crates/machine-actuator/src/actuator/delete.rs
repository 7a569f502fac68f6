//! Delete: run the shutdown script, then forget the host

use std::collections::BTreeMap;

use crds::{Cluster, Machine};
use tracing::{debug, info};

use super::{Operation, SshActuator};
use crate::error::ActuatorError;
use crate::events::EventKind;
use crate::status::{NodeState, INSTANCE_STATUS_ANNOTATION, MACHINE_NAME_ANNOTATION};

impl SshActuator {
    pub(crate) async fn delete_machine(&self, cluster: &Cluster, machine: &Machine) -> Result<(), ActuatorError> {
        info!("Deleting machine {} for cluster {}", machine.key(), cluster.metadata.name.as_deref().unwrap_or_default());

        let config = self.decode_and_validate(machine, Operation::Delete).await?;
        let (record, state) = self.node_state(machine).await?;
        let record = match (record, state) {
            (Some(record), NodeState::Provisioned(_)) => record,
            (_, state) => {
                debug!("Machine {} is not provisioned ({:?}), nothing to delete", machine.key(), state);
                return Ok(());
            }
        };

        let namespace = machine.namespace_or_default();
        let metadata = self.metadata_for(&config, machine)?;
        let scripts = self.render(cluster, machine, &config, &metadata, None)?;
        let client = self.client_for(&config, namespace).await?;

        self.run_script(client.as_ref(), machine, "shutdown", &scripts.shutdown).await?;
        info!("Shutdown script finished on {}", config.ssh_config.host);

        let annotations = BTreeMap::from([
            (INSTANCE_STATUS_ANNOTATION.to_string(), None),
            (MACHINE_NAME_ANNOTATION.to_string(), None),
        ]);
        self.store.patch_machine_annotations(&record, annotations).await?;

        self.events
            .publish(machine, EventKind::Normal, "Deleted", &format!("Deleted machine {}", machine.name()))
            .await;
        info!("Deleted machine {}", machine.key());
        Ok(())
    }
}
