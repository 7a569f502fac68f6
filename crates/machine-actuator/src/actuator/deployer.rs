use crds::{Cluster, Machine};
use tracing::debug;

use super::SshActuator;
use crate::error::ActuatorError;
use crate::MachineDeployer;

#[async_trait::async_trait]
impl MachineDeployer for SshActuator {
    async fn get_ip(&self, _cluster: &Cluster, machine: &Machine) -> Result<String, ActuatorError> {
        let config = machine.ssh_provider_config()?;
        Ok(config.ssh_config.host)
    }

    async fn get_kubeconfig(&self, _cluster: &Cluster, master: &Machine) -> Result<String, ActuatorError> {
        let config = master.ssh_provider_config()?;
        debug!("Fetching kubeconfig from {}", config.ssh_config.host);
        let client = self.client_for(&config, master.namespace_or_default()).await?;
        client
            .get_kubeconfig()
            .await
            .map_err(|e| ActuatorError::remote(&config.ssh_config.host, e))
    }
}

#[cfg(test)]
mod tests {
    use crate::error::ActuatorError;
    use crate::test_utils::*;
    use crate::MachineDeployer;
    use crds::{MachineRole, ProviderConfig};
    use ssh_client::{SshOperation, GET_KUBECONFIG_COMMAND};

    #[tokio::test]
    async fn test_get_ip_returns_ssh_host() {
        let harness = Harness::new();
        let cluster = test_cluster(NAMESPACE, CLUSTER, vec![]);
        let machine = test_machine("worker-0", MachineRole::Node, WORKER_HOST, versions("1.10.6", ""));

        assert_eq!(harness.actuator.get_ip(&cluster, &machine).await.unwrap(), WORKER_HOST);
        assert_eq!(harness.ssh.sessions_opened(), 0);
    }

    #[tokio::test]
    async fn test_get_ip_rejects_missing_config() {
        let harness = Harness::new();
        let cluster = test_cluster(NAMESPACE, CLUSTER, vec![]);
        let mut machine = test_machine("worker-0", MachineRole::Node, WORKER_HOST, versions("1.10.6", ""));
        machine.spec.provider_config = ProviderConfig::default();

        let err = harness.actuator.get_ip(&cluster, &machine).await.unwrap_err();
        assert!(matches!(err, ActuatorError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_get_kubeconfig_reads_admin_conf() {
        let harness = Harness::new();
        let cluster = test_cluster(NAMESPACE, CLUSTER, vec![endpoint(MASTER_HOST)]);
        let master = test_machine("master-0", MachineRole::Master, MASTER_HOST, versions("1.10.6", "1.10.6"));
        harness.ssh.respond(MASTER_HOST, "admin.conf", "apiVersion: v1\nkind: Config\n");

        let kubeconfig = harness.actuator.get_kubeconfig(&cluster, &master).await.unwrap();

        assert_eq!(kubeconfig, "apiVersion: v1\nkind: Config\n");
        let calls = harness.ssh.calls_to(MASTER_HOST);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].operation, SshOperation::RunCapture);
        assert_eq!(calls[0].payload, GET_KUBECONFIG_COMMAND);
    }

    #[tokio::test]
    async fn test_get_kubeconfig_from_unreachable_master() {
        let harness = Harness::new();
        let cluster = test_cluster(NAMESPACE, CLUSTER, vec![]);
        let master = test_machine("master-0", MachineRole::Master, MASTER_HOST, versions("1.10.6", "1.10.6"));
        harness.ssh.set_unreachable(MASTER_HOST);

        let err = harness.actuator.get_kubeconfig(&cluster, &master).await.unwrap_err();
        assert!(matches!(err, ActuatorError::Remote { .. }));
    }
}
