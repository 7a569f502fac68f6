//! Commands issued on hosts and parsers for their output
//!
//! The strings are fixed; hosts provisioned by earlier releases expect
//! exactly these invocations.

use crds::Machine;
use k8s_openapi::api::core::v1::Node;
use serde::Deserialize;

use crate::error::ActuatorError;

/// Admin kubeconfig on masters
pub const ADMIN_KUBECONFIG_PATH: &str = "/etc/kubernetes/admin.conf";

pub const CREATE_TOKEN_COMMAND: &str = "kubeadm token create --ttl 10m";
pub const KUBELET_VERSION_COMMAND: &str = "kubelet --version";
pub const CONTROL_PLANE_VERSION_COMMAND: &str = "kubectl --kubeconfig /etc/kubernetes/admin.conf version -o json";
pub const GET_NODES_COMMAND: &str = "kubectl --kubeconfig /etc/kubernetes/admin.conf get nodes -o json";

/// Node annotation binding a node to its `namespace/name` Machine
pub const NODE_MACHINE_ANNOTATION: &str = "machine";

pub fn drain_command(node: &str) -> String {
    format!("kubectl --kubeconfig {ADMIN_KUBECONFIG_PATH} drain {node} --ignore-daemonsets")
}

pub fn uncordon_command(node: &str) -> String {
    format!("kubectl --kubeconfig {ADMIN_KUBECONFIG_PATH} uncordon {node}")
}

pub fn install_kubeadm_command(version: &str) -> String {
    format!(
        "curl -sSL https://dl.k8s.io/release/v{version}/bin/linux/amd64/kubeadm -o /usr/bin/kubeadm.dl \
         && chmod a+rx /usr/bin/kubeadm.dl && mv -f /usr/bin/kubeadm.dl /usr/bin/kubeadm"
    )
}

pub fn upgrade_control_plane_command(version: &str) -> String {
    format!("kubeadm upgrade apply v{version} -y")
}

/// `Kubernetes v1.10.6` -> `1.10.6`
pub fn parse_kubelet_version(output: &str) -> Result<String, ActuatorError> {
    let version = output
        .trim()
        .strip_prefix("Kubernetes ")
        .map(|v| v.trim_start_matches('v'))
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ActuatorError::UnexpectedOutput {
            command: KUBELET_VERSION_COMMAND.to_string(),
            details: format!("expected \"Kubernetes v<version>\", got {:?}", output.trim()),
        })?;
    Ok(version.to_string())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VersionOutput {
    server_version: Option<GitVersion>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GitVersion {
    git_version: String,
}

/// `serverVersion.gitVersion` of `kubectl version -o json`, without the `v`
pub fn parse_control_plane_version(output: &str) -> Result<String, ActuatorError> {
    let unexpected = |details: String| ActuatorError::UnexpectedOutput {
        command: CONTROL_PLANE_VERSION_COMMAND.to_string(),
        details,
    };

    let parsed: VersionOutput = serde_json::from_str(output).map_err(|e| unexpected(e.to_string()))?;
    let server = parsed
        .server_version
        .ok_or_else(|| unexpected("serverVersion is missing".to_string()))?;
    Ok(server.git_version.trim_start_matches('v').to_string())
}

/// `kubectl get -o json` prints a generic `List`, not a `NodeList`
#[derive(Deserialize)]
struct NodeListOutput {
    #[serde(default)]
    items: Vec<Node>,
}

/// Name of the node bound to `machine`.
///
/// Nodes are matched by their `machine=<namespace>/<name>` annotation and,
/// failing that, by having the same name as the Machine.
pub fn find_node_name(output: &str, machine: &Machine) -> Result<String, ActuatorError> {
    let list: NodeListOutput = serde_json::from_str(output).map_err(|e| ActuatorError::UnexpectedOutput {
        command: GET_NODES_COMMAND.to_string(),
        details: e.to_string(),
    })?;

    let key = machine.key();
    let by_annotation = list.items.iter().find(|node| {
        node.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(NODE_MACHINE_ANNOTATION))
            .is_some_and(|value| *value == key)
    });
    let by_name = || {
        list.items
            .iter()
            .find(|node| node.metadata.name.as_deref() == Some(machine.name()))
    };

    by_annotation
        .or_else(by_name)
        .and_then(|node| node.metadata.name.clone())
        .ok_or_else(|| ActuatorError::State(format!("no node is bound to machine {key}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::MachineSpec;
    use serde_json::json;

    fn machine(namespace: &str, name: &str) -> Machine {
        let mut machine = Machine::new(name, MachineSpec::default());
        machine.metadata.namespace = Some(namespace.to_string());
        machine
    }

    #[test]
    fn test_commands_are_templated_verbatim() {
        assert_eq!(
            drain_command("node-1"),
            "kubectl --kubeconfig /etc/kubernetes/admin.conf drain node-1 --ignore-daemonsets"
        );
        assert_eq!(
            uncordon_command("node-1"),
            "kubectl --kubeconfig /etc/kubernetes/admin.conf uncordon node-1"
        );
        assert_eq!(upgrade_control_plane_command("1.11.0"), "kubeadm upgrade apply v1.11.0 -y");
        assert_eq!(
            install_kubeadm_command("1.11.0"),
            "curl -sSL https://dl.k8s.io/release/v1.11.0/bin/linux/amd64/kubeadm -o /usr/bin/kubeadm.dl \
             && chmod a+rx /usr/bin/kubeadm.dl && mv -f /usr/bin/kubeadm.dl /usr/bin/kubeadm"
        );
    }

    #[test]
    fn test_parse_kubelet_version() {
        assert_eq!(parse_kubelet_version("Kubernetes v1.10.6\n").unwrap(), "1.10.6");
        assert!(matches!(
            parse_kubelet_version("bash: kubelet: command not found"),
            Err(ActuatorError::UnexpectedOutput { .. })
        ));
    }

    #[test]
    fn test_parse_control_plane_version() {
        let output = json!({
            "clientVersion": { "gitVersion": "v1.10.6" },
            "serverVersion": { "gitVersion": "v1.10.5" }
        })
        .to_string();
        assert_eq!(parse_control_plane_version(&output).unwrap(), "1.10.5");

        let output = json!({ "clientVersion": { "gitVersion": "v1.10.6" } }).to_string();
        assert!(parse_control_plane_version(&output).is_err());
    }

    #[test]
    fn test_find_node_prefers_machine_annotation() {
        let output = json!({
            "apiVersion": "v1",
            "kind": "List",
            "items": [
                { "metadata": { "name": "worker-1" } },
                { "metadata": { "name": "ip-10-0-0-7", "annotations": { "machine": "prod/worker-1" } } }
            ]
        })
        .to_string();

        assert_eq!(find_node_name(&output, &machine("prod", "worker-1")).unwrap(), "ip-10-0-0-7");
        assert_eq!(find_node_name(&output, &machine("dev", "worker-1")).unwrap(), "worker-1");
        assert!(matches!(
            find_node_name(&output, &machine("prod", "worker-2")),
            Err(ActuatorError::State(_))
        ));
    }
}
