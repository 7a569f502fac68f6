//! Machine CRD
//!
//! Cluster API `Machine` (`cluster.k8s.io/v1alpha1`). The provider-specific
//! part of `MachineSpec` is carried as raw JSON in `providerConfig.value` and
//! decoded on demand (see [`crate::provider_config`]).

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label binding a Machine to its owning Cluster
pub const CLUSTER_NAME_LABEL: &str = "cluster.k8s.io/cluster-name";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "cluster.k8s.io",
    version = "v1alpha1",
    kind = "Machine",
    namespaced,
    status = "MachineStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Provider-specific machine configuration
    #[serde(default)]
    pub provider_config: ProviderConfig,

    /// Desired software versions
    #[serde(default)]
    pub versions: MachineVersionInfo,
}

/// Opaque provider configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Inline provider configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

/// Desired (or observed) versions of the node agent and control plane
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct MachineVersionInfo {
    /// Node agent (kubelet) version, e.g. "1.10.6"
    #[serde(default, alias = "agentVersion")]
    pub kubelet: String,

    /// Control plane version, only meaningful on masters
    #[serde(default, alias = "controlPlaneVersion")]
    pub control_plane: String,
}

impl std::fmt::Display for MachineVersionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "kubelet={} controlPlane={}", self.kubelet, self.control_plane)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Terse, machine-interpretable failure reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,

    /// Human readable failure description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<chrono::DateTime<chrono::Utc>>,

    /// Versions last reported for this machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub versions: Option<MachineVersionInfo>,
}

impl Machine {
    /// Namespace of the machine, "default" when unset
    pub fn namespace_or_default(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or("default")
    }

    /// Name of the machine, empty when unset
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// `namespace/name` key used in logs and node annotations
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace_or_default(), self.name())
    }

    /// Value of an annotation, if present
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// Name of the owning cluster from the cluster label
    pub fn cluster_name(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(CLUSTER_NAME_LABEL))
            .map(String::as_str)
    }

    /// Recorded error reason and message, if any
    pub fn error(&self) -> Option<(&str, &str)> {
        let status = self.status.as_ref()?;
        let reason = status.error_reason.as_deref()?;
        Some((reason, status.error_message.as_deref().unwrap_or_default()))
    }
}
