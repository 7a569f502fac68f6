//! Cluster CRD
//!
//! Cluster API `Cluster` (`cluster.k8s.io/v1alpha1`). The cluster controller
//! owns this object; the machine actuator only writes `status.apiEndpoints`.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::machine::ProviderConfig;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "cluster.k8s.io",
    version = "v1alpha1",
    kind = "Cluster",
    namespaced,
    status = "ClusterStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Cluster network configuration
    #[serde(default)]
    pub cluster_network: ClusterNetworkingConfig,

    /// Provider-specific cluster configuration
    #[serde(default)]
    pub provider_config: ProviderConfig,
}

/// Network ranges shared by every machine of the cluster
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNetworkingConfig {
    /// Service network range
    #[serde(default)]
    pub services: NetworkRanges,

    /// Pod network range
    #[serde(default)]
    pub pods: NetworkRanges,

    /// Service DNS domain (e.g. "cluster.local")
    #[serde(default)]
    pub service_domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRanges {
    /// CIDR blocks, only the first one is used for provisioning
    #[serde(default)]
    pub cidr_blocks: Vec<String>,
}

impl NetworkRanges {
    /// First CIDR block, or an empty string when none is configured
    pub fn first_block(&self) -> &str {
        self.cidr_blocks.first().map(String::as_str).unwrap_or_default()
    }
}

/// Published API server endpoint
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiEndpoint {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for ApiEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// API endpoints, empty until the first master finishes provisioning
    #[serde(default)]
    pub api_endpoints: Vec<ApiEndpoint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Provider-specific status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_status: Option<serde_json::Value>,
}

impl Cluster {
    /// Published API endpoints (empty when the status is missing)
    pub fn api_endpoints(&self) -> &[ApiEndpoint] {
        self.status
            .as_ref()
            .map(|s| s.api_endpoints.as_slice())
            .unwrap_or_default()
    }
}
