//! SSH provider configuration
//!
//! Types carried inside `Machine.spec.providerConfig.value` and the codec that
//! decodes them. A malformed or missing value is reported as a
//! [`ProviderConfigError`] so the actuator can record it on the Machine.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::machine::{Machine, ProviderConfig};

/// API version expected in the provider config (optional on input)
pub const PROVIDER_CONFIG_API_VERSION: &str = "sshproviderconfig/v1alpha1";

/// Kind expected in the provider config (optional on input)
pub const PROVIDER_CONFIG_KIND: &str = "SSHMachineProviderConfig";

/// Errors decoding a provider config
#[derive(Debug, Error)]
pub enum ProviderConfigError {
    /// `providerConfig.value` is absent
    #[error("providerConfig.value is missing")]
    Missing,

    /// The value does not match the expected schema
    #[error("invalid provider config: {0}")]
    Invalid(#[from] serde_json::Error),

    /// The value names a kind this provider does not understand
    #[error("unexpected provider config kind {found:?}, expected {expected:?}")]
    UnexpectedKind { found: String, expected: &'static str },
}

/// Purpose of a machine within the cluster. A machine may hold several roles.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MachineRole {
    Master,
    Node,
    Etcd,
}

impl std::fmt::Display for MachineRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MachineRole::Master => "Master",
            MachineRole::Node => "Node",
            MachineRole::Etcd => "Etcd",
        };
        f.write_str(name)
    }
}

/// Everything needed to open a shell on the host
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    /// User to authenticate as
    pub username: String,

    /// IP or hostname of the machine
    pub host: String,

    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Public keys of the machine (informational)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub public_keys: Vec<String>,

    /// Secret holding `private-key` and `pass-phrase`
    pub secret_name: String,
}

fn default_ssh_port() -> u16 {
    22
}

/// Provider-specific machine configuration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SshMachineProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,

    /// Roles of this machine
    #[serde(default)]
    pub roles: Vec<MachineRole>,

    /// Binding reference to a pre-provisioned host record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioned_machine_name: Option<String>,

    /// SSH access to the host
    pub ssh_config: SshConfig,
}

impl SshMachineProviderConfig {
    /// Decode from a raw provider config
    pub fn decode(provider_config: &ProviderConfig) -> Result<Self, ProviderConfigError> {
        let value = provider_config
            .value
            .as_ref()
            .ok_or(ProviderConfigError::Missing)?;
        let config: Self = serde_json::from_value(value.clone())?;

        if let Some(kind) = &config.kind {
            if kind != PROVIDER_CONFIG_KIND {
                return Err(ProviderConfigError::UnexpectedKind {
                    found: kind.clone(),
                    expected: PROVIDER_CONFIG_KIND,
                });
            }
        }

        Ok(config)
    }

    /// Encode into a raw provider config
    pub fn encode(&self) -> Result<ProviderConfig, ProviderConfigError> {
        Ok(ProviderConfig {
            value: Some(serde_json::to_value(self)?),
        })
    }

    pub fn is_master(&self) -> bool {
        self.roles.contains(&MachineRole::Master)
    }

    pub fn is_node(&self) -> bool {
        self.roles.contains(&MachineRole::Node)
    }

    pub fn is_etcd(&self) -> bool {
        self.roles.contains(&MachineRole::Etcd)
    }
}

impl Machine {
    /// Decode this machine's SSH provider config
    pub fn ssh_provider_config(&self) -> Result<SshMachineProviderConfig, ProviderConfigError> {
        SshMachineProviderConfig::decode(&self.spec.provider_config)
    }
}
