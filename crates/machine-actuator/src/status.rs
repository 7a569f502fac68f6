//! Provisioning status persisted on the Machine
//!
//! The actuator keeps no database. What it knows about a host is encoded as
//! JSON into the `instance-status` annotation of the Machine, and the
//! node's state is recomputed from that annotation on every call.

use chrono::{DateTime, Utc};
use crds::{Machine, MachineRole, MachineVersionInfo, SshMachineProviderConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Annotation holding the encoded [`InstanceStatus`]
pub const INSTANCE_STATUS_ANNOTATION: &str = "instance-status";

/// Annotation echoing the machine name once provisioned
pub const MACHINE_NAME_ANNOTATION: &str = "machine-name";

/// Current schema version of [`InstanceStatus`]
pub const INSTANCE_STATUS_VERSION: u32 = 1;

/// Reason reported for a status annotation that cannot be decoded
pub const INVALID_INSTANCE_STATUS_REASON: &str = "InvalidInstanceStatus";

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("failed to encode instance status: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode instance status: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("unsupported instance status version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InstanceState {
    Provisioned,
}

/// What the actuator last did to a host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub version: u32,
    pub state: InstanceState,
    pub roles: Vec<MachineRole>,
    pub versions: MachineVersionInfo,
    pub host: String,
    pub port: u16,
    pub provisioned_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl InstanceStatus {
    /// Status of a host that just ran its startup script
    pub fn provisioned(config: &SshMachineProviderConfig, versions: &MachineVersionInfo, now: DateTime<Utc>) -> Self {
        Self {
            version: INSTANCE_STATUS_VERSION,
            state: InstanceState::Provisioned,
            roles: config.roles.clone(),
            versions: versions.clone(),
            host: config.ssh_config.host.clone(),
            port: config.ssh_config.port,
            provisioned_at: now,
            updated_at: None,
        }
    }

    /// Same host, upgraded to `versions`
    pub fn upgraded(&self, versions: &MachineVersionInfo, now: DateTime<Utc>) -> Self {
        Self {
            versions: versions.clone(),
            updated_at: Some(now),
            ..self.clone()
        }
    }

    pub fn encode(&self) -> Result<String, StatusError> {
        serde_json::to_string(self).map_err(StatusError::Encode)
    }

    pub fn decode(blob: &str) -> Result<Self, StatusError> {
        let status: Self = serde_json::from_str(blob).map_err(StatusError::Decode)?;
        if status.version != INSTANCE_STATUS_VERSION {
            return Err(StatusError::UnsupportedVersion {
                found: status.version,
                expected: INSTANCE_STATUS_VERSION,
            });
        }
        Ok(status)
    }
}

/// Node state derived from a Machine record. Never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeState {
    Unprovisioned,
    Provisioned(InstanceStatus),
    Error { reason: String, message: String },
}

impl NodeState {
    pub fn of(machine: Option<&Machine>) -> Self {
        let Some(machine) = machine else {
            return NodeState::Unprovisioned;
        };

        if let Some(blob) = machine.annotation(INSTANCE_STATUS_ANNOTATION) {
            return match InstanceStatus::decode(blob) {
                Ok(status) => NodeState::Provisioned(status),
                Err(e) => NodeState::Error {
                    reason: INVALID_INSTANCE_STATUS_REASON.to_string(),
                    message: e.to_string(),
                },
            };
        }

        match machine.error() {
            Some((reason, message)) => NodeState::Error {
                reason: reason.to_string(),
                message: message.to_string(),
            },
            None => NodeState::Unprovisioned,
        }
    }

    pub fn is_provisioned(&self) -> bool {
        matches!(self, NodeState::Provisioned(_))
    }

    /// The annotation exists but cannot be decoded
    pub fn is_corrupt(&self) -> bool {
        matches!(self, NodeState::Error { reason, .. } if reason == INVALID_INSTANCE_STATUS_REASON)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::{MachineSpec, MachineStatus, SshConfig};
    use std::collections::BTreeMap;

    fn config() -> SshMachineProviderConfig {
        SshMachineProviderConfig {
            api_version: None,
            kind: None,
            roles: vec![MachineRole::Master, MachineRole::Etcd],
            provisioned_machine_name: None,
            ssh_config: SshConfig {
                username: "root".to_string(),
                host: "10.0.0.5".to_string(),
                port: 2222,
                public_keys: vec![],
                secret_name: "ssh".to_string(),
            },
        }
    }

    fn versions(kubelet: &str) -> MachineVersionInfo {
        MachineVersionInfo {
            kubelet: kubelet.to_string(),
            control_plane: "1.10.6".to_string(),
        }
    }

    fn annotated(blob: &str) -> Machine {
        let mut machine = Machine::new("m", MachineSpec::default());
        machine.metadata.annotations = Some(BTreeMap::from([(
            INSTANCE_STATUS_ANNOTATION.to_string(),
            blob.to_string(),
        )]));
        machine
    }

    #[test]
    fn test_status_survives_encoding() {
        let provisioned = InstanceStatus::provisioned(&config(), &versions("1.10.5"), Utc::now());
        let upgraded = provisioned.upgraded(&versions("1.10.6"), Utc::now());

        for status in [provisioned, upgraded] {
            assert_eq!(InstanceStatus::decode(&status.encode().unwrap()).unwrap(), status);
        }
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let mut status = InstanceStatus::provisioned(&config(), &versions("1.10.6"), Utc::now());
        status.version = 7;
        let err = InstanceStatus::decode(&status.encode().unwrap()).unwrap_err();
        assert!(matches!(err, StatusError::UnsupportedVersion { found: 7, .. }));
    }

    #[test]
    fn test_node_state_of_missing_or_plain_record() {
        assert_eq!(NodeState::of(None), NodeState::Unprovisioned);
        let machine = Machine::new("m", MachineSpec::default());
        assert_eq!(NodeState::of(Some(&machine)), NodeState::Unprovisioned);
    }

    #[test]
    fn test_node_state_of_provisioned_record() {
        let status = InstanceStatus::provisioned(&config(), &versions("1.10.6"), Utc::now());
        let machine = annotated(&status.encode().unwrap());
        assert_eq!(NodeState::of(Some(&machine)), NodeState::Provisioned(status));
    }

    #[test]
    fn test_node_state_of_garbage_annotation() {
        let state = NodeState::of(Some(&annotated("{not json")));
        assert!(state.is_corrupt());
        assert!(!state.is_provisioned());
    }

    #[test]
    fn test_node_state_of_recorded_error() {
        let mut machine = Machine::new("m", MachineSpec::default());
        machine.status = Some(MachineStatus {
            error_reason: Some("InvalidConfiguration".to_string()),
            error_message: Some("missing kubelet".to_string()),
            ..Default::default()
        });

        let state = NodeState::of(Some(&machine));
        assert_eq!(
            state,
            NodeState::Error {
                reason: "InvalidConfiguration".to_string(),
                message: "missing kubelet".to_string(),
            }
        );
        assert!(!state.is_corrupt());
    }
}
