//! Setup catalog
//!
//! An ordered list of entries, each pairing a role set and version pair with
//! the scripts that provision machines of that shape:
//!
//! ```yaml
//! items:
//!   - machineParams:
//!       roles: [Master]
//!       versions:
//!         kubelet: 1.10.6
//!         controlPlane: 1.10.6
//!     metadata:
//!       startupScript: |
//!         kubeadm init ...
//! ```

use std::collections::BTreeMap;
use std::fmt;

use crds::{MachineRole, MachineVersionInfo};
use serde::{Deserialize, Serialize};

use crate::error::SetupError;

/// Lookup key: role set and desired versions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct MachineParams {
    #[serde(default)]
    pub roles: Vec<MachineRole>,

    #[serde(default)]
    pub versions: MachineVersionInfo,
}

impl MachineParams {
    pub fn new(roles: Vec<MachineRole>, versions: MachineVersionInfo) -> Self {
        Self { roles, versions }
    }

    /// Roles as a multiset: order is ignored, duplicates count
    fn role_counts(&self) -> BTreeMap<MachineRole, usize> {
        let mut counts = BTreeMap::new();
        for role in &self.roles {
            *counts.entry(*role).or_insert(0) += 1;
        }
        counts
    }

    fn matches(&self, other: &MachineParams) -> bool {
        self.versions == other.versions && self.role_counts() == other.role_counts()
    }
}

impl fmt::Display for MachineParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let roles: Vec<String> = self.roles.iter().map(ToString::to_string).collect();
        write!(f, "roles=[{}] {}", roles.join(","), self.versions)
    }
}

/// Scripts and free-form items attached to a catalog entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default)]
    pub startup_script: String,

    #[serde(default)]
    pub shutdown_script: String,

    #[serde(default)]
    pub upgrade_script: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub items: BTreeMap<String, String>,
}

/// One catalog entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MachineSetupItem {
    #[serde(rename = "machineParams")]
    pub params: MachineParams,

    #[serde(default)]
    pub metadata: Metadata,
}

/// The parsed catalog
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct MachineSetupConfigs {
    #[serde(default)]
    pub items: Vec<MachineSetupItem>,
}

impl MachineSetupConfigs {
    /// Parse a catalog from YAML bytes
    pub fn load(source: &[u8]) -> Result<Self, SetupError> {
        serde_yaml::from_slice(source).map_err(SetupError::Parse)
    }

    /// Serialise the catalog back to YAML
    pub fn to_yaml(&self) -> Result<String, SetupError> {
        serde_yaml::to_string(self).map_err(SetupError::Serialize)
    }

    /// Metadata of the single entry matching `params`.
    ///
    /// Zero matches and multiple matches are both errors; an ambiguous
    /// catalog is never resolved by picking one of the candidates.
    pub fn get_metadata(&self, params: &MachineParams) -> Result<&Metadata, SetupError> {
        let mut matching = self.items.iter().filter(|item| item.params.matches(params));

        match (matching.next(), matching.count()) {
            (Some(item), 0) => Ok(&item.metadata),
            (None, _) => Err(SetupError::NotFound {
                params: params.to_string(),
            }),
            (Some(_), rest) => Err(SetupError::Ambiguous {
                params: params.to_string(),
                count: rest + 1,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
items:
  - machineParams:
      roles: [Master]
      versions:
        kubelet: 1.10.6
        controlPlane: 1.10.6
    metadata:
      startupScript: echo master-start
      shutdownScript: echo master-stop
      upgradeScript: echo master-upgrade
  - machineParams:
      roles: [Node]
      versions:
        kubelet: 1.10.6
    metadata:
      startupScript: echo node-start
      items:
        image: ubuntu-16.04
  - machineParams:
      roles: [Master, Etcd]
      versions:
        kubelet: 1.10.6
        controlPlane: 1.10.6
    metadata:
      startupScript: echo master-etcd-start
"#;

    fn versions(kubelet: &str, control_plane: &str) -> MachineVersionInfo {
        MachineVersionInfo {
            kubelet: kubelet.to_string(),
            control_plane: control_plane.to_string(),
        }
    }

    fn catalog() -> MachineSetupConfigs {
        MachineSetupConfigs::load(CATALOG.as_bytes()).unwrap()
    }

    #[test]
    fn test_match_single_entry() {
        let params = MachineParams::new(vec![MachineRole::Master], versions("1.10.6", "1.10.6"));
        let metadata = catalog().get_metadata(&params).unwrap().clone();
        assert_eq!(metadata.startup_script, "echo master-start");
        assert_eq!(metadata.upgrade_script, "echo master-upgrade");
    }

    #[test]
    fn test_match_ignores_role_order() {
        let params = MachineParams::new(
            vec![MachineRole::Etcd, MachineRole::Master],
            versions("1.10.6", "1.10.6"),
        );
        let metadata = catalog().get_metadata(&params).unwrap().clone();
        assert_eq!(metadata.startup_script, "echo master-etcd-start");
    }

    #[test]
    fn test_match_counts_duplicate_roles() {
        let params = MachineParams::new(
            vec![MachineRole::Master, MachineRole::Master],
            versions("1.10.6", "1.10.6"),
        );
        let err = catalog().get_metadata(&params).unwrap_err();
        assert!(matches!(err, SetupError::NotFound { .. }));
    }

    #[test]
    fn test_match_requires_exact_versions() {
        let params = MachineParams::new(vec![MachineRole::Node], versions("1.10.6", "1.10.6"));
        let err = catalog().get_metadata(&params).unwrap_err();
        assert!(matches!(err, SetupError::NotFound { .. }));
        assert!(err.to_string().contains("kubelet=1.10.6"));

        let params = MachineParams::new(vec![MachineRole::Node], versions("1.10.6", ""));
        let metadata = catalog().get_metadata(&params).unwrap().clone();
        assert_eq!(metadata.items.get("image").map(String::as_str), Some("ubuntu-16.04"));
    }

    #[test]
    fn test_identical_entries_are_ambiguous() {
        let yaml = r#"
items:
  - machineParams:
      roles: [Node]
      versions: { kubelet: 1.10.6, controlPlane: 1.10.6 }
    metadata:
      startupScript: echo first
  - machineParams:
      roles: [Node]
      versions: { kubelet: 1.10.6, controlPlane: 1.10.6 }
    metadata:
      startupScript: echo second
"#;
        let catalog = MachineSetupConfigs::load(yaml.as_bytes()).unwrap();
        let params = MachineParams::new(vec![MachineRole::Node], versions("1.10.6", "1.10.6"));

        let err = catalog.get_metadata(&params).unwrap_err();
        assert!(matches!(err, SetupError::Ambiguous { count: 2, .. }));
        assert!(err.is_match_error());
        assert!(err.to_string().contains("roles=[Node]"));
    }

    #[test]
    fn test_malformed_yaml_is_a_parse_error() {
        let err = MachineSetupConfigs::load(b"items: [ {machineParams: ").unwrap_err();
        assert!(matches!(err, SetupError::Parse(_)));

        let err = MachineSetupConfigs::load(b"items:\n  - machineParams:\n      roles: [Wizard]\n").unwrap_err();
        assert!(matches!(err, SetupError::Parse(_)));
    }

    #[test]
    fn test_to_yaml_can_be_reloaded() {
        let original = catalog();
        let reloaded = MachineSetupConfigs::load(original.to_yaml().unwrap().as_bytes()).unwrap();
        assert_eq!(reloaded, original);
    }
}
