//! File-backed catalog source

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::catalog::MachineSetupConfigs;
use crate::error::SetupError;

/// Where the catalog is mounted by default
pub const DEFAULT_MACHINE_SETUP_CONFIG_PATH: &str = "/etc/machinesetup/machine_setup_configs.yaml";

/// Source of the current setup catalog
pub trait MachineSetupConfigGetter: Send + Sync {
    fn get_machine_setup_config(&self) -> Result<MachineSetupConfigs, SetupError>;
}

/// Catalog read from a file on every lookup, so edits to a mounted
/// ConfigMap take effect without restarting the controller.
#[derive(Debug, Clone)]
pub struct ConfigWatch {
    path: PathBuf,
}

impl ConfigWatch {
    /// Fails when `path` does not exist
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SetupError> {
        let path = path.as_ref();
        std::fs::metadata(path).map_err(|source| SetupError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MachineSetupConfigGetter for ConfigWatch {
    fn get_machine_setup_config(&self) -> Result<MachineSetupConfigs, SetupError> {
        debug!("Reading machine setup configs from {}", self.path.display());
        let bytes = std::fs::read(&self.path).map_err(|source| SetupError::Io {
            path: self.path.display().to_string(),
            source,
        })?;
        MachineSetupConfigs::load(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const ONE_ENTRY: &str = r#"
items:
  - machineParams:
      roles: [Master]
      versions: { kubelet: 1.10.6, controlPlane: 1.10.6 }
    metadata:
      startupScript: echo v1
"#;

    #[test]
    fn test_missing_file_is_rejected() {
        let err = ConfigWatch::new("/nonexistent/machine_setup_configs.yaml").unwrap_err();
        assert!(matches!(err, SetupError::Io { .. }));
    }

    #[test]
    fn test_each_lookup_rereads_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(ONE_ENTRY.as_bytes()).unwrap();
        file.flush().unwrap();

        let watch = ConfigWatch::new(file.path()).unwrap();
        let first = watch.get_machine_setup_config().unwrap();
        assert_eq!(first.items[0].metadata.startup_script, "echo v1");

        std::fs::write(file.path(), ONE_ENTRY.replace("echo v1", "echo v2")).unwrap();
        let second = watch.get_machine_setup_config().unwrap();
        assert_eq!(second.items[0].metadata.startup_script, "echo v2");
    }

    #[test]
    fn test_broken_file_surfaces_parse_error_on_lookup() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "items: {").unwrap();

        let watch = ConfigWatch::new(file.path()).unwrap();
        assert!(matches!(watch.get_machine_setup_config(), Err(SetupError::Parse(_))));
    }
}
