//! Controller configuration read from the environment at start-up.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use machine_actuator::{ActuatorOptions, ScriptDelivery, UpdateStrategy};
use machine_setup::DEFAULT_MACHINE_SETUP_CONFIG_PATH;
use ssh_client::DEFAULT_SSH_TIMEOUT;

use crate::error::ControllerError;

const DEFAULT_STAGING_DIR: &str = "/tmp";
const DEFAULT_REQUEUE_INTERVAL: Duration = Duration::from_secs(600);

/// Settings of one controller process
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Setup catalog file, must exist at start-up
    pub machine_setup_config_path: String,
    /// Namespace to watch, `None` for all namespaces
    pub namespace: Option<String>,
    pub ssh_timeout: Duration,
    pub actuator: ActuatorOptions,
    /// Interval between reconciles of a healthy machine
    pub requeue_interval: Duration,
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let machine_setup_config_path = var("MACHINE_SETUP_CONFIG_PATH")
            .unwrap_or_else(|| DEFAULT_MACHINE_SETUP_CONFIG_PATH.to_string());
        let namespace = var("WATCH_NAMESPACE");

        let ssh_timeout = match var("SSH_TIMEOUT_SECONDS") {
            Some(value) => Duration::from_secs(parse_seconds("SSH_TIMEOUT_SECONDS", &value)?),
            None => DEFAULT_SSH_TIMEOUT,
        };
        let requeue_interval = match var("REQUEUE_INTERVAL_SECONDS") {
            Some(value) => Duration::from_secs(parse_seconds("REQUEUE_INTERVAL_SECONDS", &value)?),
            None => DEFAULT_REQUEUE_INTERVAL,
        };

        let update_strategy = match var("UPDATE_STRATEGY") {
            Some(value) => UpdateStrategy::from_str(value.trim()).map_err(ControllerError::InvalidConfig)?,
            None => UpdateStrategy::default(),
        };

        let script_delivery = match var("SCRIPT_DELIVERY").as_deref().map(str::trim) {
            None | Some("inline") => ScriptDelivery::Inline,
            Some("staged") => ScriptDelivery::Staged {
                dir: var("SCRIPT_STAGING_DIR").unwrap_or_else(|| DEFAULT_STAGING_DIR.to_string()),
            },
            Some(other) => {
                return Err(ControllerError::InvalidConfig(format!(
                    "SCRIPT_DELIVERY must be \"inline\" or \"staged\", got {other:?}"
                )));
            }
        };

        let api_server_port = match var("API_SERVER_PORT") {
            Some(value) => value.trim().parse::<u16>().ok().filter(|port| *port != 0).ok_or_else(|| {
                ControllerError::InvalidConfig(format!("API_SERVER_PORT must be a port number, got {value:?}"))
            })?,
            None => ActuatorOptions::default().api_server_port,
        };

        Ok(Self {
            machine_setup_config_path,
            namespace,
            ssh_timeout,
            actuator: ActuatorOptions {
                update_strategy,
                script_delivery,
                api_server_port,
            },
            requeue_interval,
        })
    }
}

fn parse_seconds(key: &str, value: &str) -> Result<u64, ControllerError> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|secs| *secs > 0)
        .ok_or_else(|| ControllerError::InvalidConfig(format!("{key} must be a positive number of seconds, got {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<ControllerConfig, ControllerError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        ControllerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.machine_setup_config_path, DEFAULT_MACHINE_SETUP_CONFIG_PATH);
        assert!(config.namespace.is_none());
        assert_eq!(config.ssh_timeout, Duration::from_secs(600));
        assert_eq!(config.requeue_interval, Duration::from_secs(600));
        assert_eq!(config.actuator.update_strategy, UpdateStrategy::InPlace);
        assert_eq!(config.actuator.script_delivery, ScriptDelivery::Inline);
        assert_eq!(config.actuator.api_server_port, 443);
    }

    #[test]
    fn test_overrides() {
        let config = config(&[
            ("MACHINE_SETUP_CONFIG_PATH", "/config/catalog.yaml"),
            ("WATCH_NAMESPACE", "clusters"),
            ("SSH_TIMEOUT_SECONDS", "30"),
            ("UPDATE_STRATEGY", "recreate"),
            ("SCRIPT_DELIVERY", "staged"),
            ("SCRIPT_STAGING_DIR", "/var/lib/provision"),
            ("API_SERVER_PORT", "6443"),
            ("REQUEUE_INTERVAL_SECONDS", "120"),
        ])
        .unwrap();

        assert_eq!(config.machine_setup_config_path, "/config/catalog.yaml");
        assert_eq!(config.namespace.as_deref(), Some("clusters"));
        assert_eq!(config.ssh_timeout, Duration::from_secs(30));
        assert_eq!(config.actuator.update_strategy, UpdateStrategy::Recreate);
        assert_eq!(
            config.actuator.script_delivery,
            ScriptDelivery::Staged {
                dir: "/var/lib/provision".to_string()
            }
        );
        assert_eq!(config.actuator.api_server_port, 6443);
        assert_eq!(config.requeue_interval, Duration::from_secs(120));
    }

    #[test]
    fn test_empty_namespace_means_all() {
        assert!(config(&[("WATCH_NAMESPACE", "")]).unwrap().namespace.is_none());
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        for vars in [
            [("SSH_TIMEOUT_SECONDS", "ten")],
            [("SSH_TIMEOUT_SECONDS", "0")],
            [("UPDATE_STRATEGY", "rolling")],
            [("SCRIPT_DELIVERY", "carrier-pigeon")],
            [("API_SERVER_PORT", "70000")],
        ] {
            let err = config(&vars).unwrap_err();
            assert!(matches!(err, ControllerError::InvalidConfig(_)), "{vars:?} accepted");
        }
    }
}
