//! Script rendering
//!
//! Every script handed to a host is an environment preamble describing the
//! machine and its cluster, followed by the catalog script body. Masters and
//! workers get different preambles: a worker needs the master endpoint and a
//! join token, a master needs its own address.

use crds::{Cluster, Machine, SshMachineProviderConfig};
use minijinja::{context, Environment, UndefinedBehavior};
use tracing::debug;

use crate::catalog::Metadata;
use crate::error::SetupError;

const MASTER_ENVIRONMENT: &str = r#"#!/usr/bin/env bash
CONTROL_PLANE_VERSION={{ control_plane_version | shell_quote }}
KUBELET_VERSION={{ kubelet_version | shell_quote }}
VERSION=v${KUBELET_VERSION}
NAMESPACE={{ namespace | shell_quote }}
MACHINE_NAME={{ machine_name | shell_quote }}
MACHINE=$NAMESPACE
MACHINE+="/"
MACHINE+=$MACHINE_NAME
CLUSTER_DNS_DOMAIN={{ service_domain | shell_quote }}
POD_CIDR={{ pod_cidr | shell_quote }}
SERVICE_CIDR={{ service_cidr | shell_quote }}
MASTER_IP={{ master_ip | shell_quote }}
NODE_LABELS={{ node_labels | shell_quote }}
"#;

const NODE_ENVIRONMENT: &str = r#"#!/usr/bin/env bash
KUBELET_VERSION={{ kubelet_version | shell_quote }}
TOKEN={{ token | shell_quote }}
MASTER={{ master_endpoint | shell_quote }}
NAMESPACE={{ namespace | shell_quote }}
MACHINE_NAME={{ machine_name | shell_quote }}
MACHINE=$NAMESPACE
MACHINE+="/"
MACHINE+=$MACHINE_NAME
CLUSTER_DNS_DOMAIN={{ service_domain | shell_quote }}
POD_CIDR={{ pod_cidr | shell_quote }}
SERVICE_CIDR={{ service_cidr | shell_quote }}
NODE_LABELS={{ node_labels | shell_quote }}
"#;

/// Inputs for one rendering pass
#[derive(Debug, Clone, Copy)]
pub struct RenderParams<'a> {
    pub cluster: &'a Cluster,
    pub machine: &'a Machine,
    pub provider_config: &'a SshMachineProviderConfig,
    pub metadata: &'a Metadata,
    /// Join token for workers; `None` while deleting
    pub token: Option<&'a str>,
}

/// Scripts ready to run on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedScripts {
    pub startup: String,
    pub shutdown: String,
    pub upgrade: String,
}

/// Renders machine scripts from catalog metadata
#[derive(Debug)]
pub struct ScriptRenderer {
    env: Environment<'static>,
}

impl Default for ScriptRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptRenderer {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        // The preamble's last newline separates it from the script body
        env.set_keep_trailing_newline(true);
        env.add_filter("shell_quote", shell_quote);
        Self { env }
    }

    /// Render startup, shutdown and upgrade scripts.
    ///
    /// Role sets containing Master get the master preamble; everything else
    /// joins an existing control plane and fails with
    /// [`SetupError::EndpointNotReady`] until the cluster publishes an
    /// API endpoint.
    pub fn render(&self, params: RenderParams<'_>) -> Result<RenderedScripts, SetupError> {
        let preamble = if params.provider_config.is_master() {
            self.master_preamble(&params)?
        } else {
            self.node_preamble(&params)?
        };
        debug!(
            "Rendered {} preamble for machine {}",
            if params.provider_config.is_master() { "master" } else { "node" },
            params.machine.key()
        );

        Ok(RenderedScripts {
            startup: format!("{}{}", preamble, params.metadata.startup_script),
            shutdown: format!("{}{}", preamble, params.metadata.shutdown_script),
            upgrade: format!("{}{}", preamble, params.metadata.upgrade_script),
        })
    }

    fn master_preamble(&self, params: &RenderParams<'_>) -> Result<String, SetupError> {
        let machine = params.machine;
        let network = &params.cluster.spec.cluster_network;
        let ctx = context! {
            control_plane_version => &machine.spec.versions.control_plane,
            kubelet_version => &machine.spec.versions.kubelet,
            namespace => machine.namespace_or_default(),
            machine_name => machine.name(),
            service_domain => &network.service_domain,
            pod_cidr => network.pods.first_block(),
            service_cidr => network.services.first_block(),
            master_ip => &params.provider_config.ssh_config.host,
            node_labels => node_labels(machine),
        };
        Ok(self.env.render_str(MASTER_ENVIRONMENT, ctx)?)
    }

    fn node_preamble(&self, params: &RenderParams<'_>) -> Result<String, SetupError> {
        let cluster = params.cluster;
        let endpoint = cluster
            .api_endpoints()
            .first()
            .ok_or_else(|| SetupError::EndpointNotReady {
                cluster: cluster.metadata.name.clone().unwrap_or_default(),
            })?;

        let machine = params.machine;
        let network = &cluster.spec.cluster_network;
        let ctx = context! {
            kubelet_version => &machine.spec.versions.kubelet,
            token => params.token.unwrap_or_default(),
            master_endpoint => endpoint.to_string(),
            namespace => machine.namespace_or_default(),
            machine_name => machine.name(),
            service_domain => &network.service_domain,
            pod_cidr => network.pods.first_block(),
            service_cidr => network.services.first_block(),
            node_labels => node_labels(machine),
        };
        Ok(self.env.render_str(NODE_ENVIRONMENT, ctx)?)
    }
}

/// Quote `value` as a single bash word. Values made only of characters
/// bash treats literally are left bare.
fn shell_quote(value: &str) -> String {
    let is_plain = |c: char| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c);
    if !value.is_empty() && value.chars().all(is_plain) {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r#"'"'"'"#))
}

/// Machine labels as space separated `key=value` pairs.
///
/// The machines are not registered in the managed cluster, so the
/// bootstrap scripts apply these labels to the node themselves.
fn node_labels(machine: &Machine) -> String {
    machine
        .metadata
        .labels
        .iter()
        .flatten()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(" ")
}
