//! Access to Machine and Cluster records
//!
//! Writes that depend on what was read carry the record's
//! `resourceVersion`, so a stale writer gets [`StoreError::Conflict`]
//! instead of silently overwriting a concurrent change.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use crds::{ApiEndpoint, Cluster, Machine, MachineVersionInfo};
use kube::api::{ListParams, Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The record changed since it was read
    #[error("{kind} {name} was modified concurrently")]
    Conflict { kind: &'static str, name: String },

    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    /// Machine has no cluster label and its namespace does not hold exactly one cluster
    #[error("cannot determine the cluster of machine {machine}: {found} clusters in namespace")]
    ClusterUnresolved { machine: String, found: usize },

    /// Secret exists but lacks a required key
    #[error("secret {name} has no usable {key:?} entry")]
    InvalidSecret { name: String, key: &'static str },
}

impl StoreError {
    pub(crate) fn from_kube(kind: &'static str, name: &str, error: kube::Error) -> Self {
        match error {
            kube::Error::Api(ae) if ae.code == 409 => StoreError::Conflict {
                kind,
                name: name.to_string(),
            },
            kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound {
                kind,
                name: name.to_string(),
            },
            e => StoreError::Kube(e),
        }
    }
}

/// Change to a Machine's status subresource.
///
/// The error fields are always written, so a success clears any previously
/// recorded failure. Versions are only written when set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineStatusPatch {
    pub error_reason: Option<String>,
    pub error_message: Option<String>,
    pub versions: Option<MachineVersionInfo>,
    pub last_updated: DateTime<Utc>,
}

impl MachineStatusPatch {
    pub fn failed(reason: &str, message: &str, now: DateTime<Utc>) -> Self {
        Self {
            error_reason: Some(reason.to_string()),
            error_message: Some(message.to_string()),
            versions: None,
            last_updated: now,
        }
    }

    pub fn succeeded(versions: &MachineVersionInfo, now: DateTime<Utc>) -> Self {
        Self {
            error_reason: None,
            error_message: None,
            versions: Some(versions.clone()),
            last_updated: now,
        }
    }

    /// JSON merge patch body; `null` removes a field
    pub fn to_merge_patch(&self) -> serde_json::Value {
        let mut status = json!({
            "errorReason": self.error_reason,
            "errorMessage": self.error_message,
            "lastUpdated": self.last_updated,
        });
        if let Some(versions) = &self.versions {
            status["versions"] = json!(versions);
        }
        json!({ "status": status })
    }
}

/// Machine and Cluster records
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>, StoreError>;

    async fn list_machines(&self, namespace: &str) -> Result<Vec<Machine>, StoreError>;

    /// Set (`Some`) or remove (`None`) annotations, conditional on the
    /// machine's resourceVersion. Returns the updated record.
    async fn patch_machine_annotations(
        &self,
        machine: &Machine,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<Machine, StoreError>;

    async fn patch_machine_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &MachineStatusPatch,
    ) -> Result<(), StoreError>;

    /// Replace the finalizer list, conditional on the machine's resourceVersion
    async fn set_machine_finalizers(&self, machine: &Machine, finalizers: Vec<String>) -> Result<(), StoreError>;

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, StoreError>;

    async fn list_clusters(&self, namespace: &str) -> Result<Vec<Cluster>, StoreError>;

    /// Publish the API endpoint, conditional on the cluster's resourceVersion
    async fn publish_api_endpoint(&self, cluster: &Cluster, endpoint: ApiEndpoint) -> Result<(), StoreError>;

    /// Cluster owning `machine`: the labelled cluster, or the only cluster
    /// in the machine's namespace when the label is absent.
    async fn cluster_for_machine(&self, machine: &Machine) -> Result<Cluster, StoreError> {
        let namespace = machine.namespace_or_default();
        if let Some(name) = machine.cluster_name() {
            return self
                .get_cluster(namespace, name)
                .await?
                .ok_or_else(|| StoreError::NotFound {
                    kind: "Cluster",
                    name: format!("{namespace}/{name}"),
                });
        }

        let mut clusters = self.list_clusters(namespace).await?;
        match clusters.len() {
            1 => Ok(clusters.remove(0)),
            found => Err(StoreError::ClusterUnresolved {
                machine: machine.key(),
                found,
            }),
        }
    }
}

/// [`ObjectStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn machines(&self, namespace: &str) -> Api<Machine> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn clusters(&self, namespace: &str) -> Api<Cluster> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl ObjectStore for KubeObjectStore {
    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<Machine>, StoreError> {
        Ok(self.machines(namespace).get_opt(name).await?)
    }

    async fn list_machines(&self, namespace: &str) -> Result<Vec<Machine>, StoreError> {
        Ok(self.machines(namespace).list(&ListParams::default()).await?.items)
    }

    async fn patch_machine_annotations(
        &self,
        machine: &Machine,
        annotations: BTreeMap<String, Option<String>>,
    ) -> Result<Machine, StoreError> {
        let name = machine.name();
        let patch = json!({
            "metadata": {
                "resourceVersion": machine.metadata.resource_version,
                "annotations": annotations,
            }
        });
        debug!("Patching annotations of machine {}", machine.key());

        self.machines(machine.namespace_or_default())
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube("Machine", name, e))
    }

    async fn patch_machine_status(
        &self,
        namespace: &str,
        name: &str,
        patch: &MachineStatusPatch,
    ) -> Result<(), StoreError> {
        self.machines(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch.to_merge_patch()))
            .await
            .map_err(|e| StoreError::from_kube("Machine", name, e))?;
        Ok(())
    }

    async fn set_machine_finalizers(&self, machine: &Machine, finalizers: Vec<String>) -> Result<(), StoreError> {
        let name = machine.name();
        let patch = json!({
            "metadata": {
                "resourceVersion": machine.metadata.resource_version,
                "finalizers": finalizers,
            }
        });

        self.machines(machine.namespace_or_default())
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube("Machine", name, e))?;
        Ok(())
    }

    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<Cluster>, StoreError> {
        Ok(self.clusters(namespace).get_opt(name).await?)
    }

    async fn list_clusters(&self, namespace: &str) -> Result<Vec<Cluster>, StoreError> {
        Ok(self.clusters(namespace).list(&ListParams::default()).await?.items)
    }

    async fn publish_api_endpoint(&self, cluster: &Cluster, endpoint: ApiEndpoint) -> Result<(), StoreError> {
        let name = cluster.metadata.name.as_deref().unwrap_or_default();
        let namespace = cluster.metadata.namespace.as_deref().unwrap_or("default");
        let patch = json!({
            "metadata": { "resourceVersion": cluster.metadata.resource_version },
            "status": { "apiEndpoints": [endpoint] }
        });

        self.clusters(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube("Cluster", name, e))?;
        Ok(())
    }
}
