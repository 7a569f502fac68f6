//! SSH credentials and kubeconfig secrets

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use ssh_client::SshCredential;
use tracing::info;

use crate::store::StoreError;

/// Secret key holding the PEM/OpenSSH private key
pub const PRIVATE_KEY_KEY: &str = "private-key";

/// Secret key holding the private key passphrase (may be empty or absent)
pub const PASSPHRASE_KEY: &str = "pass-phrase";

/// Secret key holding the kubeconfig
pub const KUBECONFIG_KEY: &str = "value";

const FIELD_MANAGER: &str = "ssh-machine-controller";

/// Name of the secret a cluster's admin kubeconfig is stored in
pub fn kubeconfig_secret_name(cluster_name: &str) -> String {
    format!("{cluster_name}-kubeconfig")
}

#[async_trait::async_trait]
pub trait SecretStore: Send + Sync {
    /// Private key and passphrase from the named secret
    async fn get_ssh_credential(&self, namespace: &str, secret_name: &str) -> Result<SshCredential, StoreError>;

    /// Create or replace the cluster's kubeconfig secret
    async fn save_kubeconfig(&self, namespace: &str, cluster_name: &str, kubeconfig: &str) -> Result<(), StoreError>;
}

/// [`SecretStore`] backed by Kubernetes secrets
#[derive(Clone)]
pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn decode_entry(secret: &Secret, name: &str, key: &'static str) -> Result<Option<String>, StoreError> {
    let Some(ByteString(bytes)) = secret.data.as_ref().and_then(|d| d.get(key)) else {
        return Ok(None);
    };
    String::from_utf8(bytes.clone())
        .map(Some)
        .map_err(|_| StoreError::InvalidSecret {
            name: name.to_string(),
            key,
        })
}

#[async_trait::async_trait]
impl SecretStore for KubeSecretStore {
    async fn get_ssh_credential(&self, namespace: &str, secret_name: &str) -> Result<SshCredential, StoreError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api
            .get_opt(secret_name)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                kind: "Secret",
                name: format!("{namespace}/{secret_name}"),
            })?;

        let private_key = decode_entry(&secret, secret_name, PRIVATE_KEY_KEY)?
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| StoreError::InvalidSecret {
                name: secret_name.to_string(),
                key: PRIVATE_KEY_KEY,
            })?;
        let passphrase = decode_entry(&secret, secret_name, PASSPHRASE_KEY)?.unwrap_or_default();

        Ok(SshCredential::new(private_key, passphrase))
    }

    async fn save_kubeconfig(&self, namespace: &str, cluster_name: &str, kubeconfig: &str) -> Result<(), StoreError> {
        let name = kubeconfig_secret_name(cluster_name);
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(BTreeMap::from([(
                KUBECONFIG_KEY.to_string(),
                ByteString(kubeconfig.as_bytes().to_vec()),
            )])),
            ..Default::default()
        };

        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.patch(&name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&secret))
            .await
            .map_err(|e| StoreError::from_kube("Secret", &name, e))?;
        info!("Saved kubeconfig for cluster {} to secret {}/{}", cluster_name, namespace, name);
        Ok(())
    }
}
