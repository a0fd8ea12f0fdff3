//! Credential packaging and delivery
//!
//! Delivery is not assumed to be idempotent on the endpoint side: a failed
//! upload is reported and the whole pass is retried later with fresh
//! credentials.

mod archive;
mod endpoint;

pub use archive::{build_archive, CredentialArchive, CERT_ENTRY, KEY_ENTRY, SCRIPT_ENTRY};
pub use endpoint::{
    HttpProvisioningEndpoint, ProvisioningEndpoint, ProvisioningUpload, FILE_FIELD,
    REFERENCE_STATE_FIELD, UUID_FIELD,
};
#[cfg(test)]
pub use endpoint::MockProvisioningEndpoint;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::info;

use crate::identity::NodeIdentity;
use crate::Error;

/// Delivers issued credentials to a node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Package and upload the credentials with the node's reference state
    async fn deliver(
        &self,
        node: &NodeIdentity,
        private_key_pem: &str,
        certificate_pem: &str,
    ) -> Result<(), Error>;
}

/// Provisioner uploading a zip archive to a [`ProvisioningEndpoint`]
pub struct CredentialProvisioner {
    endpoint: Arc<dyn ProvisioningEndpoint>,
    script: Arc<[u8]>,
}

impl CredentialProvisioner {
    /// Create a provisioner packaging the given bootstrap script
    pub fn new(endpoint: Arc<dyn ProvisioningEndpoint>, script: impl Into<Arc<[u8]>>) -> Self {
        Self {
            endpoint,
            script: script.into(),
        }
    }

    /// Create a provisioner, reading the bootstrap script from disk once
    pub fn with_script_file(
        endpoint: Arc<dyn ProvisioningEndpoint>,
        script_path: &Path,
    ) -> Result<Self, Error> {
        let script = std::fs::read(script_path).map_err(|e| {
            Error::config(format!(
                "failed to read bootstrap script {}: {e}",
                script_path.display()
            ))
        })?;
        Ok(Self::new(endpoint, script))
    }
}

#[async_trait]
impl Provisioner for CredentialProvisioner {
    async fn deliver(
        &self,
        node: &NodeIdentity,
        private_key_pem: &str,
        certificate_pem: &str,
    ) -> Result<(), Error> {
        let archive = build_archive(certificate_pem, private_key_pem, &self.script)
            .map_err(|e| Error::delivery_failed(&node.uuid, None, e.to_string()))?;

        let upload = ProvisioningUpload {
            uuid: node.uuid.clone(),
            archive,
            reference_state: node.reference_state.clone(),
        };
        self.endpoint.upload(&upload).await?;

        info!(uuid = %node.uuid, "Delivered credentials to provisioning endpoint");
        Ok(())
    }
}
