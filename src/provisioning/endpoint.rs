//! Provisioning endpoint client
//!
//! The endpoint accepts a multipart form with three parts:
//!
//! - `file`: the credential archive
//! - `uuid`: the node uuid as a plain field
//! - `json`: the measured-boot reference state

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use tracing::debug;

use super::archive::CredentialArchive;
use crate::config::ProvisionerConfig;
use crate::discovery::{ServiceAddress, ServiceResolver};
use crate::error::body_excerpt;
use crate::Error;

/// Multipart field carrying the archive
pub const FILE_FIELD: &str = "file";
/// Multipart field carrying the uuid
pub const UUID_FIELD: &str = "uuid";
/// Multipart field carrying the reference state
pub const REFERENCE_STATE_FIELD: &str = "json";

/// One delivery to the provisioning endpoint
pub struct ProvisioningUpload {
    /// Node the credentials are for
    pub uuid: String,
    /// Zip archive with certificate, key and script
    pub archive: CredentialArchive,
    /// Measured-boot reference state, forwarded as-is
    pub reference_state: String,
}

impl std::fmt::Debug for ProvisioningUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningUpload")
            .field("uuid", &self.uuid)
            .field("archive_len", &self.archive.len())
            .field("reference_state_len", &self.reference_state.len())
            .finish()
    }
}

/// Destination of credential uploads
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProvisioningEndpoint: Send + Sync {
    /// Upload the archive; anything but HTTP 200 fails with
    /// [`Error::DeliveryFailed`]
    async fn upload(&self, upload: &ProvisioningUpload) -> Result<(), Error>;
}

/// Provisioning endpoint reached over HTTP multipart
pub struct HttpProvisioningEndpoint {
    client: Client,
    resolver: Arc<dyn ServiceResolver>,
    config: ProvisionerConfig,
}

impl HttpProvisioningEndpoint {
    /// Build the HTTP client for the endpoint
    pub fn new(
        config: ProvisionerConfig,
        resolver: Arc<dyn ServiceResolver>,
    ) -> Result<Self, Error> {
        let client = Client::builder()
            .use_rustls_tls()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::config(format!("failed to build provisioner client: {e}")))?;

        Ok(Self {
            client,
            resolver,
            config,
        })
    }
}

/// URL of the upload handler
fn upload_url(scheme: &str, address: &ServiceAddress, path: &str) -> String {
    format!("{scheme}://{address}{path}")
}

/// Assemble the multipart form for an upload
fn upload_form(upload: &ProvisioningUpload) -> Result<Form, Error> {
    let archive = Part::bytes(upload.archive.to_vec())
        .file_name(FILE_FIELD)
        .mime_str("application/zip")
        .map_err(|e| Error::delivery_failed(&upload.uuid, None, e.to_string()))?;
    let reference_state = Part::text(upload.reference_state.clone())
        .file_name(REFERENCE_STATE_FIELD)
        .mime_str("application/json")
        .map_err(|e| Error::delivery_failed(&upload.uuid, None, e.to_string()))?;

    Ok(Form::new()
        .part(FILE_FIELD, archive)
        .text(UUID_FIELD, upload.uuid.clone())
        .part(REFERENCE_STATE_FIELD, reference_state))
}

#[async_trait]
impl ProvisioningEndpoint for HttpProvisioningEndpoint {
    async fn upload(&self, upload: &ProvisioningUpload) -> Result<(), Error> {
        let uuid = &upload.uuid;
        let address = self
            .resolver
            .resolve(&self.config.endpoint)
            .await
            .map_err(|e| Error::delivery_failed(uuid, None, e.to_string()))?;
        let url = upload_url(&self.config.scheme, &address, &self.config.path);

        let response = self
            .client
            .post(&url)
            .multipart(upload_form(upload)?)
            .send()
            .await
            .map_err(|e| Error::delivery_failed(uuid, None, format!("POST {url}: {e}")))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read response body".to_string());
            return Err(Error::delivery_failed(
                uuid,
                Some(status.as_u16()),
                body_excerpt(&body),
            ));
        }

        debug!(uuid = %uuid, url = %url, "Provisioning endpoint accepted upload");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zeroize::Zeroizing;

    #[test]
    fn upload_url_joins_scheme_address_and_path() {
        let address = ServiceAddress::new("10.96.3.3", 8080);
        assert_eq!(
            upload_url("http", &address, "/edgenode"),
            "http://10.96.3.3:8080/edgenode"
        );
    }

    #[test]
    fn form_builds_for_a_complete_upload() {
        let upload = ProvisioningUpload {
            uuid: "node-1".to_string(),
            archive: Zeroizing::new(vec![0x50, 0x4b, 0x03, 0x04]),
            reference_state: "{}".to_string(),
        };
        let form = upload_form(&upload).unwrap();
        assert!(!form.boundary().is_empty());
    }

    #[test]
    fn debug_output_hides_archive_contents() {
        let upload = ProvisioningUpload {
            uuid: "node-1".to_string(),
            archive: Zeroizing::new(b"secret".to_vec()),
            reference_state: "{}".to_string(),
        };
        let rendered = format!("{upload:?}");
        assert!(rendered.contains("archive_len: 6"));
        assert!(!rendered.contains("secret"));
    }
}
