//! Registrar client
//!
//! The registrar holds the TPM-validated record of every agent that has
//! registered. Lookups use mutual TLS with the operator's client identity.

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use reqwest::{Certificate, Client, Identity, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::config::RegistrarConfig;
use crate::discovery::{ServiceAddress, ServiceResolver};
use crate::error::body_excerpt;
use crate::Error;

/// Agent record as reported by the registrar
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct AgentRecord {
    /// Attestation identity key
    #[serde(default)]
    pub aik_tpm: Option<String>,
    /// Endorsement public key
    #[serde(default)]
    pub ek_tpm: Option<String>,
    /// Endorsement-key certificate (PEM) validated by the registrar
    #[serde(default)]
    pub ekcert: Option<String>,
    /// Agent mTLS certificate
    #[serde(default)]
    pub mtls_cert: Option<String>,
    /// Address the agent registered from
    #[serde(default)]
    pub ip: Option<String>,
    /// Port the agent listens on
    #[serde(default)]
    pub port: Option<u32>,
    /// Number of times the agent registered
    #[serde(default)]
    pub regcount: Option<u32>,
}

/// Envelope around every registrar response
#[derive(Debug, Deserialize)]
struct RegistrarResponse {
    #[serde(default)]
    code: Option<u16>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    results: Option<AgentRecord>,
}

/// Lookup of agent records by uuid
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Registrar: Send + Sync {
    /// Fetch the agent record for `uuid`
    ///
    /// Anything other than a 200 response with a parsable record fails with
    /// [`Error::RegistrarUnreachable`].
    async fn agent(&self, uuid: &str) -> Result<AgentRecord, Error>;
}

/// Registrar client over HTTPS with a client certificate
pub struct HttpRegistrar {
    client: Client,
    resolver: Arc<dyn ServiceResolver>,
    config: RegistrarConfig,
}

impl HttpRegistrar {
    /// Build the client, loading the client identity and CA from disk
    pub fn new(config: RegistrarConfig, resolver: Arc<dyn ServiceResolver>) -> Result<Self, Error> {
        let cert = std::fs::read_to_string(&config.client_cert_path).map_err(|e| {
            Error::config(format!(
                "failed to read registrar client certificate {}: {e}",
                config.client_cert_path.display()
            ))
        })?;
        let key = zeroize::Zeroizing::new(std::fs::read_to_string(&config.client_key_path).map_err(
            |e| {
                Error::config(format!(
                    "failed to read registrar client key {}: {e}",
                    config.client_key_path.display()
                ))
            },
        )?);

        let cert_with_key = zeroize::Zeroizing::new(format!("{cert}\n{}", key.as_str()));
        let identity = Identity::from_pem(cert_with_key.as_bytes())
            .map_err(|e| Error::config(format!("invalid registrar client identity: {e}")))?;

        let mut builder = Client::builder()
            .use_rustls_tls()
            .identity(identity)
            .timeout(config.request_timeout);

        if let Some(ca_path) = &config.ca_cert_path {
            let ca = std::fs::read(ca_path).map_err(|e| {
                Error::config(format!(
                    "failed to read registrar CA {}: {e}",
                    ca_path.display()
                ))
            })?;
            let ca = Certificate::from_pem(&ca)
                .map_err(|e| Error::config(format!("invalid registrar CA: {e}")))?;
            builder = builder.add_root_certificate(ca);
        }

        if config.insecure_skip_verify {
            tracing::warn!("Registrar server certificate verification is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| Error::config(format!("failed to build registrar client: {e}")))?;

        Ok(Self {
            client,
            resolver,
            config,
        })
    }
}

/// URL of the agent record for `uuid`
fn agent_url(address: &ServiceAddress, api_version: &str, uuid: &str) -> String {
    format!("https://{address}/{api_version}/agents/{uuid}")
}

/// Extract the agent record from a 200 response body
fn parse_agent(uuid: &str, body: &str) -> Result<AgentRecord, Error> {
    let response: RegistrarResponse = serde_json::from_str(body).map_err(|e| {
        Error::registrar_unreachable(uuid, format!("malformed registrar response: {e}"))
    })?;

    debug!(
        uuid = %uuid,
        code = ?response.code,
        status = ?response.status,
        "Registrar response"
    );

    response
        .results
        .ok_or_else(|| Error::registrar_unreachable(uuid, "registrar response has no results"))
}

#[async_trait]
impl Registrar for HttpRegistrar {
    async fn agent(&self, uuid: &str) -> Result<AgentRecord, Error> {
        let address = self
            .resolver
            .resolve(&self.config.endpoint)
            .await
            .map_err(|e| Error::registrar_unreachable(uuid, e.to_string()))?;
        let url = agent_url(&address, &self.config.api_version, uuid);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::registrar_unreachable(uuid, format!("GET {url}: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::registrar_unreachable(uuid, format!("reading body: {e}")))?;

        if status != StatusCode::OK {
            return Err(Error::registrar_unreachable(
                uuid,
                format!("registrar returned {status}: {}", body_excerpt(&body)),
            ));
        }

        parse_agent(uuid, &body)
    }
}
