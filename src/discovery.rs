//! Service address resolution
//!
//! The registrar and provisioning endpoint run as in-cluster Services. Their
//! address is looked up per pass, so a Service that is recreated with a new
//! ClusterIP is picked up without restarting the operator.

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use kube::api::Api;
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use crate::config::ServiceEndpoint;
use crate::Error;

/// Concrete network address of a service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceAddress {
    /// Hostname or IP
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl ServiceAddress {
    /// Create an address from host and port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServiceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Resolves a configured endpoint to an address
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServiceResolver: Send + Sync {
    /// Resolve the endpoint to a host and port
    async fn resolve(&self, endpoint: &ServiceEndpoint) -> Result<ServiceAddress, Error>;
}

/// Resolver backed by the Kubernetes Service API
pub struct KubeServiceResolver {
    client: Client,
}

impl KubeServiceResolver {
    /// Create a resolver using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ServiceResolver for KubeServiceResolver {
    async fn resolve(&self, endpoint: &ServiceEndpoint) -> Result<ServiceAddress, Error> {
        let (namespace, name, port_name) = match endpoint {
            ServiceEndpoint::Static { host, port } => {
                return Ok(ServiceAddress::new(host.clone(), *port))
            }
            ServiceEndpoint::Service {
                namespace,
                name,
                port_name,
            } => (namespace, name, port_name),
        };

        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let service = api.get(name).await?;
        let address = address_of(&service, port_name)
            .map_err(|msg| Error::discovery(format!("service {namespace}/{name}: {msg}")))?;

        debug!(service = %name, namespace = %namespace, address = %address, "Resolved service");
        Ok(address)
    }
}

/// Pick the ClusterIP and the named port out of a Service
fn address_of(service: &Service, port_name: &str) -> Result<ServiceAddress, String> {
    let spec = service.spec.as_ref().ok_or("service has no spec")?;

    let host = spec
        .cluster_ip
        .as_deref()
        .filter(|ip| !ip.is_empty() && *ip != "None")
        .ok_or("service has no ClusterIP")?;

    let port = spec
        .ports
        .iter()
        .flatten()
        .find(|p| p.name.as_deref() == Some(port_name))
        .ok_or_else(|| format!("service has no port named '{port_name}'"))?
        .port;
    let port = u16::try_from(port).map_err(|_| format!("port {port} is out of range"))?;

    Ok(ServiceAddress::new(host, port))
}
