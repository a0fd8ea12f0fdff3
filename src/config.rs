//! Operator configuration
//!
//! All network coordinates, credential paths and timing knobs live in one
//! [`OperatorConfig`] that is handed to each component at construction.
//! Nothing reads process-wide state after startup.

use std::path::PathBuf;
use std::time::Duration;

use crate::Error;

/// Default registrar API version used in agent lookups
pub const DEFAULT_REGISTRAR_API_VERSION: &str = "v2.1";

/// Signer that issues client certificates trusted by the API server
pub const KUBE_APISERVER_CLIENT_SIGNER: &str = "kubernetes.io/kube-apiserver-client";

/// Where a collaborating service can be reached
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceEndpoint {
    /// A Kubernetes Service, resolved to its ClusterIP and named port
    Service {
        /// Namespace of the Service
        namespace: String,
        /// Name of the Service
        name: String,
        /// Name of the port within the Service
        port_name: String,
    },
    /// A fixed address
    Static {
        /// Hostname or IP
        host: String,
        /// TCP port
        port: u16,
    },
}

impl ServiceEndpoint {
    /// Build an endpoint from an optional `host:port` override, falling back
    /// to a Service reference
    pub fn from_parts(
        address: Option<&str>,
        namespace: &str,
        name: &str,
        port_name: &str,
    ) -> Result<Self, Error> {
        match address {
            Some(address) => Self::parse_static(address),
            None => Ok(Self::Service {
                namespace: namespace.to_string(),
                name: name.to_string(),
                port_name: port_name.to_string(),
            }),
        }
    }

    /// Parse a `host:port` address
    pub fn parse_static(address: &str) -> Result<Self, Error> {
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| Error::config(format!("address '{address}' must be host:port")))?;
        if host.is_empty() {
            return Err(Error::config(format!("address '{address}' has no host")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| Error::config(format!("invalid port in '{address}': {e}")))?;
        Ok(Self::Static {
            host: host.to_string(),
            port,
        })
    }
}

/// Registrar connection settings
#[derive(Clone, Debug)]
pub struct RegistrarConfig {
    /// Where the registrar listens
    pub endpoint: ServiceEndpoint,
    /// API version path segment (e.g. "v2.1")
    pub api_version: String,
    /// Client certificate presented for mutual TLS
    pub client_cert_path: PathBuf,
    /// Private key of the client certificate
    pub client_key_path: PathBuf,
    /// CA bundle used to verify the registrar's certificate
    pub ca_cert_path: Option<PathBuf>,
    /// Skip server certificate verification
    pub insecure_skip_verify: bool,
    /// Timeout for a single registrar request
    pub request_timeout: Duration,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            endpoint: ServiceEndpoint::Service {
                namespace: "keylime".to_string(),
                name: "hhkl-keylime-registrar".to_string(),
                port_name: "registrar-tls".to_string(),
            },
            api_version: DEFAULT_REGISTRAR_API_VERSION.to_string(),
            client_cert_path: PathBuf::from("/var/lib/controller/certs/csr.crt"),
            client_key_path: PathBuf::from("/var/lib/controller/certs/csr.key"),
            ca_cert_path: None,
            insecure_skip_verify: false,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Provisioning endpoint settings
#[derive(Clone, Debug)]
pub struct ProvisionerConfig {
    /// Where the provisioning endpoint listens
    pub endpoint: ServiceEndpoint,
    /// URL scheme ("http" or "https")
    pub scheme: String,
    /// HTTP path of the upload handler
    pub path: String,
    /// Bootstrap script packaged into every archive
    pub script_path: PathBuf,
    /// Timeout for a single upload
    pub request_timeout: Duration,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            endpoint: ServiceEndpoint::Service {
                namespace: "keylime".to_string(),
                name: "hhkl-keylime-tenant".to_string(),
                port_name: "tenant".to_string(),
            },
            scheme: "http".to_string(),
            path: "/edgenode".to_string(),
            script_path: PathBuf::from("autorun.sh"),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Certificate issuance settings
#[derive(Clone, Debug)]
pub struct IssuerConfig {
    /// Signer the requests are addressed to
    pub signer_name: String,
    /// Delay between polls for the issued certificate
    pub poll_interval: Duration,
    /// Longest time to wait for the certificate after approval
    pub max_wait: Duration,
    /// Requested certificate lifetime, if any
    pub expiration_seconds: Option<i32>,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            signer_name: KUBE_APISERVER_CLIENT_SIGNER.to_string(),
            poll_interval: Duration::from_millis(100),
            max_wait: Duration::from_secs(30),
            expiration_seconds: None,
        }
    }
}

/// Resource class covered by the read-only scope
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopeConfig {
    /// API group of the resource ("" for core)
    pub api_group: String,
    /// Plural resource name
    pub resource: String,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            api_group: String::new(),
            resource: "pods".to_string(),
        }
    }
}

/// Reconciliation timing
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Fixed delay before a failed pass is retried
    pub retry_delay: Duration,
    /// Deadline for a complete bootstrap pass
    pub pass_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            retry_delay: Duration::from_secs(10),
            pass_timeout: Duration::from_secs(60),
        }
    }
}

/// Complete operator configuration
#[derive(Clone, Debug, Default)]
pub struct OperatorConfig {
    /// Registrar connection
    pub registrar: RegistrarConfig,
    /// Provisioning endpoint connection
    pub provisioner: ProvisionerConfig,
    /// Certificate issuance
    pub issuer: IssuerConfig,
    /// Access scope
    pub scope: ScopeConfig,
    /// Reconciliation timing
    pub controller: ControllerConfig,
}

impl OperatorConfig {
    /// Check the configuration for values the operator cannot work with
    pub fn validate(&self) -> Result<(), Error> {
        if self.registrar.api_version.is_empty() {
            return Err(Error::config("registrar API version must not be empty"));
        }
        if !matches!(self.provisioner.scheme.as_str(), "http" | "https") {
            return Err(Error::config(format!(
                "provisioner scheme '{}' must be http or https",
                self.provisioner.scheme
            )));
        }
        if !self.provisioner.path.starts_with('/') {
            return Err(Error::config(format!(
                "provisioner path '{}' must start with '/'",
                self.provisioner.path
            )));
        }
        if self.issuer.signer_name.is_empty() {
            return Err(Error::config("signer name must not be empty"));
        }
        if self.issuer.poll_interval.is_zero() {
            return Err(Error::config("poll interval must be greater than zero"));
        }
        if self.issuer.max_wait < self.issuer.poll_interval {
            return Err(Error::config(
                "certificate max wait must be at least one poll interval",
            ));
        }
        if matches!(self.issuer.expiration_seconds, Some(s) if s < 600) {
            // The API server rejects shorter lifetimes
            return Err(Error::config("certificate expiration must be at least 600 seconds"));
        }
        if self.scope.resource.is_empty() {
            return Err(Error::config("scope resource must not be empty"));
        }
        if self.controller.retry_delay.is_zero() {
            return Err(Error::config("retry delay must be greater than zero"));
        }
        if self.controller.pass_timeout <= self.issuer.max_wait {
            return Err(Error::config(
                "pass timeout must exceed the certificate max wait",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = OperatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.issuer.poll_interval, Duration::from_millis(100));
        assert_eq!(config.controller.retry_delay, Duration::from_secs(10));
        assert_eq!(config.registrar.api_version, "v2.1");
        assert_eq!(config.provisioner.path, "/edgenode");
    }

    #[test]
    fn static_address_overrides_service() {
        let endpoint =
            ServiceEndpoint::from_parts(Some("10.0.0.5:8891"), "keylime", "reg", "tls").unwrap();
        assert_eq!(
            endpoint,
            ServiceEndpoint::Static {
                host: "10.0.0.5".to_string(),
                port: 8891
            }
        );

        let endpoint = ServiceEndpoint::from_parts(None, "keylime", "reg", "tls").unwrap();
        assert!(matches!(endpoint, ServiceEndpoint::Service { ref name, .. } if name == "reg"));
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        for bad in ["no-port", ":8080", "host:notaport", "host:70000"] {
            assert!(
                matches!(ServiceEndpoint::parse_static(bad), Err(Error::Config(_))),
                "{bad} should be rejected"
            );
        }
    }

    /// Story: Timing knobs that would hang or spin are refused at startup
    #[test]
    fn story_unsafe_timing_is_refused() {
        let mut config = OperatorConfig::default();
        config.issuer.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = OperatorConfig::default();
        config.issuer.max_wait = Duration::from_millis(10);
        assert!(config.validate().is_err());

        // The pass deadline must leave room for the issuer to time out first
        let mut config = OperatorConfig::default();
        config.controller.pass_timeout = config.issuer.max_wait;
        assert!(config.validate().is_err());

        let mut config = OperatorConfig::default();
        config.controller.retry_delay = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn short_certificate_lifetimes_are_refused() {
        let mut config = OperatorConfig::default();
        config.issuer.expiration_seconds = Some(60);
        assert!(config.validate().is_err());

        config.issuer.expiration_seconds = Some(3600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn provisioner_path_must_be_absolute() {
        let mut config = OperatorConfig::default();
        config.provisioner.path = "edgenode".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn provisioner_scheme_is_http_or_https() {
        let mut config = OperatorConfig::default();
        config.provisioner.scheme = "https".to_string();
        assert!(config.validate().is_ok());

        config.provisioner.scheme = "ftp".to_string();
        assert!(config.validate().is_err());
    }
}
