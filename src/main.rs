//! EdgeNode operator - bootstraps TPM-attested edge devices into the cluster

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser};
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use edgenode_operator::attestation::{AttestationVerifier, HttpRegistrar};
use edgenode_operator::config::{
    ControllerConfig, IssuerConfig, OperatorConfig, ProvisionerConfig, RegistrarConfig,
    ScopeConfig, ServiceEndpoint, DEFAULT_REGISTRAR_API_VERSION, KUBE_APISERVER_CLIENT_SIGNER,
};
use edgenode_operator::controller::{error_policy, reconcile, BootstrapMachine, Context};
use edgenode_operator::crd::EdgeNode;
use edgenode_operator::discovery::KubeServiceResolver;
use edgenode_operator::events::KubeEventPublisher;
use edgenode_operator::issuer::{CertificateIssuer, KubeSigningAuthority};
use edgenode_operator::provisioning::{CredentialProvisioner, HttpProvisioningEndpoint};
use edgenode_operator::rbac::{AccessScopeManager, KubeScopeStore};
use edgenode_operator::{CONTROLLER_NAME, FIELD_MANAGER};

/// EdgeNode operator - verifies TPM identities and delivers client credentials
#[derive(Parser, Debug)]
#[command(name = "edgenode-operator", version, about, long_about = None)]
struct Cli {
    /// Print the EdgeNode CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    registrar: RegistrarArgs,

    #[command(flatten)]
    provisioner: ProvisionerArgs,

    #[command(flatten)]
    issuer: IssuerArgs,

    #[command(flatten)]
    scope: ScopeArgs,

    #[command(flatten)]
    controller: ControllerArgs,
}

/// Registrar connection
#[derive(Args, Debug)]
struct RegistrarArgs {
    /// Static registrar address (host:port); overrides Service discovery
    #[arg(long, env = "EDGENODE_REGISTRAR_ADDRESS")]
    registrar_address: Option<String>,

    /// Namespace of the registrar Service
    #[arg(long, env = "EDGENODE_REGISTRAR_NAMESPACE", default_value = "keylime")]
    registrar_namespace: String,

    /// Name of the registrar Service
    #[arg(
        long,
        env = "EDGENODE_REGISTRAR_SERVICE",
        default_value = "hhkl-keylime-registrar"
    )]
    registrar_service: String,

    /// Port name within the registrar Service
    #[arg(long, env = "EDGENODE_REGISTRAR_PORT_NAME", default_value = "registrar-tls")]
    registrar_port_name: String,

    /// Registrar API version
    #[arg(long, env = "EDGENODE_REGISTRAR_API_VERSION", default_value = DEFAULT_REGISTRAR_API_VERSION)]
    registrar_api_version: String,

    /// Client certificate for registrar mutual TLS
    #[arg(
        long,
        env = "EDGENODE_REGISTRAR_CLIENT_CERT",
        default_value = "/var/lib/controller/certs/csr.crt"
    )]
    registrar_client_cert: PathBuf,

    /// Client key for registrar mutual TLS
    #[arg(
        long,
        env = "EDGENODE_REGISTRAR_CLIENT_KEY",
        default_value = "/var/lib/controller/certs/csr.key"
    )]
    registrar_client_key: PathBuf,

    /// CA bundle used to verify the registrar
    #[arg(long, env = "EDGENODE_REGISTRAR_CA_CERT")]
    registrar_ca_cert: Option<PathBuf>,

    /// Skip verification of the registrar's certificate
    #[arg(long, env = "EDGENODE_REGISTRAR_INSECURE_SKIP_VERIFY")]
    registrar_insecure_skip_verify: bool,

    /// Registrar request timeout in seconds
    #[arg(long, env = "EDGENODE_REGISTRAR_TIMEOUT_SECS", default_value = "10")]
    registrar_timeout_secs: u64,
}

/// Provisioning endpoint connection
#[derive(Args, Debug)]
struct ProvisionerArgs {
    /// Static provisioning endpoint address (host:port)
    #[arg(long, env = "EDGENODE_PROVISIONER_ADDRESS")]
    provisioner_address: Option<String>,

    /// Namespace of the provisioning Service
    #[arg(long, env = "EDGENODE_PROVISIONER_NAMESPACE", default_value = "keylime")]
    provisioner_namespace: String,

    /// Name of the provisioning Service
    #[arg(
        long,
        env = "EDGENODE_PROVISIONER_SERVICE",
        default_value = "hhkl-keylime-tenant"
    )]
    provisioner_service: String,

    /// Port name within the provisioning Service
    #[arg(long, env = "EDGENODE_PROVISIONER_PORT_NAME", default_value = "tenant")]
    provisioner_port_name: String,

    /// URL scheme of the provisioning endpoint
    #[arg(long, env = "EDGENODE_PROVISIONER_SCHEME", default_value = "http")]
    provisioner_scheme: String,

    /// HTTP path of the upload handler
    #[arg(long, env = "EDGENODE_PROVISIONER_PATH", default_value = "/edgenode")]
    provisioner_path: String,

    /// Bootstrap script packaged into every archive
    #[arg(long, env = "EDGENODE_SCRIPT_PATH", default_value = "autorun.sh")]
    script_path: PathBuf,

    /// Upload timeout in seconds
    #[arg(long, env = "EDGENODE_PROVISIONER_TIMEOUT_SECS", default_value = "30")]
    provisioner_timeout_secs: u64,
}

/// Certificate issuance
#[derive(Args, Debug)]
struct IssuerArgs {
    /// Signer the signing requests are addressed to
    #[arg(long, env = "EDGENODE_SIGNER_NAME", default_value = KUBE_APISERVER_CLIENT_SIGNER)]
    signer_name: String,

    /// Poll interval for the issued certificate in milliseconds
    #[arg(long, env = "EDGENODE_CSR_POLL_INTERVAL_MS", default_value = "100")]
    csr_poll_interval_ms: u64,

    /// Longest wait for the issued certificate in seconds
    #[arg(long, env = "EDGENODE_CSR_MAX_WAIT_SECS", default_value = "30")]
    csr_max_wait_secs: u64,

    /// Requested certificate lifetime in seconds
    #[arg(long, env = "EDGENODE_CERT_EXPIRATION_SECS")]
    cert_expiration_secs: Option<i32>,
}

/// Access scope
#[derive(Args, Debug)]
struct ScopeArgs {
    /// API group of the resource the scope reads ("" for core)
    #[arg(long, env = "EDGENODE_SCOPE_API_GROUP", default_value = "")]
    scope_api_group: String,

    /// Plural resource name the scope reads
    #[arg(long, env = "EDGENODE_SCOPE_RESOURCE", default_value = "pods")]
    scope_resource: String,
}

/// Reconciliation timing
#[derive(Args, Debug)]
struct ControllerArgs {
    /// Delay before a failed pass is retried, in seconds
    #[arg(long, env = "EDGENODE_RETRY_DELAY_SECS", default_value = "10")]
    retry_delay_secs: u64,

    /// Deadline for a complete bootstrap pass, in seconds
    #[arg(long, env = "EDGENODE_PASS_TIMEOUT_SECS", default_value = "60")]
    pass_timeout_secs: u64,
}

impl Cli {
    /// Assemble the operator configuration from parsed arguments
    fn operator_config(&self) -> anyhow::Result<OperatorConfig> {
        let registrar = &self.registrar;
        let provisioner = &self.provisioner;

        Ok(OperatorConfig {
            registrar: RegistrarConfig {
                endpoint: ServiceEndpoint::from_parts(
                    registrar.registrar_address.as_deref(),
                    &registrar.registrar_namespace,
                    &registrar.registrar_service,
                    &registrar.registrar_port_name,
                )?,
                api_version: registrar.registrar_api_version.clone(),
                client_cert_path: registrar.registrar_client_cert.clone(),
                client_key_path: registrar.registrar_client_key.clone(),
                ca_cert_path: registrar.registrar_ca_cert.clone(),
                insecure_skip_verify: registrar.registrar_insecure_skip_verify,
                request_timeout: Duration::from_secs(registrar.registrar_timeout_secs),
            },
            provisioner: ProvisionerConfig {
                endpoint: ServiceEndpoint::from_parts(
                    provisioner.provisioner_address.as_deref(),
                    &provisioner.provisioner_namespace,
                    &provisioner.provisioner_service,
                    &provisioner.provisioner_port_name,
                )?,
                scheme: provisioner.provisioner_scheme.clone(),
                path: provisioner.provisioner_path.clone(),
                script_path: provisioner.script_path.clone(),
                request_timeout: Duration::from_secs(provisioner.provisioner_timeout_secs),
            },
            issuer: IssuerConfig {
                signer_name: self.issuer.signer_name.clone(),
                poll_interval: Duration::from_millis(self.issuer.csr_poll_interval_ms),
                max_wait: Duration::from_secs(self.issuer.csr_max_wait_secs),
                expiration_seconds: self.issuer.cert_expiration_secs,
            },
            scope: ScopeConfig {
                api_group: self.scope.scope_api_group.clone(),
                resource: self.scope.scope_resource.clone(),
            },
            controller: ControllerConfig {
                retry_delay: Duration::from_secs(self.controller.retry_delay_secs),
                pass_timeout: Duration::from_secs(self.controller.pass_timeout_secs),
            },
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider before any TLS client is built
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&EdgeNode::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    let config = cli.operator_config()?;
    config.validate()?;
    run_controller(config).await
}

/// Install or update the EdgeNode CRD using server-side apply
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing EdgeNode CRD...");
    crds.patch(
        "edgenodes.edgenode.attest.idlab.be",
        &params,
        &Patch::Apply(&EdgeNode::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install EdgeNode CRD: {}", e))?;

    tracing::info!("EdgeNode CRD installed/updated");
    Ok(())
}

/// Build the components and run the EdgeNode controller until shutdown
async fn run_controller(config: OperatorConfig) -> anyhow::Result<()> {
    tracing::info!("Starting EdgeNode controller...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crd_installed(&client).await?;

    let resolver = Arc::new(KubeServiceResolver::new(client.clone()));
    let events = Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));

    let registrar = HttpRegistrar::new(config.registrar.clone(), resolver.clone())?;
    let attestor = AttestationVerifier::new(Arc::new(registrar));

    let authority = KubeSigningAuthority::new(
        client.clone(),
        config.issuer.signer_name.clone(),
        config.issuer.expiration_seconds,
    );
    let issuer = CertificateIssuer::new(Arc::new(authority), config.issuer.clone());

    let scopes = AccessScopeManager::new(
        Arc::new(KubeScopeStore::new(client.clone())),
        config.scope.clone(),
    );

    let endpoint = HttpProvisioningEndpoint::new(config.provisioner.clone(), resolver)?;
    let provisioner =
        CredentialProvisioner::with_script_file(Arc::new(endpoint), &config.provisioner.script_path)?;

    let machine = BootstrapMachine::new(
        Arc::new(attestor),
        Arc::new(issuer),
        Arc::new(scopes),
        Arc::new(provisioner),
        events.clone(),
        config.controller.clone(),
    );
    let ctx = Arc::new(Context::new(client.clone(), machine, events));

    let edge_nodes: Api<EdgeNode> = Api::all(client);

    tracing::info!(
        registrar = ?config.registrar.endpoint,
        provisioner = ?config.provisioner.endpoint,
        "Watching EdgeNode resources"
    );

    Controller::new(edge_nodes, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "EdgeNode reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "EdgeNode reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("EdgeNode controller shut down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_build_a_valid_config() {
        let cli = Cli::parse_from(["edgenode-operator"]);
        let config = cli.operator_config().unwrap();
        config.validate().unwrap();

        assert_eq!(config.registrar.api_version, "v2.1");
        assert_eq!(config.provisioner.path, "/edgenode");
        assert_eq!(config.issuer.signer_name, KUBE_APISERVER_CLIENT_SIGNER);
        assert_eq!(config.controller.retry_delay, Duration::from_secs(10));
    }

    #[test]
    fn static_address_overrides_service_discovery() {
        let cli = Cli::parse_from([
            "edgenode-operator",
            "--provisioner-address",
            "10.0.0.5:8080",
        ]);
        let config = cli.operator_config().unwrap();
        assert_eq!(
            config.provisioner.endpoint,
            ServiceEndpoint::Static {
                host: "10.0.0.5".to_string(),
                port: 8080
            }
        );
    }

    #[test]
    fn malformed_address_is_rejected() {
        let cli = Cli::parse_from(["edgenode-operator", "--registrar-address", "nope"]);
        assert!(cli.operator_config().is_err());
    }
}
