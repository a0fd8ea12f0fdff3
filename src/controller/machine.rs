//! Trust bootstrap state machine
//!
//! ```text
//! Unregistered -> observe only
//! Registered   -> Verify -> Issue -> Grant -> Deliver
//! Unattested   -> Revoke
//! Attested     -> no-op
//! anything else -> InvalidState
//! ```
//!
//! Every network side effect lives in a per-state handler, and the four
//! components are injected as traits. The first failing step ends the pass:
//! an unverified node never gets a certificate, and a node never receives
//! credentials that were not issued for its own identity.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use tracing::{debug, error, info, warn};

use crate::attestation::Attestor;
use crate::config::ControllerConfig;
use crate::crd::NodeStatus;
use crate::events::{actions, reasons, EventPublisher};
use crate::identity::NodeIdentity;
use crate::issuer::Issuer;
use crate::provisioning::Provisioner;
use crate::rbac::AccessScopes;
use crate::Error;

/// Result of one state-machine step
#[derive(Debug)]
pub enum Outcome {
    /// Nothing to do in this state
    NoOp,
    /// The state's work completed
    Advanced,
    /// A step failed and a later pass may succeed
    Retry(Error),
    /// A step failed and only a spec change can help
    Failed(Error),
}

impl Outcome {
    /// Classify an error as retryable or permanent
    pub fn from_error(error: Error) -> Self {
        if error.is_retryable() {
            Self::Retry(error)
        } else {
            Self::Failed(error)
        }
    }

    /// Turn the outcome into a scheduling directive
    pub fn into_directive(self, retry_delay: Duration) -> Directive {
        match self {
            Self::NoOp | Self::Advanced => Directive::Complete,
            Self::Retry(_) => Directive::RetryAfter(retry_delay),
            Self::Failed(e) => Directive::Error(e),
        }
    }
}

/// What the scheduler should do with the node next
#[derive(Debug)]
pub enum Directive {
    /// Wait for the next change to the node
    Complete,
    /// Run another pass after the delay
    RetryAfter(Duration),
    /// Surface a permanent error
    Error(Error),
}

/// Drives a node through the bootstrap protocol
pub struct BootstrapMachine {
    attestor: Arc<dyn Attestor>,
    issuer: Arc<dyn Issuer>,
    scopes: Arc<dyn AccessScopes>,
    provisioner: Arc<dyn Provisioner>,
    events: Arc<dyn EventPublisher>,
    config: ControllerConfig,
}

impl BootstrapMachine {
    /// Create a machine over the given components
    pub fn new(
        attestor: Arc<dyn Attestor>,
        issuer: Arc<dyn Issuer>,
        scopes: Arc<dyn AccessScopes>,
        provisioner: Arc<dyn Provisioner>,
        events: Arc<dyn EventPublisher>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            attestor,
            issuer,
            scopes,
            provisioner,
            events,
            config,
        }
    }

    /// Delay used for retry directives
    pub fn retry_delay(&self) -> Duration {
        self.config.retry_delay
    }

    /// Run one step and map it to a directive
    pub async fn run(&self, node: &NodeIdentity, object_ref: &ObjectReference) -> Directive {
        self.step(node, object_ref)
            .await
            .into_directive(self.config.retry_delay)
    }

    /// Run the handler for the node's declared state
    pub async fn step(&self, node: &NodeIdentity, object_ref: &ObjectReference) -> Outcome {
        match node.status {
            NodeStatus::Unregistered => {
                debug!(uuid = %node.uuid, "Node not registered yet, waiting");
                Outcome::NoOp
            }
            NodeStatus::Registered => self.on_registered(node, object_ref).await,
            NodeStatus::Unattested => self.on_unattested(node, object_ref).await,
            NodeStatus::Attested => {
                debug!(uuid = %node.uuid, "Node attested, nothing to do");
                Outcome::NoOp
            }
            NodeStatus::Unrecognized => self.on_invalid(node, object_ref).await,
        }
    }

    async fn on_registered(&self, node: &NodeIdentity, object_ref: &ObjectReference) -> Outcome {
        info!(uuid = %node.uuid, "Bootstrapping registered node");

        match tokio::time::timeout(self.config.pass_timeout, self.bootstrap(node, object_ref)).await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                let err = Error::timeout(format!(
                    "bootstrap of {} did not finish within {}s",
                    node.uuid,
                    self.config.pass_timeout.as_secs()
                ));
                self.fail(node, object_ref, actions::RECONCILE, err).await
            }
        }
    }

    /// Verify, issue, grant and deliver, stopping at the first failure
    async fn bootstrap(&self, node: &NodeIdentity, object_ref: &ObjectReference) -> Outcome {
        if let Err(e) = self.attestor.verify(node).await {
            return self.fail(node, object_ref, actions::ATTEST, e).await;
        }

        let credentials = match self.issuer.issue(node).await {
            Ok(credentials) => credentials,
            Err(e) => return self.fail(node, object_ref, actions::ISSUE, e).await,
        };

        if let Some(cleanup) = &credentials.cleanup_error {
            self.events
                .publish(
                    object_ref,
                    EventType::Warning,
                    reasons::SIGNING_REQUEST_CLEANUP_FAILED,
                    actions::ISSUE,
                    Some(format!(
                        "signing request {} was not deleted: {cleanup}",
                        node.csr_name()
                    )),
                )
                .await;
        }

        if let Err(e) = self.scopes.grant(node).await {
            return self.fail(node, object_ref, actions::AUTHORIZE, e).await;
        }

        if let Err(e) = self
            .provisioner
            .deliver(
                node,
                &credentials.private_key_pem,
                &credentials.certificate_pem,
            )
            .await
        {
            return self.fail(node, object_ref, actions::DELIVER, e).await;
        }

        info!(uuid = %node.uuid, "Credentials delivered");
        self.events
            .publish(
                object_ref,
                EventType::Normal,
                reasons::CREDENTIALS_DELIVERED,
                actions::DELIVER,
                Some(format!("credentials for {} delivered", node.uuid)),
            )
            .await;
        Outcome::Advanced
    }

    async fn on_unattested(&self, node: &NodeIdentity, object_ref: &ObjectReference) -> Outcome {
        warn!(uuid = %node.uuid, "Node failed attestation, revoking access");

        if let Err(e) = self.scopes.revoke(node).await {
            return self.fail(node, object_ref, actions::AUTHORIZE, e).await;
        }

        self.events
            .publish(
                object_ref,
                EventType::Normal,
                reasons::ACCESS_REVOKED,
                actions::AUTHORIZE,
                Some(format!("access scope {} emptied", node.scope_name())),
            )
            .await;
        Outcome::Advanced
    }

    async fn on_invalid(&self, node: &NodeIdentity, object_ref: &ObjectReference) -> Outcome {
        let err = Error::InvalidState {
            uuid: node.uuid.clone(),
        };
        error!(uuid = %node.uuid, "Declared node status is not a known state");
        self.events
            .publish(
                object_ref,
                EventType::Warning,
                reasons::INVALID_STATE,
                actions::RECONCILE,
                Some(err.to_string()),
            )
            .await;
        Outcome::Failed(err)
    }

    /// Report a failed step and classify it
    async fn fail(
        &self,
        node: &NodeIdentity,
        object_ref: &ObjectReference,
        action: &str,
        err: Error,
    ) -> Outcome {
        let reason = if err.is_security_failure() {
            warn!(uuid = %node.uuid, action, error = %err, "Possible identity spoofing");
            reasons::IDENTITY_MISMATCH
        } else {
            warn!(uuid = %node.uuid, action, error = %err, "Bootstrap step failed");
            reasons::BOOTSTRAP_FAILED
        };

        self.events
            .publish(
                object_ref,
                EventType::Warning,
                reason,
                action,
                Some(err.to_string()),
            )
            .await;
        Outcome::from_error(err)
    }
}
