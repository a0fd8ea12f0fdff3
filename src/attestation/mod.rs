//! Endorsement-key cross-check against the registrar
//!
//! The registrar has already validated the TPM quote of every agent it
//! records. If the EK certificate it holds for a uuid is exactly the one the
//! operator declared, the declared identity is the physically attested
//! device. The verifier does no TPM cryptography of its own.

mod registrar;

pub use registrar::{AgentRecord, HttpRegistrar, Registrar};
#[cfg(test)]
pub use registrar::MockRegistrar;

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, warn};

use crate::identity::NodeIdentity;
use crate::Error;

/// Verifies a node's declared identity
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Attestor: Send + Sync {
    /// Succeed only if the registrar's EK certificate for the node matches
    /// the declared one byte for byte
    async fn verify(&self, node: &NodeIdentity) -> Result<(), Error>;
}

/// Attestor backed by a [`Registrar`]
pub struct AttestationVerifier {
    registrar: Arc<dyn Registrar>,
}

impl AttestationVerifier {
    /// Create a verifier querying the given registrar
    pub fn new(registrar: Arc<dyn Registrar>) -> Self {
        Self { registrar }
    }
}

#[async_trait]
impl Attestor for AttestationVerifier {
    async fn verify(&self, node: &NodeIdentity) -> Result<(), Error> {
        if node.ek_cert.is_empty() {
            return Err(Error::validation(format!(
                "node {} declares no endorsement-key certificate",
                node.uuid
            )));
        }

        let record = self.registrar.agent(&node.uuid).await?;

        let registered = match record.ekcert.as_deref() {
            Some(ekcert) if !ekcert.is_empty() => ekcert,
            _ => {
                warn!(uuid = %node.uuid, "Registrar holds no EK certificate for node");
                return Err(Error::identity_mismatch(
                    &node.uuid,
                    "registrar holds no EK certificate",
                ));
            }
        };

        if registered.as_bytes() != node.ek_cert.as_bytes() {
            warn!(
                uuid = %node.uuid,
                declared_len = node.ek_cert.len(),
                registered_len = registered.len(),
                "Declared EK certificate differs from the registrar's"
            );
            return Err(Error::identity_mismatch(
                &node.uuid,
                "declared EK certificate differs from the registrar's",
            ));
        }

        debug!(uuid = %node.uuid, "EK certificate matches registrar record");
        Ok(())
    }
}
