//! Certificate issuance through the cluster signing authority
//!
//! One pass submits exactly one signing request per node:
//!
//! 1. refuse if an unresolved request with the node's name is still around,
//!    and remove a resolved one left by an earlier pass
//! 2. generate a key and CSR (`CN=<uuid>`)
//! 3. submit, then approve unless already approved
//! 4. poll for the certificate, bounded by `max_wait`
//! 5. delete the request and check the certificate
//!
//! A submitted request is deleted on every exit path, including the pass
//! being cancelled mid-issuance. The key and certificate are only ever held
//! in memory.

mod authority;

pub use authority::{
    ApprovalState, KubeSigningAuthority, SigningAuthority, SigningRequest, APPROVAL_REASON,
};
#[cfg(test)]
pub use authority::MockSigningAuthority;

use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::IssuerConfig;
use crate::identity::NodeIdentity;
use crate::pki::{NodeCertRequest, PrivateKeyPem};
use crate::Error;

/// Credentials produced by one issuance
pub struct IssuedCredentials {
    /// PEM certificate whose subject CN is the node uuid
    pub certificate_pem: String,
    /// PKCS#1 PEM private key
    pub private_key_pem: PrivateKeyPem,
    /// Set when the signing request could not be deleted afterwards
    ///
    /// The certificate is usable regardless; the next issuance for this node
    /// removes the leftover request before submitting its own.
    pub cleanup_error: Option<Error>,
}

impl std::fmt::Debug for IssuedCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCredentials")
            .field("certificate_pem", &self.certificate_pem)
            .field("private_key_pem", &"<redacted>")
            .field("cleanup_error", &self.cleanup_error)
            .finish()
    }
}

/// Issues client credentials for a node
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Issuer: Send + Sync {
    /// Issue a private key and certificate for the node
    async fn issue(&self, node: &NodeIdentity) -> Result<IssuedCredentials, Error>;
}

/// Issuer driving a [`SigningAuthority`]
pub struct CertificateIssuer {
    authority: Arc<dyn SigningAuthority>,
    config: IssuerConfig,
}

impl CertificateIssuer {
    /// Create an issuer over the given authority
    pub fn new(authority: Arc<dyn SigningAuthority>, config: IssuerConfig) -> Self {
        Self { authority, config }
    }

    /// Refuse an unresolved request with the node's name; delete a resolved one
    ///
    /// Pending requests, and approved ones still waiting for their
    /// certificate, may yet produce credentials, so a second submission
    /// would race them. Issued, denied and failed requests are finished and
    /// only block the name.
    async fn clear_resolved_leftover(&self, name: &str) -> Result<(), Error> {
        let Some(existing) = self
            .authority
            .get(name)
            .await
            .map_err(|e| Error::submission_failed(name, e.to_string()))?
        else {
            return Ok(());
        };

        if existing.is_unresolved() {
            return Err(Error::DuplicateRequest {
                name: name.to_string(),
            });
        }

        info!(csr = %name, approval = ?existing.approval, "Removing resolved signing request left by an earlier pass");
        self.authority.delete(name).await.map_err(|e| {
            Error::submission_failed(name, format!("could not remove resolved request: {e}"))
        })
    }

    /// Approve the request unless it is already approved
    async fn ensure_approved(&self, name: &str) -> Result<(), Error> {
        let request = self
            .authority
            .get(name)
            .await
            .map_err(|e| Error::approval_failed(name, e.to_string()))?
            .ok_or_else(|| Error::approval_failed(name, "request vanished after submission"))?;

        match request.approval {
            ApprovalState::Approved => {
                debug!(csr = %name, "Signing request already approved");
                Ok(())
            }
            ApprovalState::Pending => self.authority.approve(name).await,
            ApprovalState::Denied(msg) => Err(Error::approval_failed(name, format!("denied: {msg}"))),
            ApprovalState::Failed(msg) => Err(Error::approval_failed(name, format!("failed: {msg}"))),
        }
    }

    /// Poll until the certificate is issued or `max_wait` passes
    async fn wait_for_certificate(&self, name: &str) -> Result<String, Error> {
        let deadline = Instant::now() + self.config.max_wait;

        loop {
            let request = self
                .authority
                .get(name)
                .await
                .map_err(|e| Error::approval_failed(name, e.to_string()))?
                .ok_or_else(|| Error::approval_failed(name, "request vanished before issuance"))?;

            match request.approval {
                ApprovalState::Denied(msg) => {
                    return Err(Error::approval_failed(name, format!("denied: {msg}")))
                }
                ApprovalState::Failed(msg) => {
                    return Err(Error::approval_failed(name, format!("failed: {msg}")))
                }
                ApprovalState::Approved | ApprovalState::Pending => {}
            }

            if let Some(certificate) = request.certificate {
                return Ok(certificate);
            }

            if Instant::now() >= deadline {
                return Err(Error::approval_failed(
                    name,
                    format!(
                        "certificate not issued within {}s",
                        self.config.max_wait.as_secs_f64()
                    ),
                ));
            }

            trace!(csr = %name, "Certificate not issued yet");
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

#[async_trait]
impl Issuer for CertificateIssuer {
    async fn issue(&self, node: &NodeIdentity) -> Result<IssuedCredentials, Error> {
        let name = node.csr_name();
        self.clear_resolved_leftover(&name).await?;

        // RSA key generation takes long enough to stall the runtime
        let uuid = node.uuid.clone();
        let request = tokio::task::spawn_blocking(move || NodeCertRequest::new(&uuid))
            .await
            .map_err(|e| Error::pki(format!("key generation task failed: {e}")))??;

        let submitted = SubmittedRequest::new(self.authority.clone(), &name);
        if let Err(e) = self.authority.create(&name, request.csr_pem()).await {
            submitted.settle();
            return Err(e);
        }
        info!(uuid = %node.uuid, csr = %name, "Submitted signing request");

        let certificate = match self.ensure_approved(&name).await {
            Ok(()) => self.wait_for_certificate(&name).await,
            Err(e) => Err(e),
        };

        let certificate = match certificate {
            Ok(certificate) => certificate,
            Err(e) => {
                // Leaving the request behind would block every later attempt
                if let Err(cleanup) = self.authority.delete(&name).await {
                    warn!(csr = %name, error = %cleanup, "Failed to delete abandoned signing request");
                }
                submitted.settle();
                return Err(e);
            }
        };

        let cleanup_error = match self.authority.delete(&name).await {
            Ok(()) => None,
            Err(e) => {
                warn!(csr = %name, error = %e, "Failed to delete signing request after issuance");
                Some(e)
            }
        };
        submitted.settle();

        request.check_issued(&certificate)?;
        info!(uuid = %node.uuid, "Issued client certificate");

        Ok(IssuedCredentials {
            certificate_pem: certificate,
            private_key_pem: request.into_private_key(),
            cleanup_error,
        })
    }
}

/// Deletes a submitted signing request if issuance is dropped before it
/// settles
///
/// A pass cancelled between submission and cleanup (the pass deadline, or
/// controller shutdown) would otherwise orphan the request, and every later
/// pass would stop at the duplicate check.
struct SubmittedRequest {
    authority: Arc<dyn SigningAuthority>,
    name: String,
    settled: bool,
}

impl SubmittedRequest {
    fn new(authority: Arc<dyn SigningAuthority>, name: &str) -> Self {
        Self {
            authority,
            name: name.to_string(),
            settled: false,
        }
    }

    /// The request was deleted (or never created) on a normal exit path
    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for SubmittedRequest {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        let name = std::mem::take(&mut self.name);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(csr = %name, "No runtime left to delete cancelled signing request");
            return;
        };

        warn!(csr = %name, "Issuance cancelled, deleting signing request");
        let authority = self.authority.clone();
        runtime.spawn(async move {
            match authority.delete(&name).await {
                Ok(()) => debug!(csr = %name, "Deleted cancelled signing request"),
                Err(e) => {
                    warn!(csr = %name, error = %e, "Failed to delete cancelled signing request")
                }
            }
        });
    }
}
