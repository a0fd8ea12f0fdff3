//! Signing authority backend
//!
//! Signing requests are Kubernetes `CertificateSigningRequest` objects
//! addressed to the kube-apiserver client signer. The operator approves its
//! own requests; the controller manager signs them asynchronously.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestSpec, CertificateSigningRequestStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use serde_json::json;
use tracing::debug;

use crate::Error;

/// Reason recorded on approvals granted by this operator
pub const APPROVAL_REASON: &str = "EdgeNodeControllerApproval";

/// Key usages requested for device client certificates
const CLIENT_USAGES: [&str; 3] = ["digital signature", "key encipherment", "client auth"];

/// Where a signing request stands with the authority
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ApprovalState {
    /// Not yet decided
    Pending,
    /// Approved; the certificate may still be pending
    Approved,
    /// Rejected by an approver
    Denied(String),
    /// The signer failed to issue a certificate
    Failed(String),
}

/// One in-flight signing request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningRequest {
    /// Request name, derived from the node uuid
    pub name: String,
    /// PEM CSR
    pub request_pem: String,
    /// Approval state
    pub approval: ApprovalState,
    /// PEM certificate once issued
    pub certificate: Option<String>,
}

impl SigningRequest {
    /// Whether the request may still produce a certificate
    pub fn is_unresolved(&self) -> bool {
        match self.approval {
            ApprovalState::Pending => true,
            ApprovalState::Approved => self.certificate.is_none(),
            ApprovalState::Denied(_) | ApprovalState::Failed(_) => false,
        }
    }
}

/// Named signing requests at the authority
///
/// Implementations report their failures with the issuance taxonomy:
/// `create` fails with [`Error::DuplicateRequest`] or
/// [`Error::SubmissionFailed`], `approve` with [`Error::ApprovalFailed`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SigningAuthority: Send + Sync {
    /// Look up a request by name
    async fn get(&self, name: &str) -> Result<Option<SigningRequest>, Error>;

    /// Submit a new request
    async fn create(&self, name: &str, request_pem: &str) -> Result<(), Error>;

    /// Attach an approval to a pending request
    async fn approve(&self, name: &str) -> Result<(), Error>;

    /// Delete a request; deleting a missing request succeeds
    async fn delete(&self, name: &str) -> Result<(), Error>;
}

/// Signing authority backed by the certificates.k8s.io API
pub struct KubeSigningAuthority {
    client: Client,
    signer_name: String,
    expiration_seconds: Option<i32>,
}

impl KubeSigningAuthority {
    /// Create an authority issuing through `signer_name`
    pub fn new(client: Client, signer_name: impl Into<String>, expiration_seconds: Option<i32>) -> Self {
        Self {
            client,
            signer_name: signer_name.into(),
            expiration_seconds,
        }
    }

    fn api(&self) -> Api<CertificateSigningRequest> {
        Api::all(self.client.clone())
    }
}

/// Translate a CSR object into the domain view
fn to_signing_request(csr: &CertificateSigningRequest) -> SigningRequest {
    let status = csr.status.as_ref();
    SigningRequest {
        name: csr.metadata.name.clone().unwrap_or_default(),
        request_pem: String::from_utf8_lossy(&csr.spec.request.0).into_owned(),
        approval: approval_state(status),
        certificate: status
            .and_then(|s| s.certificate.as_ref())
            .filter(|c| !c.0.is_empty())
            .map(|c| String::from_utf8_lossy(&c.0).into_owned()),
    }
}

/// Derive the approval state from the status conditions
///
/// Denied and Failed win over Approved, matching how the API server treats
/// a request carrying several terminal conditions.
fn approval_state(status: Option<&CertificateSigningRequestStatus>) -> ApprovalState {
    let conditions = status.and_then(|s| s.conditions.as_ref());
    let find = |type_: &str| {
        conditions
            .into_iter()
            .flatten()
            .find(|c| c.type_ == type_ && c.status == "True")
    };

    let describe = |c: &k8s_openapi::api::certificates::v1::CertificateSigningRequestCondition| {
        c.message
            .clone()
            .or_else(|| c.reason.clone())
            .unwrap_or_default()
    };

    if let Some(c) = find("Denied") {
        ApprovalState::Denied(describe(c))
    } else if let Some(c) = find("Failed") {
        ApprovalState::Failed(describe(c))
    } else if find("Approved").is_some() {
        ApprovalState::Approved
    } else {
        ApprovalState::Pending
    }
}

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == code)
}

#[async_trait]
impl SigningAuthority for KubeSigningAuthority {
    async fn get(&self, name: &str) -> Result<Option<SigningRequest>, Error> {
        let csr = self.api().get_opt(name).await?;
        Ok(csr.as_ref().map(to_signing_request))
    }

    async fn create(&self, name: &str, request_pem: &str) -> Result<(), Error> {
        let csr = CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    [(
                        "app.kubernetes.io/managed-by".to_string(),
                        crate::CONTROLLER_NAME.to_string(),
                    )]
                    .into(),
                ),
                ..Default::default()
            },
            spec: CertificateSigningRequestSpec {
                request: ByteString(request_pem.as_bytes().to_vec()),
                signer_name: self.signer_name.clone(),
                expiration_seconds: self.expiration_seconds,
                usages: Some(CLIENT_USAGES.iter().map(|u| u.to_string()).collect()),
                ..Default::default()
            },
            status: None,
        };

        match self.api().create(&PostParams::default(), &csr).await {
            Ok(_) => {
                debug!(csr = %name, signer = %self.signer_name, "Submitted signing request");
                Ok(())
            }
            Err(e) if is_status(&e, 409) => Err(Error::DuplicateRequest {
                name: name.to_string(),
            }),
            Err(e) => Err(Error::submission_failed(name, e.to_string())),
        }
    }

    async fn approve(&self, name: &str) -> Result<(), Error> {
        let patch = json!({
            "status": {
                "conditions": [{
                    "type": "Approved",
                    "status": "True",
                    "reason": APPROVAL_REASON,
                    "message": "This CSR was approved by the edge node controller",
                    "lastUpdateTime": Utc::now().to_rfc3339(),
                }]
            }
        });

        self.api()
            .patch_approval(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| Error::approval_failed(name, e.to_string()))?;

        debug!(csr = %name, "Approved signing request");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        match self.api().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_status(&e, 404) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
