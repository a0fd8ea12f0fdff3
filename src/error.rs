//! Error types for the edge node operator
//!
//! Every component returns a typed failure to the bootstrap state machine,
//! which decides between retrying later and surfacing a permanent error.

use thiserror::Error;

/// Main error type for edge node bootstrap operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The registrar could not be reached or did not answer with 200
    #[error("registrar unreachable for {uuid}: {message}")]
    RegistrarUnreachable {
        /// Node the query was issued for
        uuid: String,
        /// What went wrong
        message: String,
    },

    /// The registrar's EK certificate differs from the operator-declared one
    #[error("TPM identity mismatch for {uuid}: {message}")]
    IdentityMismatch {
        /// Node whose identity could not be validated
        uuid: String,
        /// What differed
        message: String,
    },

    /// An unresolved signing request already exists for this node
    #[error("signing request {name} already exists")]
    DuplicateRequest {
        /// Name of the pre-existing request
        name: String,
    },

    /// Submitting the signing request failed
    #[error("signing request submission failed for {name}: {message}")]
    SubmissionFailed {
        /// Name of the request
        name: String,
        /// What went wrong
        message: String,
    },

    /// Approving or waiting for the certificate failed
    #[error("signing request approval failed for {name}: {message}")]
    ApprovalFailed {
        /// Name of the request
        name: String,
        /// What went wrong
        message: String,
    },

    /// Delivering the credential archive to the provisioning endpoint failed
    #[error("credential delivery failed for {uuid}{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    DeliveryFailed {
        /// Node the credentials were meant for
        uuid: String,
        /// HTTP status returned by the endpoint, if one was received
        status: Option<u16>,
        /// What went wrong
        message: String,
    },

    /// Creating the access scope or its binding failed
    #[error("access scope creation failed for {name}: {message}")]
    ScopeCreateFailed {
        /// Name of the scope
        name: String,
        /// What went wrong
        message: String,
    },

    /// The access scope to update does not exist
    ///
    /// Available to [`crate::rbac::ScopeStore`] implementations. Revocation
    /// never raises it: a missing scope already grants nothing, so
    /// [`crate::rbac::AccessScopes::revoke`] succeeds instead.
    #[error("access scope {name} not found")]
    ScopeNotFound {
        /// Name of the scope
        name: String,
    },

    /// The declared node status is not part of the transition graph
    #[error("invalid node state for node {uuid}")]
    InvalidState {
        /// Node carrying the invalid state
        uuid: String,
    },

    /// A bootstrap pass ran past its deadline
    #[error("bootstrap timed out: {0}")]
    Timeout(String),

    /// A collaborating service could not be located
    #[error("service discovery failed: {0}")]
    Discovery(String),

    /// Validation error for EdgeNode specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Operator configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Key or certificate handling error
    #[error("pki error: {0}")]
    Pki(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a registrar error for the given node
    pub fn registrar_unreachable(uuid: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::RegistrarUnreachable {
            uuid: uuid.into(),
            message: msg.into(),
        }
    }

    /// Create an identity mismatch error for the given node
    pub fn identity_mismatch(uuid: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::IdentityMismatch {
            uuid: uuid.into(),
            message: msg.into(),
        }
    }

    /// Create a submission error for the named signing request
    pub fn submission_failed(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::SubmissionFailed {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create an approval error for the named signing request
    pub fn approval_failed(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ApprovalFailed {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a delivery error, optionally carrying the HTTP status
    pub fn delivery_failed(
        uuid: impl Into<String>,
        status: Option<u16>,
        msg: impl Into<String>,
    ) -> Self {
        Self::DeliveryFailed {
            uuid: uuid.into(),
            status,
            message: msg.into(),
        }
    }

    /// Create a scope creation error for the named scope
    pub fn scope_create_failed(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::ScopeCreateFailed {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error with the given message
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Create a discovery error with the given message
    pub fn discovery(msg: impl Into<String>) -> Self {
        Self::Discovery(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a PKI error with the given message
    pub fn pki(msg: impl Into<String>) -> Self {
        Self::Pki(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Whether a later reconciliation pass could plausibly succeed
    ///
    /// Invalid states, spec validation and configuration problems need a
    /// human to change something; everything else may recover.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::InvalidState { .. } | Error::Validation(_) | Error::Config(_)
        )
    }

    /// Whether this error may indicate a spoofed device identity
    pub fn is_security_failure(&self) -> bool {
        matches!(self, Error::IdentityMismatch { .. })
    }
}

/// Longest response body kept in an error message
const MAX_BODY_EXCERPT: usize = 256;

/// Shorten an HTTP response body for inclusion in an error
pub(crate) fn body_excerpt(body: &str) -> String {
    let body = body.trim();
    match body.char_indices().nth(MAX_BODY_EXCERPT) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}
