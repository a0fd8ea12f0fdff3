//! EdgeNode operator - hardware-rooted trust bootstrap for edge devices
//!
//! The operator watches `EdgeNode` resources and drives each TPM-backed device
//! from "claims to exist" to "cryptographically admitted": it cross-checks the
//! device identity against a remote-attestation registrar, issues a client
//! certificate through the cluster signing authority, grants a least-privilege
//! scope, and delivers the credentials plus reference measurements to a
//! provisioning endpoint. A device that later fails attestation loses its scope.
//!
//! # Modules
//!
//! - [`crd`] - The `EdgeNode` custom resource
//! - [`identity`] - Node identity and the names derived from its uuid
//! - [`controller`] - Bootstrap state machine and reconciler
//! - [`attestation`] - Endorsement-key cross-check against the registrar
//! - [`issuer`] - Certificate signing request lifecycle
//! - [`rbac`] - Access scope grant and revocation
//! - [`provisioning`] - Credential archive packaging and delivery
//! - [`pki`] - Key and CSR generation
//! - [`discovery`] - Service address resolution
//! - [`events`] - Kubernetes Event publishing
//! - [`config`] - Operator configuration
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod attestation;
pub mod config;
pub mod controller;
pub mod crd;
pub mod discovery;
pub mod error;
pub mod events;
pub mod identity;
pub mod issuer;
pub mod pki;
pub mod provisioning;
pub mod rbac;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager name used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "edgenode-controller";

/// Controller name reported on Kubernetes Events
pub const CONTROLLER_NAME: &str = "edgenode-controller";
