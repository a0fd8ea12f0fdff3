//! Kubernetes Events for EdgeNode resources
//!
//! Operators read the bootstrap history of a device with
//! `kubectl describe edgenode`. Publishing never fails a pass: a rejected
//! event is logged and dropped.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::warn;

/// Sink for EdgeNode events
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Attach an event with `reason` and `action` to the referenced EdgeNode
    async fn publish(
        &self,
        node_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher writing through the events.k8s.io API
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Report as `controller_name`, with the pod name as instance when known
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.into(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        node_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.into(),
            note,
            action: action.into(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, node_ref).await {
            warn!(
                node = ?node_ref.name,
                reason,
                error = %e,
                "Dropping EdgeNode event"
            );
        }
    }
}

/// Publisher that discards everything
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _node_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons (the REASON column)
pub mod reasons {
    /// Node declared but not yet known to the registrar
    pub const EDGE_NODE_UNREGISTERED: &str = "EdgeNodeUnregistered";
    /// Node registered; a bootstrap pass follows
    pub const EDGE_NODE_REGISTERED: &str = "EdgeNodeRegistered";
    /// Node failed attestation
    pub const EDGE_NODE_UNATTESTED: &str = "EdgeNodeUnattested";
    /// Node passed attestation
    pub const EDGE_NODE_ATTESTED: &str = "EdgeNodeAttested";
    /// Declared status outside the transition graph
    pub const INVALID_STATE: &str = "InvalidState";
    /// Spec rejected before any network call
    pub const VALIDATION_FAILED: &str = "ValidationFailed";

    /// Registrar EK certificate differs from the declared one
    pub const IDENTITY_MISMATCH: &str = "IdentityMismatch";
    /// A bootstrap step failed
    pub const BOOTSTRAP_FAILED: &str = "BootstrapFailed";
    /// Credentials accepted by the provisioning endpoint
    pub const CREDENTIALS_DELIVERED: &str = "CredentialsDelivered";
    /// Access scope emptied
    pub const ACCESS_REVOKED: &str = "AccessRevoked";
    /// Signing request left behind after issuance
    pub const SIGNING_REQUEST_CLEANUP_FAILED: &str = "SigningRequestCleanupFailed";
}

/// Event actions (the ACTION column)
pub mod actions {
    /// Whole-pass handling
    pub const RECONCILE: &str = "Reconcile";
    /// Registrar cross-check
    pub const ATTEST: &str = "Attest";
    /// Certificate issuance
    pub const ISSUE: &str = "Issue";
    /// Scope grant or revocation
    pub const AUTHORIZE: &str = "Authorize";
    /// Credential upload
    pub const DELIVER: &str = "Deliver";
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn reasons_are_unique() {
        let all = [
            reasons::EDGE_NODE_UNREGISTERED,
            reasons::EDGE_NODE_REGISTERED,
            reasons::EDGE_NODE_UNATTESTED,
            reasons::EDGE_NODE_ATTESTED,
            reasons::INVALID_STATE,
            reasons::VALIDATION_FAILED,
            reasons::IDENTITY_MISMATCH,
            reasons::BOOTSTRAP_FAILED,
            reasons::CREDENTIALS_DELIVERED,
            reasons::ACCESS_REVOKED,
            reasons::SIGNING_REQUEST_CLEANUP_FAILED,
        ];
        let distinct: HashSet<_> = all.iter().collect();
        assert_eq!(distinct.len(), all.len());
    }

    /// Event reasons must be UpperCamelCase without separators
    #[test]
    fn reasons_are_camel_case() {
        for reason in [
            reasons::EDGE_NODE_REGISTERED,
            reasons::IDENTITY_MISMATCH,
            reasons::SIGNING_REQUEST_CLEANUP_FAILED,
        ] {
            assert!(reason.starts_with(|c: char| c.is_ascii_uppercase()));
            assert!(reason.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[tokio::test]
    async fn discarding_publisher_accepts_any_event() {
        let node_ref = ObjectReference {
            kind: Some("EdgeNode".into()),
            name: Some("edge-01".into()),
            ..Default::default()
        };
        NoopEventPublisher
            .publish(
                &node_ref,
                EventType::Warning,
                reasons::IDENTITY_MISMATCH,
                actions::ATTEST,
                None,
            )
            .await;
    }
}
