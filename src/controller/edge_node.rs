//! EdgeNode controller
//!
//! Each pass reads the declared node status, runs one step of the
//! [`BootstrapMachine`] and writes the result back to the resource status.
//! Generation guards keep a re-delivered watch event from issuing a second
//! certificate or revoking twice for the same spec.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::{debug, error, info, instrument, warn};

use super::machine::{BootstrapMachine, Directive, Outcome};
use crate::crd::{Condition, ConditionStatus, EdgeNode, EdgeNodeStatus, NodeStatus};
use crate::events::{actions, reasons, EventPublisher};
use crate::identity::{resource_key, NodeIdentity};
use crate::{Error, FIELD_MANAGER};

/// Condition reporting whether credentials reached the node
pub const CONDITION_CREDENTIALS_DELIVERED: &str = "CredentialsDelivered";
/// Condition reporting whether the node's access scope was emptied
pub const CONDITION_ACCESS_REVOKED: &str = "AccessRevoked";
/// Condition reporting whether the spec passed validation
pub const CONDITION_SPEC_VALID: &str = "SpecValid";

/// Writes EdgeNode status
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusClient: Send + Sync {
    /// Merge the given status into the resource's status subresource
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &EdgeNodeStatus,
    ) -> Result<(), Error>;
}

/// [`StatusClient`] backed by the Kubernetes API
pub struct KubeStatusClient {
    client: Client,
}

impl KubeStatusClient {
    /// Create a new KubeStatusClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusClient for KubeStatusClient {
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &EdgeNodeStatus,
    ) -> Result<(), Error> {
        let api: Api<EdgeNode> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = serde_json::json!({ "status": status });

        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;
        Ok(())
    }
}

/// Shared state for the EdgeNode controller
pub struct Context {
    /// Bootstrap state machine
    pub machine: BootstrapMachine,
    /// Status writer
    pub status: Arc<dyn StatusClient>,
    /// Event publisher for observed status changes and validation failures
    pub events: Arc<dyn EventPublisher>,
}

impl Context {
    /// Create a controller context writing status through the given client
    pub fn new(client: Client, machine: BootstrapMachine, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            machine,
            status: Arc::new(KubeStatusClient::new(client)),
            events,
        }
    }

    /// Create a context for testing with a mock status client
    #[cfg(test)]
    pub fn for_testing(
        machine: BootstrapMachine,
        status: Arc<dyn StatusClient>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            machine,
            status,
            events,
        }
    }
}

/// Reconcile one EdgeNode
///
/// Runs at most one state-machine step. Retryable failures requeue after the
/// configured delay; permanent failures are returned so [`error_policy`]
/// parks the resource until its spec changes.
#[instrument(skip(node, ctx), fields(edge_node = %resource_key(&node)))]
pub async fn reconcile(node: Arc<EdgeNode>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = node.name_any();
    let namespace = node.namespace().unwrap_or_default();
    let generation = node.metadata.generation;
    let declared = node.spec.node_status;
    let object_ref = node.object_ref(&());
    let current = node.status.clone().unwrap_or_default();

    if let Err(e) = node.spec.validate() {
        warn!(error = %e, "EdgeNode validation failed");
        ctx.events
            .publish(
                &object_ref,
                EventType::Warning,
                reasons::VALIDATION_FAILED,
                actions::RECONCILE,
                Some(e.to_string()),
            )
            .await;
        let status = current
            .observe(generation, declared)
            .delivered(false)
            .message(e.to_string())
            .condition(Condition::new(
                CONDITION_SPEC_VALID,
                ConditionStatus::False,
                reasons::VALIDATION_FAILED,
                e.to_string(),
            ));
        write_status(&ctx, &namespace, &name, &status).await;
        return Ok(Action::await_change());
    }

    match declared {
        NodeStatus::Registered if current.delivered_for(generation) => {
            debug!("credentials already delivered for this generation");
            return Ok(Action::await_change());
        }
        NodeStatus::Unattested if current.revoked_for(generation) => {
            debug!("access already revoked for this generation");
            return Ok(Action::await_change());
        }
        _ => {}
    }

    if current.observed_node_status != Some(declared) {
        publish_observed(&ctx, &object_ref, declared).await;
    }

    info!(node_status = %declared, "reconciling edge node");
    let identity = NodeIdentity::from_resource(&node);
    let outcome = ctx.machine.step(&identity, &object_ref).await;

    let status = next_status(current, generation, declared, &outcome);
    write_status(&ctx, &namespace, &name, &status).await;

    match outcome.into_directive(ctx.machine.retry_delay()) {
        Directive::Complete => Ok(Action::await_change()),
        Directive::RetryAfter(delay) => Ok(Action::requeue(delay)),
        Directive::Error(e) => Err(e),
    }
}

/// Decide what to do after a failed reconcile
pub fn error_policy(node: Arc<EdgeNode>, error: &Error, ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        edge_node = %resource_key(&node),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(ctx.machine.retry_delay())
    } else {
        Action::await_change()
    }
}

/// Status after one step, built on top of the previous status
fn next_status(
    current: EdgeNodeStatus,
    generation: Option<i64>,
    declared: NodeStatus,
    outcome: &Outcome,
) -> EdgeNodeStatus {
    let status = current
        .observe(generation, declared)
        .condition(Condition::new(
            CONDITION_SPEC_VALID,
            ConditionStatus::True,
            "SpecValid",
            "spec passed validation",
        ));

    match (declared, outcome) {
        (NodeStatus::Registered, Outcome::Advanced) => status
            .delivered(true)
            .revoked(false)
            .message("credentials delivered")
            .condition(Condition::new(
                CONDITION_CREDENTIALS_DELIVERED,
                ConditionStatus::True,
                reasons::CREDENTIALS_DELIVERED,
                "credentials delivered to the provisioning endpoint",
            )),
        (NodeStatus::Unattested, Outcome::Advanced) => status
            .revoked(true)
            .delivered(false)
            .message("access revoked")
            .condition(Condition::new(
                CONDITION_ACCESS_REVOKED,
                ConditionStatus::True,
                reasons::ACCESS_REVOKED,
                "access scope emptied",
            )),
        (NodeStatus::Registered, Outcome::Retry(e) | Outcome::Failed(e)) => status
            .delivered(false)
            .message(e.to_string())
            .condition(Condition::new(
                CONDITION_CREDENTIALS_DELIVERED,
                ConditionStatus::False,
                failure_reason(e),
                e.to_string(),
            )),
        (NodeStatus::Unattested, Outcome::Retry(e) | Outcome::Failed(e)) => status
            .revoked(false)
            .message(e.to_string())
            .condition(Condition::new(
                CONDITION_ACCESS_REVOKED,
                ConditionStatus::False,
                failure_reason(e),
                e.to_string(),
            )),
        (_, Outcome::Retry(e) | Outcome::Failed(e)) => status.message(e.to_string()),
        (NodeStatus::Unregistered, _) => status.message("waiting for registration"),
        (NodeStatus::Attested, _) => status.message("node attested"),
        (_, Outcome::NoOp | Outcome::Advanced) => status,
    }
}

fn failure_reason(error: &Error) -> &'static str {
    if error.is_security_failure() {
        reasons::IDENTITY_MISMATCH
    } else {
        reasons::BOOTSTRAP_FAILED
    }
}

/// Announce a newly observed declared status
async fn publish_observed(
    ctx: &Context,
    object_ref: &ObjectReference,
    declared: NodeStatus,
) {
    let (type_, reason) = match declared {
        NodeStatus::Unregistered => (EventType::Normal, reasons::EDGE_NODE_UNREGISTERED),
        NodeStatus::Registered => (EventType::Normal, reasons::EDGE_NODE_REGISTERED),
        NodeStatus::Unattested => (EventType::Warning, reasons::EDGE_NODE_UNATTESTED),
        NodeStatus::Attested => (EventType::Normal, reasons::EDGE_NODE_ATTESTED),
        // Reported by the machine as InvalidState
        NodeStatus::Unrecognized => return,
    };

    ctx.events
        .publish(
            object_ref,
            type_,
            reason,
            actions::RECONCILE,
            Some(format!("node status is {declared}")),
        )
        .await;
}

/// Write status; a failed write is logged and the next pass rewrites it
async fn write_status(ctx: &Context, namespace: &str, name: &str, status: &EdgeNodeStatus) {
    if let Err(e) = ctx.status.patch_status(namespace, name, status).await {
        warn!(error = %e, "failed to update EdgeNode status");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::MockAttestor;
    use crate::config::ControllerConfig;
    use crate::crd::EdgeNodeSpec;
    use crate::events::{MockEventPublisher, NoopEventPublisher};
    use crate::issuer::{IssuedCredentials, MockIssuer};
    use crate::pki::PrivateKeyPem;
    use crate::provisioning::MockProvisioner;
    use crate::rbac::MockAccessScopes;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::Mutex;
    use std::time::Duration;

    fn edge_node(
        uuid: &str,
        node_status: NodeStatus,
        generation: i64,
        status: Option<EdgeNodeStatus>,
    ) -> Arc<EdgeNode> {
        Arc::new(EdgeNode {
            metadata: ObjectMeta {
                name: Some("edge-01".to_string()),
                namespace: Some("edge".to_string()),
                generation: Some(generation),
                ..Default::default()
            },
            spec: EdgeNodeSpec {
                uuid: uuid.to_string(),
                node_status,
                ek_cert: "ek".to_string(),
                mb_refstate: "{}".to_string(),
            },
            status,
        })
    }

    /// Captures status writes for later verification
    #[derive(Clone, Default)]
    struct StatusCapture {
        updates: Arc<Mutex<Vec<EdgeNodeStatus>>>,
    }

    impl StatusCapture {
        fn client(&self) -> Arc<dyn StatusClient> {
            let updates = self.updates.clone();
            let mut mock = MockStatusClient::new();
            mock.expect_patch_status()
                .withf(|ns, name, _| ns == "edge" && name == "edge-01")
                .returning(move |_, _, status| {
                    updates.lock().unwrap().push(status.clone());
                    Ok(())
                });
            Arc::new(mock)
        }

        fn last(&self) -> Option<EdgeNodeStatus> {
            self.updates.lock().unwrap().last().cloned()
        }

        fn count(&self) -> usize {
            self.updates.lock().unwrap().len()
        }
    }

    struct Components {
        attestor: MockAttestor,
        issuer: MockIssuer,
        scopes: MockAccessScopes,
        provisioner: MockProvisioner,
    }

    impl Components {
        /// Components that must not be called
        fn untouched() -> Self {
            let mut attestor = MockAttestor::new();
            attestor.expect_verify().never();
            let mut issuer = MockIssuer::new();
            issuer.expect_issue().never();
            let mut scopes = MockAccessScopes::new();
            scopes.expect_grant().never();
            scopes.expect_revoke().never();
            let mut provisioner = MockProvisioner::new();
            provisioner.expect_deliver().never();
            Self {
                attestor,
                issuer,
                scopes,
                provisioner,
            }
        }

        /// Components for one successful bootstrap pass
        fn bootstrap_once() -> Self {
            let mut attestor = MockAttestor::new();
            attestor.expect_verify().times(1).returning(|_| Ok(()));
            let mut issuer = MockIssuer::new();
            issuer.expect_issue().times(1).returning(|_| {
                Ok(IssuedCredentials {
                    certificate_pem: "CERT".to_string(),
                    private_key_pem: PrivateKeyPem::new("KEY".to_string()),
                    cleanup_error: None,
                })
            });
            let mut scopes = MockAccessScopes::new();
            scopes.expect_grant().times(1).returning(|_| Ok(()));
            let mut provisioner = MockProvisioner::new();
            provisioner
                .expect_deliver()
                .times(1)
                .returning(|_, _, _| Ok(()));
            Self {
                attestor,
                issuer,
                scopes,
                provisioner,
            }
        }

        fn context(self, status: Arc<dyn StatusClient>, events: Arc<dyn EventPublisher>) -> Arc<Context> {
            let machine = BootstrapMachine::new(
                Arc::new(self.attestor),
                Arc::new(self.issuer),
                Arc::new(self.scopes),
                Arc::new(self.provisioner),
                Arc::new(NoopEventPublisher),
                ControllerConfig::default(),
            );
            Arc::new(Context::for_testing(machine, status, events))
        }
    }

    /// Story: A registered node is bootstrapped once per generation
    ///
    /// The first pass delivers credentials and records that in status. A
    /// repeated watch event for the same generation finds the delivered
    /// flag and makes no further calls.
    #[tokio::test]
    async fn story_registered_node_is_bootstrapped_once() {
        let capture = StatusCapture::default();
        let ctx = Components::bootstrap_once().context(capture.client(), Arc::new(NoopEventPublisher));

        let node = edge_node("edge-1", NodeStatus::Registered, 1, None);
        let action = reconcile(node, ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());

        let status = capture.last().unwrap();
        assert!(status.credentials_delivered);
        assert_eq!(status.observed_generation, Some(1));
        assert_eq!(status.observed_node_status, Some(NodeStatus::Registered));
        assert!(status.conditions.iter().any(|c| {
            c.type_ == CONDITION_CREDENTIALS_DELIVERED && c.is_true()
        }));

        // Same generation again, now with the delivered status
        let node = edge_node("edge-1", NodeStatus::Registered, 1, Some(status));
        let action = reconcile(node, ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(capture.count(), 1);
    }

    #[tokio::test]
    async fn new_generation_bootstraps_again() {
        let capture = StatusCapture::default();
        let ctx = Components::bootstrap_once().context(capture.client(), Arc::new(NoopEventPublisher));

        let previous = EdgeNodeStatus::default()
            .observe(Some(1), NodeStatus::Registered)
            .delivered(true);
        let node = edge_node("edge-1", NodeStatus::Registered, 2, Some(previous));
        reconcile(node, ctx).await.unwrap();

        assert_eq!(capture.last().unwrap().observed_generation, Some(2));
    }

    #[tokio::test]
    async fn retryable_failure_requeues_and_records_the_error() {
        let capture = StatusCapture::default();
        let mut components = Components::untouched();
        components.attestor = MockAttestor::new();
        components
            .attestor
            .expect_verify()
            .returning(|node| Err(Error::registrar_unreachable(&node.uuid, "connection refused")));
        let ctx = components.context(capture.client(), Arc::new(NoopEventPublisher));

        let node = edge_node("edge-1", NodeStatus::Registered, 1, None);
        let action = reconcile(node, ctx).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(10)));

        let status = capture.last().unwrap();
        assert!(!status.credentials_delivered);
        assert!(status.message.unwrap().contains("connection refused"));
        assert!(status.conditions.iter().any(|c| {
            c.type_ == CONDITION_CREDENTIALS_DELIVERED
                && c.status == ConditionStatus::False
                && c.reason == reasons::BOOTSTRAP_FAILED
        }));
    }

    #[tokio::test]
    async fn identity_mismatch_is_recorded_as_such() {
        let capture = StatusCapture::default();
        let mut components = Components::untouched();
        components.attestor = MockAttestor::new();
        components
            .attestor
            .expect_verify()
            .returning(|node| Err(Error::identity_mismatch(&node.uuid, "ekcert differs")));
        let ctx = components.context(capture.client(), Arc::new(NoopEventPublisher));

        reconcile(edge_node("edge-1", NodeStatus::Registered, 1, None), ctx)
            .await
            .unwrap();

        let status = capture.last().unwrap();
        assert!(status
            .conditions
            .iter()
            .any(|c| c.reason == reasons::IDENTITY_MISMATCH));
    }

    /// Story: An unattested node loses access exactly once per generation
    #[tokio::test]
    async fn story_unattested_node_is_revoked_once() {
        let capture = StatusCapture::default();
        let mut components = Components::untouched();
        components.scopes = MockAccessScopes::new();
        components.scopes.expect_grant().never();
        components.scopes.expect_revoke().times(1).returning(|_| Ok(()));
        let ctx = components.context(capture.client(), Arc::new(NoopEventPublisher));

        let previous = EdgeNodeStatus::default()
            .observe(Some(1), NodeStatus::Registered)
            .delivered(true);
        let node = edge_node("edge-1", NodeStatus::Unattested, 2, Some(previous));
        reconcile(node, ctx.clone()).await.unwrap();

        let status = capture.last().unwrap();
        assert!(status.access_revoked);
        assert!(!status.credentials_delivered);

        let node = edge_node("edge-1", NodeStatus::Unattested, 2, Some(status));
        reconcile(node, ctx).await.unwrap();
        assert_eq!(capture.count(), 1);
    }

    #[tokio::test]
    async fn invalid_spec_is_parked_without_component_calls() {
        let capture = StatusCapture::default();
        let mut events = MockEventPublisher::new();
        events
            .expect_publish()
            .withf(|_, t, r, _, _| *t == EventType::Warning && r == reasons::VALIDATION_FAILED)
            .times(1)
            .return_const(());
        let ctx = Components::untouched().context(capture.client(), Arc::new(events));

        let node = edge_node("Not_A_Name", NodeStatus::Registered, 1, None);
        let action = reconcile(node, ctx).await.unwrap();
        assert_eq!(action, Action::await_change());

        let status = capture.last().unwrap();
        assert!(status.conditions.iter().any(|c| {
            c.type_ == CONDITION_SPEC_VALID && c.status == ConditionStatus::False
        }));
    }

    #[tokio::test]
    async fn unrecognized_status_is_a_permanent_error() {
        let capture = StatusCapture::default();
        let ctx = Components::untouched().context(capture.client(), Arc::new(NoopEventPublisher));

        let node = edge_node("edge-1", NodeStatus::Unrecognized, 1, None);
        let err = reconcile(node.clone(), ctx.clone()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert_eq!(error_policy(node, &err, ctx), Action::await_change());
    }

    #[tokio::test]
    async fn status_change_event_is_published_once() {
        let capture = StatusCapture::default();
        let mut events = MockEventPublisher::new();
        events
            .expect_publish()
            .withf(|_, t, r, _, _| *t == EventType::Normal && r == reasons::EDGE_NODE_UNREGISTERED)
            .times(1)
            .return_const(());
        let ctx = Components::untouched().context(capture.client(), Arc::new(events));

        let node = edge_node("edge-1", NodeStatus::Unregistered, 1, None);
        reconcile(node, ctx.clone()).await.unwrap();

        // Status now records the observed state, so no second event
        let node = edge_node("edge-1", NodeStatus::Unregistered, 1, capture.last());
        reconcile(node, ctx).await.unwrap();
    }

    #[tokio::test]
    async fn status_write_failure_does_not_fail_the_pass() {
        let mut status = MockStatusClient::new();
        status
            .expect_patch_status()
            .returning(|_, _, _| Err(Error::validation("conflict")));
        let ctx = Components::untouched().context(Arc::new(status), Arc::new(NoopEventPublisher));

        let node = edge_node("edge-1", NodeStatus::Attested, 1, None);
        assert_eq!(reconcile(node, ctx).await.unwrap(), Action::await_change());
    }

    #[test]
    fn error_policy_requeues_only_retryable_errors() {
        let ctx = Components::untouched().context(
            StatusCapture::default().client(),
            Arc::new(NoopEventPublisher),
        );
        let node = edge_node("edge-1", NodeStatus::Registered, 1, None);

        let retry = error_policy(
            node.clone(),
            &Error::approval_failed("edge-1-csr", "timed out"),
            ctx.clone(),
        );
        assert_eq!(retry, Action::requeue(Duration::from_secs(10)));

        let park = error_policy(node, &Error::validation("bad"), ctx);
        assert_eq!(park, Action::await_change());
    }
}
