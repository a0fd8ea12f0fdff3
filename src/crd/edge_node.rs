//! EdgeNode Custom Resource Definition
//!
//! An EdgeNode declares one TPM-backed edge device: its registrar uuid, the
//! endorsement-key certificate the operator expects, and the measured-boot
//! reference state that is forwarded to the provisioning endpoint.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, NodeStatus};

/// Longest suffix appended to the uuid when naming derived objects
const LONGEST_DERIVED_SUFFIX: &str = "-cluster-role-binding";

/// Maximum length of a Kubernetes object name
const MAX_OBJECT_NAME_LEN: usize = 253;

/// Specification for an EdgeNode
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "edgenode.attest.idlab.be",
    version = "v1alpha1",
    kind = "EdgeNode",
    plural = "edgenodes",
    shortname = "en",
    status = "EdgeNodeStatus",
    namespaced,
    printcolumn = r#"{"name":"UUID","type":"string","jsonPath":".spec.uuid"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".spec.nodeStatus"}"#,
    printcolumn = r#"{"name":"Delivered","type":"boolean","jsonPath":".status.credentialsDelivered"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct EdgeNodeSpec {
    /// Agent uuid as known to the registrar
    pub uuid: String,

    /// Declared lifecycle status
    #[serde(rename = "nodeStatus")]
    pub node_status: NodeStatus,

    /// PEM-encoded endorsement-key certificate expected for this device
    #[serde(rename = "ekcert", default)]
    pub ek_cert: String,

    /// Measured-boot reference state, forwarded as-is
    #[serde(rename = "mbrefstate", default)]
    pub mb_refstate: String,
}

impl EdgeNodeSpec {
    /// Validate the spec before any network call is made
    ///
    /// The uuid names cluster-scoped objects (signing requests, roles), so it
    /// must be usable as a Kubernetes object name once suffixed.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.uuid.is_empty() {
            return Err(crate::Error::validation("uuid must not be empty"));
        }

        if self.uuid.len() + LONGEST_DERIVED_SUFFIX.len() > MAX_OBJECT_NAME_LEN {
            return Err(crate::Error::validation(format!(
                "uuid '{}' is too long to derive object names from",
                self.uuid
            )));
        }

        let valid_chars = self
            .uuid
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
        let valid_edges = self
            .uuid
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric());

        if !valid_chars || !valid_edges {
            return Err(crate::Error::validation(format!(
                "uuid '{}' must consist of lowercase alphanumerics, '-' or '.' and start with an alphanumeric",
                self.uuid
            )));
        }

        Ok(())
    }
}

/// Status for an EdgeNode
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EdgeNodeStatus {
    /// Spec generation the status was computed for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Declared node status the last pass acted on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_node_status: Option<NodeStatus>,

    /// Whether credentials were delivered for `observed_generation`
    #[serde(default)]
    pub credentials_delivered: bool,

    /// Whether the access scope was revoked for `observed_generation`
    #[serde(default)]
    pub access_revoked: bool,

    /// Human-readable message about the last pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions representing the bootstrap state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl EdgeNodeStatus {
    /// Create a status observed at the given generation
    pub fn observed(generation: Option<i64>) -> Self {
        Self {
            observed_generation: generation,
            ..Default::default()
        }
    }

    /// Record the generation and declared status a pass acted on
    pub fn observe(mut self, generation: Option<i64>, node_status: NodeStatus) -> Self {
        self.observed_generation = generation;
        // An unrecognized value has no wire form the schema accepts
        if node_status != NodeStatus::Unrecognized {
            self.observed_node_status = Some(node_status);
        }
        self
    }

    /// Mark credentials as delivered and return self for chaining
    pub fn delivered(mut self, delivered: bool) -> Self {
        self.credentials_delivered = delivered;
        self
    }

    /// Mark the access scope as revoked and return self for chaining
    pub fn revoked(mut self, revoked: bool) -> Self {
        self.access_revoked = revoked;
        self
    }

    /// Set the human-readable message
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Set a condition, replacing one of the same type
    ///
    /// The transition time is kept when the condition status did not change.
    pub fn condition(mut self, mut condition: Condition) -> Self {
        if let Some(existing) = self
            .conditions
            .iter()
            .find(|c| c.type_ == condition.type_ && c.status == condition.status)
        {
            condition.last_transition_time = existing.last_transition_time;
        }
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
        self
    }

    /// Whether credentials were already delivered for this spec generation
    pub fn delivered_for(&self, generation: Option<i64>) -> bool {
        self.credentials_delivered
            && generation.is_some()
            && self.observed_generation == generation
    }

    /// Whether access was already revoked for this spec generation
    pub fn revoked_for(&self, generation: Option<i64>) -> bool {
        self.access_revoked && generation.is_some() && self.observed_generation == generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::types::ConditionStatus;

    fn sample_spec(uuid: &str) -> EdgeNodeSpec {
        EdgeNodeSpec {
            uuid: uuid.to_string(),
            node_status: NodeStatus::Registered,
            ek_cert: "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n"
                .to_string(),
            mb_refstate: "{\"scrtm_and_bios\": []}".to_string(),
        }
    }

    #[test]
    fn spec_round_trips_through_wire_names() {
        let json = serde_json::json!({
            "uuid": "d432fbb3-d2f1-4a97-9ef7-75bd81c00000",
            "nodeStatus": "registered",
            "ekcert": "pem",
            "mbrefstate": "{}"
        });
        let spec: EdgeNodeSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.uuid, "d432fbb3-d2f1-4a97-9ef7-75bd81c00000");
        assert_eq!(spec.node_status, NodeStatus::Registered);
        assert_eq!(spec.ek_cert, "pem");
        assert_eq!(spec.mb_refstate, "{}");

        let back = serde_json::to_value(&spec).unwrap();
        assert_eq!(back["nodeStatus"], "registered");
        assert_eq!(back["ekcert"], "pem");
    }

    #[test]
    fn valid_uuids_pass_validation() {
        assert!(sample_spec("d432fbb3-d2f1-4a97-9ef7-75bd81c00000")
            .validate()
            .is_ok());
        assert!(sample_spec("edge01.site-a").validate().is_ok());
    }

    /// Story: A uuid that cannot name Kubernetes objects is rejected early
    ///
    /// Signing requests and roles are named after the uuid, so an unusable
    /// uuid must fail validation before any request is submitted.
    #[test]
    fn story_unusable_uuids_are_rejected() {
        for bad in ["", "Upper-Case", "has space", "-leading-dash", "under_score"] {
            let result = sample_spec(bad).validate();
            assert!(
                matches!(result, Err(crate::Error::Validation(_))),
                "uuid {bad:?} should be rejected"
            );
        }

        let too_long = "a".repeat(240);
        assert!(sample_spec(&too_long).validate().is_err());
    }

    #[test]
    fn crd_is_namespaced_with_expected_group() {
        use kube::CustomResourceExt;
        let crd = EdgeNode::crd();
        assert_eq!(crd.spec.group, "edgenode.attest.idlab.be");
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.names.kind, "EdgeNode");
        assert_eq!(crd.spec.names.plural, "edgenodes");
    }

    #[test]
    fn delivered_only_counts_for_the_observed_generation() {
        let status = EdgeNodeStatus::observed(Some(3)).delivered(true);
        assert!(status.delivered_for(Some(3)));
        assert!(!status.delivered_for(Some(4)));
        assert!(!status.delivered_for(None));

        let not_delivered = EdgeNodeStatus::observed(Some(3));
        assert!(!not_delivered.delivered_for(Some(3)));
    }

    #[test]
    fn revoked_only_counts_for_the_observed_generation() {
        let status = EdgeNodeStatus::observed(Some(2)).revoked(true);
        assert!(status.revoked_for(Some(2)));
        assert!(!status.revoked_for(Some(3)));
    }

    #[test]
    fn unrecognized_status_is_never_recorded() {
        let status = EdgeNodeStatus::default()
            .observe(Some(1), NodeStatus::Registered)
            .observe(Some(2), NodeStatus::Unrecognized);
        assert_eq!(status.observed_generation, Some(2));
        assert_eq!(status.observed_node_status, Some(NodeStatus::Registered));
    }

    #[test]
    fn unchanged_condition_keeps_transition_time() {
        let first = Condition::new("AccessRevoked", ConditionStatus::True, "AccessRevoked", "a");
        let stamp = first.last_transition_time;
        let status = EdgeNodeStatus::default()
            .condition(first)
            .condition(Condition::new(
                "AccessRevoked",
                ConditionStatus::True,
                "AccessRevoked",
                "b",
            ));
        assert_eq!(status.conditions[0].last_transition_time, stamp);
        assert_eq!(status.conditions[0].message, "b");
    }

    #[test]
    fn conditions_replace_same_type() {
        let status = EdgeNodeStatus::default()
            .condition(Condition::new(
                "CredentialsDelivered",
                ConditionStatus::False,
                "BootstrapFailed",
                "registrar unreachable",
            ))
            .condition(Condition::new(
                "CredentialsDelivered",
                ConditionStatus::True,
                "CredentialsDelivered",
                "delivered",
            ));

        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].status, ConditionStatus::True);
    }
}
