//! Shared types for the EdgeNode CRD

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle status declared on an EdgeNode
///
/// The status is written by the operator's collaborators (registrar,
/// verifier); the controller only reads it and reacts.
///
/// ```text
/// Unregistered -> Registered -> Attested
///                            \-> Unattested
/// ```
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Resource declared but the device has not registered yet
    #[default]
    Unregistered,
    /// Device registered with the registrar and needs credentials
    Registered,
    /// Device failed attestation
    Unattested,
    /// Device passed attestation
    Attested,
    /// Any value outside the transition graph
    #[serde(other)]
    #[schemars(skip)]
    Unrecognized,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unregistered => write!(f, "unregistered"),
            Self::Registered => write!(f, "registered"),
            Self::Unattested => write!(f, "unattested"),
            Self::Attested => write!(f, "attested"),
            Self::Unrecognized => write!(f, "unrecognized"),
        }
    }
}

/// Truth value of a [`Condition`]
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// The condition holds
    True,
    /// The condition does not hold
    False,
    /// Not evaluated yet
    #[default]
    Unknown,
}

/// One entry of `status.conditions`
///
/// Serialized with the field names `kubectl wait --for=condition=...` reads.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition name, e.g. `CredentialsDelivered`
    #[serde(rename = "type")]
    pub type_: String,

    /// Whether the condition holds
    pub status: ConditionStatus,

    /// CamelCase cause, usually an event reason
    pub reason: String,

    /// Free-form detail for humans
    pub message: String,

    /// When `status` last flipped
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Build a condition stamped with the current time
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Whether the condition holds
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_status_uses_lowercase_wire_names() {
        for (status, wire) in [
            (NodeStatus::Unregistered, "\"unregistered\""),
            (NodeStatus::Registered, "\"registered\""),
            (NodeStatus::Unattested, "\"unattested\""),
            (NodeStatus::Attested, "\"attested\""),
        ] {
            assert_eq!(serde_json::to_string(&status).unwrap(), wire);
            let parsed: NodeStatus = serde_json::from_str(wire).unwrap();
            assert_eq!(parsed, status);
        }
    }

    /// Story: An operator typo never breaks deserialization
    ///
    /// A value like "atested" must still load so the controller can answer
    /// with an explicit invalid-state error instead of dropping the event.
    #[test]
    fn story_unknown_status_is_captured() {
        let parsed: NodeStatus = serde_json::from_str("\"atested\"").unwrap();
        assert_eq!(parsed, NodeStatus::Unrecognized);

        let parsed: NodeStatus = serde_json::from_str("\"Registered\"").unwrap();
        assert_eq!(parsed, NodeStatus::Unrecognized);
    }

    #[test]
    fn default_status_is_unregistered() {
        assert_eq!(NodeStatus::default(), NodeStatus::Unregistered);
        assert_eq!(NodeStatus::default().to_string(), "unregistered");
    }

    #[test]
    fn condition_serializes_with_kubernetes_field_names() {
        let delivered = Condition::new(
            "CredentialsDelivered",
            ConditionStatus::True,
            "CredentialsDelivered",
            "credentials delivered",
        );
        assert!(delivered.is_true());
        let json = serde_json::to_value(&delivered).unwrap();
        assert_eq!(json["type"], "CredentialsDelivered");
        assert_eq!(json["status"], "True");
        assert!(json.get("lastTransitionTime").is_some());
    }
}
