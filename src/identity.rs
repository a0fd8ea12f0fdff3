//! Node identity and the object names derived from it
//!
//! Every object the operator creates for a device (signing request, cluster
//! role, binding) is named deterministically from the device uuid, so two
//! passes for different devices never collide.

use kube::ResourceExt;

use crate::crd::{EdgeNode, NodeStatus};

/// Suffix of the signing request name
const CSR_SUFFIX: &str = "-csr";
/// Suffix of the access scope (ClusterRole) name
const SCOPE_SUFFIX: &str = "-cluster-role";
/// Suffix of the scope binding (ClusterRoleBinding) name
const BINDING_SUFFIX: &str = "-cluster-role-binding";

/// One edge device under trust management
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeIdentity {
    /// Stable device identity, as known to the registrar
    pub uuid: String,
    /// Declared lifecycle status
    pub status: NodeStatus,
    /// Operator-declared endorsement-key certificate (PEM)
    pub ek_cert: String,
    /// Measured-boot reference state, opaque to the operator
    pub reference_state: String,
}

impl NodeIdentity {
    /// Create an identity from its parts
    pub fn new(
        uuid: impl Into<String>,
        status: NodeStatus,
        ek_cert: impl Into<String>,
        reference_state: impl Into<String>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            status,
            ek_cert: ek_cert.into(),
            reference_state: reference_state.into(),
        }
    }

    /// Extract the identity declared on an EdgeNode resource
    pub fn from_resource(node: &EdgeNode) -> Self {
        Self {
            uuid: node.spec.uuid.clone(),
            status: node.spec.node_status,
            ek_cert: node.spec.ek_cert.clone(),
            reference_state: node.spec.mb_refstate.clone(),
        }
    }

    /// Name of the signing request for this device
    pub fn csr_name(&self) -> String {
        format!("{}{}", self.uuid, CSR_SUFFIX)
    }

    /// Name of the access scope (ClusterRole) for this device
    pub fn scope_name(&self) -> String {
        format!("{}{}", self.uuid, SCOPE_SUFFIX)
    }

    /// Name of the binding between principal and scope
    pub fn binding_name(&self) -> String {
        format!("{}{}", self.uuid, BINDING_SUFFIX)
    }

    /// Principal the issued certificate authenticates as
    ///
    /// The kube-apiserver client signer maps the certificate CN to a user,
    /// and the CN is the uuid.
    pub fn principal(&self) -> &str {
        &self.uuid
    }
}

/// Human-readable key for log lines (`namespace/name`)
pub fn resource_key(node: &EdgeNode) -> String {
    match node.namespace() {
        Some(ns) => format!("{}/{}", ns, node.name_any()),
        None => node.name_any(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::EdgeNodeSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn derived_names_follow_the_uuid() {
        let node = NodeIdentity::new("abc-123", NodeStatus::Registered, "ek", "{}");
        assert_eq!(node.csr_name(), "abc-123-csr");
        assert_eq!(node.scope_name(), "abc-123-cluster-role");
        assert_eq!(node.binding_name(), "abc-123-cluster-role-binding");
        assert_eq!(node.principal(), "abc-123");
    }

    /// Story: Different devices never share derived object names
    #[test]
    fn story_distinct_devices_never_collide() {
        let a = NodeIdentity::new("node-a", NodeStatus::Registered, "", "");
        let b = NodeIdentity::new("node-b", NodeStatus::Registered, "", "");
        assert_ne!(a.csr_name(), b.csr_name());
        assert_ne!(a.scope_name(), b.scope_name());
        assert_ne!(a.binding_name(), b.binding_name());
    }

    #[test]
    fn identity_is_read_from_the_resource() {
        let node = EdgeNode {
            metadata: ObjectMeta {
                name: Some("edge-01".to_string()),
                namespace: Some("edge".to_string()),
                ..Default::default()
            },
            spec: EdgeNodeSpec {
                uuid: "d432fbb3".to_string(),
                node_status: NodeStatus::Unattested,
                ek_cert: "ek-pem".to_string(),
                mb_refstate: "{\"kernels\": []}".to_string(),
            },
            status: None,
        };

        let identity = NodeIdentity::from_resource(&node);
        assert_eq!(identity.uuid, "d432fbb3");
        assert_eq!(identity.status, NodeStatus::Unattested);
        assert_eq!(identity.ek_cert, "ek-pem");
        assert_eq!(identity.reference_state, "{\"kernels\": []}");
        assert_eq!(resource_key(&node), "edge/edge-01");
    }
}
