//! EdgeNode reconciliation
//!
//! [`machine`] holds the per-state bootstrap logic; [`edge_node`] wires it to
//! the Kubernetes controller runtime and the resource status.

pub mod edge_node;
pub mod machine;

pub use edge_node::{
    error_policy, reconcile, Context, KubeStatusClient, StatusClient,
    CONDITION_ACCESS_REVOKED, CONDITION_CREDENTIALS_DELIVERED, CONDITION_SPEC_VALID,
};
pub use machine::{BootstrapMachine, Directive, Outcome};
