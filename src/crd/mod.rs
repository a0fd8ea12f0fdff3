//! Custom Resource Definitions for the edge node operator

mod edge_node;
mod types;

pub use edge_node::{EdgeNode, EdgeNodeSpec, EdgeNodeStatus};
pub use types::{Condition, ConditionStatus, NodeStatus};
