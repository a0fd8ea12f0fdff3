//! Access scope grant and revocation
//!
//! A node's principal is bound to exactly one scope. The scope is either
//! read-only observation of one resource class or empty; nothing in between.

mod store;

pub use store::{KubeScopeStore, ScopeStore};
#[cfg(test)]
pub use store::MockScopeStore;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{info, warn};

use crate::config::ScopeConfig;
use crate::identity::NodeIdentity;
use crate::Error;

/// Verbs of the read-only observation scope
pub const READ_ONLY_VERBS: [&str; 3] = ["get", "list", "watch"];

/// One rule of a scope
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopeRule {
    /// API groups the rule covers ("" is the core group)
    pub api_groups: Vec<String>,
    /// Resources the rule covers
    pub resources: Vec<String>,
    /// Allowed verbs
    pub verbs: Vec<String>,
}

/// Permission set bound to a node principal
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccessScope {
    /// Scope name, derived from the node uuid
    pub name: String,
    /// Rules making up the scope
    pub rules: Vec<ScopeRule>,
}

impl AccessScope {
    /// Read-only observation of the configured resource class
    pub fn read_only(name: impl Into<String>, config: &ScopeConfig) -> Self {
        Self {
            name: name.into(),
            rules: vec![ScopeRule {
                api_groups: vec![config.api_group.clone()],
                resources: vec![config.resource.clone()],
                verbs: READ_ONLY_VERBS.iter().map(|v| v.to_string()).collect(),
            }],
        }
    }

    /// Drop every permission
    pub fn revoke(&mut self) {
        self.rules.clear();
    }

    /// All verbs allowed by any rule
    pub fn allowed_operations(&self) -> BTreeSet<&str> {
        self.rules
            .iter()
            .flat_map(|r| r.verbs.iter().map(String::as_str))
            .collect()
    }

    /// Whether the scope allows nothing
    pub fn is_empty(&self) -> bool {
        self.allowed_operations().is_empty()
    }
}

/// Binding of a principal to a scope
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopeBinding {
    /// Binding name, derived from the node uuid
    pub name: String,
    /// Scope being bound
    pub scope_name: String,
    /// User the node authenticates as
    pub principal: String,
}

/// Grants and revokes node access
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AccessScopes: Send + Sync {
    /// Bind the node's principal to the read-only scope
    async fn grant(&self, node: &NodeIdentity) -> Result<(), Error>;

    /// Empty the node's scope
    async fn revoke(&self, node: &NodeIdentity) -> Result<(), Error>;
}

/// Access scope manager over a [`ScopeStore`]
pub struct AccessScopeManager {
    store: Arc<dyn ScopeStore>,
    config: ScopeConfig,
}

impl AccessScopeManager {
    /// Create a manager writing to the given store
    pub fn new(store: Arc<dyn ScopeStore>, config: ScopeConfig) -> Self {
        Self { store, config }
    }
}

#[async_trait]
impl AccessScopes for AccessScopeManager {
    async fn grant(&self, node: &NodeIdentity) -> Result<(), Error> {
        let scope = AccessScope::read_only(node.scope_name(), &self.config);
        self.store
            .put_scope(&scope)
            .await
            .map_err(|e| Error::scope_create_failed(&scope.name, e.to_string()))?;

        let binding = ScopeBinding {
            name: node.binding_name(),
            scope_name: scope.name.clone(),
            principal: node.principal().to_string(),
        };
        self.store
            .put_binding(&binding)
            .await
            .map_err(|e| Error::scope_create_failed(&binding.name, e.to_string()))?;

        info!(uuid = %node.uuid, scope = %scope.name, "Granted read-only access scope");
        Ok(())
    }

    async fn revoke(&self, node: &NodeIdentity) -> Result<(), Error> {
        let name = node.scope_name();
        let Some(mut scope) = self.store.get_scope(&name).await? else {
            warn!(uuid = %node.uuid, scope = %name, "Access scope not found, treating as revoked");
            return Ok(());
        };

        scope.revoke();
        self.store.put_scope(&scope).await?;

        info!(uuid = %node.uuid, scope = %name, "Revoked access scope");
        Ok(())
    }
}
