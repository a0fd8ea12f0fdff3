//! Access scope backend
//!
//! Scopes are ClusterRoles and bindings are ClusterRoleBindings, both written
//! with server-side apply so a repeated grant updates in place.

use async_trait::async_trait;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;

use super::{AccessScope, ScopeBinding, ScopeRule};
use crate::Error;

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// Keyed storage for scopes and bindings
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ScopeStore: Send + Sync {
    /// Fetch a scope by name
    async fn get_scope(&self, name: &str) -> Result<Option<AccessScope>, Error>;

    /// Create or replace a scope
    async fn put_scope(&self, scope: &AccessScope) -> Result<(), Error>;

    /// Create or replace a binding
    async fn put_binding(&self, binding: &ScopeBinding) -> Result<(), Error>;
}

/// Scope store backed by cluster RBAC objects
pub struct KubeScopeStore {
    client: Client,
}

impl KubeScopeStore {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn managed_metadata(name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        labels: Some(
            [(
                "app.kubernetes.io/managed-by".to_string(),
                crate::CONTROLLER_NAME.to_string(),
            )]
            .into(),
        ),
        ..Default::default()
    }
}

fn to_cluster_role(scope: &AccessScope) -> ClusterRole {
    ClusterRole {
        metadata: managed_metadata(&scope.name),
        rules: Some(
            scope
                .rules
                .iter()
                .map(|rule| PolicyRule {
                    api_groups: Some(rule.api_groups.clone()),
                    resources: Some(rule.resources.clone()),
                    verbs: rule.verbs.clone(),
                    ..Default::default()
                })
                .collect(),
        ),
        ..Default::default()
    }
}

fn from_cluster_role(role: &ClusterRole) -> AccessScope {
    AccessScope {
        name: role.metadata.name.clone().unwrap_or_default(),
        rules: role
            .rules
            .iter()
            .flatten()
            .map(|rule| ScopeRule {
                api_groups: rule.api_groups.clone().unwrap_or_default(),
                resources: rule.resources.clone().unwrap_or_default(),
                verbs: rule.verbs.clone(),
            })
            .collect(),
    }
}

fn to_cluster_role_binding(binding: &ScopeBinding) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: managed_metadata(&binding.name),
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "ClusterRole".to_string(),
            name: binding.scope_name.clone(),
        },
        subjects: Some(vec![Subject {
            api_group: Some(RBAC_API_GROUP.to_string()),
            kind: "User".to_string(),
            name: binding.principal.clone(),
            ..Default::default()
        }]),
    }
}

#[async_trait]
impl ScopeStore for KubeScopeStore {
    async fn get_scope(&self, name: &str) -> Result<Option<AccessScope>, Error> {
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        let role = api.get_opt(name).await?;
        Ok(role.as_ref().map(from_cluster_role))
    }

    async fn put_scope(&self, scope: &AccessScope) -> Result<(), Error> {
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        let params = PatchParams::apply(crate::FIELD_MANAGER).force();
        api.patch(&scope.name, &params, &Patch::Apply(&to_cluster_role(scope)))
            .await?;
        Ok(())
    }

    async fn put_binding(&self, binding: &ScopeBinding) -> Result<(), Error> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        let params = PatchParams::apply(crate::FIELD_MANAGER).force();
        api.patch(
            &binding.name,
            &params,
            &Patch::Apply(&to_cluster_role_binding(binding)),
        )
        .await?;
        Ok(())
    }
}
