//! Authorizers.
//!
//! An [`Authorizer`] decides, for each instance name of a request, whether
//! the authenticated requester may perform an operation on it. A verdict is
//! `Ok(())`, `PermissionDenied`, `Unauthenticated`, or a failure of the
//! authorizer itself.

use std::sync::Arc;

use async_trait::async_trait;
use castellan_authn::{AuthError, AuthenticationMetadata, Result};
use castellan_cache::RequestContext;

use crate::{
    instance_name::{InstanceName, Permission},
    trie::InstanceNameTrie,
};

/// Decides whether requesters may act on instance names.
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Returns one verdict per element of `instance_names`, in order.
    async fn authorize(
        &self,
        ctx: &RequestContext,
        metadata: &AuthenticationMetadata,
        permission: &Permission,
        instance_names: &[InstanceName],
    ) -> Vec<Result<()>>;
}

/// An [`Authorizer`] fixed to the permission of one operation.
#[derive(Clone)]
pub struct BoundAuthorizer {
    authorizer: Arc<dyn Authorizer>,
    permission: Permission,
}

impl BoundAuthorizer {
    /// Binds `authorizer` to `permission`.
    pub fn new(authorizer: Arc<dyn Authorizer>, permission: Permission) -> Self {
        Self { authorizer, permission }
    }

    /// Returns the bound permission.
    pub fn permission(&self) -> &Permission {
        &self.permission
    }

    /// Returns one verdict per element of `instance_names`, in order.
    pub async fn authorize(
        &self,
        ctx: &RequestContext,
        metadata: &AuthenticationMetadata,
        instance_names: &[InstanceName],
    ) -> Vec<Result<()>> {
        self.authorizer.authorize(ctx, metadata, &self.permission, instance_names).await
    }

    /// Authorizes a single instance name.
    ///
    /// # Errors
    ///
    /// Returns the verdict for `instance_name` if it is not an allow.
    pub async fn authorize_single(
        &self,
        ctx: &RequestContext,
        metadata: &AuthenticationMetadata,
        instance_name: &InstanceName,
    ) -> Result<()> {
        self.authorize(ctx, metadata, std::slice::from_ref(instance_name))
            .await
            .pop()
            .unwrap_or_else(|| Err(AuthError::internal("Authorizer returned no verdict")))
    }
}

fn permission_denied(instance_name: &InstanceName, permission: &Permission) -> AuthError {
    AuthError::permission_denied(format!(
        "Permission {:?} denied for instance name {:?}",
        permission.as_str(),
        instance_name.as_str()
    ))
}

/// Gives the same verdict for every instance name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StaticAuthorizer {
    allow: bool,
}

impl StaticAuthorizer {
    /// Creates an authorizer that allows everything.
    pub fn allow() -> Self {
        Self { allow: true }
    }

    /// Creates an authorizer that denies everything with `PermissionDenied`.
    pub fn deny() -> Self {
        Self { allow: false }
    }
}

#[async_trait]
impl Authorizer for StaticAuthorizer {
    async fn authorize(
        &self,
        _ctx: &RequestContext,
        _metadata: &AuthenticationMetadata,
        permission: &Permission,
        instance_names: &[InstanceName],
    ) -> Vec<Result<()>> {
        instance_names
            .iter()
            .map(|name| if self.allow { Ok(()) } else { Err(permission_denied(name, permission)) })
            .collect()
    }
}

/// Allows instance names that equal or descend from a configured prefix.
#[derive(Debug)]
pub struct InstanceNamePrefixAuthorizer {
    allowed: InstanceNameTrie,
}

impl InstanceNamePrefixAuthorizer {
    /// Creates an authorizer allowing everything under `prefixes`.
    pub fn new<'a>(prefixes: impl IntoIterator<Item = &'a InstanceName>) -> Self {
        Self { allowed: prefixes.into_iter().collect() }
    }
}

#[async_trait]
impl Authorizer for InstanceNamePrefixAuthorizer {
    async fn authorize(
        &self,
        _ctx: &RequestContext,
        _metadata: &AuthenticationMetadata,
        permission: &Permission,
        instance_names: &[InstanceName],
    ) -> Vec<Result<()>> {
        instance_names
            .iter()
            .map(|name| {
                if self.allowed.contains_prefix(name) {
                    Ok(())
                } else {
                    Err(permission_denied(name, permission))
                }
            })
            .collect()
    }
}
