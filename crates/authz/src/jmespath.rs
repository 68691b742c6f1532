//! Authorization by JMESPath expression.

use async_trait::async_trait;
use castellan_authn::{AuthError, AuthenticationMetadata, Result, expression::Expression};
use castellan_cache::RequestContext;
use serde_json::{Value, json};

use crate::{
    authorizer::Authorizer,
    instance_name::{InstanceName, Permission},
};

/// Allows an instance name when an expression over the request is truthy.
///
/// The expression's input is
/// `{"authenticationMetadata": <raw metadata>, "instanceName": "<name>"}`.
/// Evaluation failures are reported as `Internal` for the affected instance
/// name only.
#[derive(Debug)]
pub struct JmespathExpressionAuthorizer {
    expression: Expression,
}

impl JmespathExpressionAuthorizer {
    /// Creates an authorizer evaluating `expression`.
    pub fn new(expression: Expression) -> Self {
        Self { expression }
    }

    fn authorize_one(
        &self,
        metadata: &Value,
        permission: &Permission,
        instance_name: &InstanceName,
    ) -> Result<()> {
        let input = json!({
            "authenticationMetadata": metadata,
            "instanceName": instance_name.as_str(),
        });
        if self.expression.is_truthy(&input)? {
            Ok(())
        } else {
            tracing::debug!(
                instance_name = instance_name.as_str(),
                permission = permission.as_str(),
                "Expression denied access"
            );
            Err(AuthError::permission_denied(format!(
                "Permission {:?} denied for instance name {:?}",
                permission.as_str(),
                instance_name.as_str()
            )))
        }
    }
}

#[async_trait]
impl Authorizer for JmespathExpressionAuthorizer {
    async fn authorize(
        &self,
        _ctx: &RequestContext,
        metadata: &AuthenticationMetadata,
        permission: &Permission,
        instance_names: &[InstanceName],
    ) -> Vec<Result<()>> {
        instance_names
            .iter()
            .map(|name| self.authorize_one(metadata.raw(), permission, name))
            .collect()
    }
}
