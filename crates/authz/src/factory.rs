//! Construction of authorizers from configuration.
//!
//! [`BaseAuthorizerFactory`] builds a fresh authorizer for every policy.
//! [`DeduplicatingAuthorizerFactory`] wraps another factory and hands out the
//! same instance for identical policies, so that operations configured with
//! the same remote authorizer share its cache.

use std::{collections::HashMap, sync::Arc};

use castellan_authn::{
    AuthError, Result, expression::Expression, metadata::canonical_json,
};
use castellan_cache::{Clock, SystemClock};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    authorizer::{Authorizer, InstanceNamePrefixAuthorizer, StaticAuthorizer},
    config::{AuthorizationPolicy, RemoteAuthorizerConfig},
    jmespath::JmespathExpressionAuthorizer,
    remote::{HttpAuthorizationBackend, RemoteAuthorizer},
};

/// Builds authorizers from policies.
pub trait AuthorizerFactory: Send + Sync {
    /// Builds an authorizer for `policy`.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidArgument` if the policy is invalid.
    fn new_authorizer(&self, policy: &AuthorizationPolicy) -> Result<Arc<dyn Authorizer>>;
}

/// Collaborators shared by every authorizer built by one factory.
#[derive(Clone, bon::Builder)]
pub struct AuthorizerDependencies {
    /// Source of the current time.
    #[builder(default = Arc::new(SystemClock))]
    pub clock: Arc<dyn Clock>,

    /// HTTP client for remote services.
    #[builder(default)]
    pub http_client: reqwest::Client,

    /// Stops background tasks.
    #[builder(default)]
    pub shutdown: CancellationToken,
}

impl Default for AuthorizerDependencies {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Factory building a new authorizer for every call.
#[derive(Clone, Default)]
pub struct BaseAuthorizerFactory {
    dependencies: AuthorizerDependencies,
}

impl BaseAuthorizerFactory {
    /// Creates a factory using `dependencies`.
    pub fn new(dependencies: AuthorizerDependencies) -> Self {
        Self { dependencies }
    }

    fn remote_authorizer(&self, config: &RemoteAuthorizerConfig) -> Result<Arc<dyn Authorizer>> {
        let backend = HttpAuthorizationBackend::builder()
            .endpoint(config.endpoint.clone())
            .client(self.dependencies.http_client.clone())
            .timeout(config.timeout)
            .build();
        let authorizer = RemoteAuthorizer::builder()
            .backend(Arc::new(backend))
            .scope(config.scope.clone())
            .clock(Arc::clone(&self.dependencies.clock))
            .cache_replacement_policy(config.cache_replacement_policy)
            .maximum_cache_size(config.maximum_cache_size)
            .build()?;
        Ok(Arc::new(authorizer))
    }
}

impl AuthorizerFactory for BaseAuthorizerFactory {
    fn new_authorizer(&self, policy: &AuthorizationPolicy) -> Result<Arc<dyn Authorizer>> {
        let authorizer: Arc<dyn Authorizer> = match policy {
            AuthorizationPolicy::Allow => Arc::new(StaticAuthorizer::allow()),
            AuthorizationPolicy::Deny => Arc::new(StaticAuthorizer::deny()),
            AuthorizationPolicy::InstanceNamePrefix(prefixes) => {
                Arc::new(InstanceNamePrefixAuthorizer::new(prefixes))
            },
            AuthorizationPolicy::JmespathExpression(config) => {
                Arc::new(JmespathExpressionAuthorizer::new(Expression::with_context_files(
                    &config.expression,
                    &config.context_files,
                    config.refresh_interval,
                    &self.dependencies.shutdown,
                )?))
            },
            AuthorizationPolicy::Remote(config) => self.remote_authorizer(config)?,
        };
        Ok(authorizer)
    }
}

/// Factory returning one shared authorizer per distinct policy.
///
/// Policies are compared by their canonical JSON form, so two policies
/// parsed from documents that differ only in field order or whitespace are
/// the same policy.
pub struct DeduplicatingAuthorizerFactory {
    base: Arc<dyn AuthorizerFactory>,
    authorizers: Mutex<HashMap<Vec<u8>, Arc<dyn Authorizer>>>,
}

impl DeduplicatingAuthorizerFactory {
    /// Wraps `base`.
    pub fn new(base: Arc<dyn AuthorizerFactory>) -> Self {
        Self { base, authorizers: Mutex::new(HashMap::new()) }
    }

    /// Returns the number of distinct authorizers built so far.
    pub fn len(&self) -> usize {
        self.authorizers.lock().len()
    }

    /// Returns `true` if no authorizer has been built yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuthorizerFactory for DeduplicatingAuthorizerFactory {
    fn new_authorizer(&self, policy: &AuthorizationPolicy) -> Result<Arc<dyn Authorizer>> {
        let value = serde_json::to_value(policy).map_err(|err| {
            AuthError::internal_with_source("Failed to serialize authorization policy", err)
        })?;
        let key = canonical_json(&value);

        let mut authorizers = self.authorizers.lock();
        if let Some(authorizer) = authorizers.get(&key) {
            tracing::debug!("Reusing authorizer for identical policy");
            return Ok(Arc::clone(authorizer));
        }
        let authorizer = self.base.new_authorizer(policy)?;
        authorizers.insert(key, Arc::clone(&authorizer));
        Ok(authorizer)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tonic::Code;

    use super::*;

    struct CountingFactory {
        base: BaseAuthorizerFactory,
        calls: AtomicUsize,
    }

    impl AuthorizerFactory for CountingFactory {
        fn new_authorizer(&self, policy: &AuthorizationPolicy) -> Result<Arc<dyn Authorizer>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.base.new_authorizer(policy)
        }
    }

    fn policy(json: &str) -> AuthorizationPolicy {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_base_factory_rejects_invalid_policies() {
        let factory = BaseAuthorizerFactory::default();

        let bad_expression =
            policy(r#"{"jmespathExpression": {"expression": "authenticationMetadata.["}}"#);
        let err = factory.new_authorizer(&bad_expression).err().unwrap();
        assert_eq!(err.code(), Code::InvalidArgument);

        let zero_cache = policy(r#"{"remote": {"endpoint": "https://a", "maximumCacheSize": 0}}"#);
        let err = factory.new_authorizer(&zero_cache).err().unwrap();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[test]
    fn test_deduplication_ignores_field_order() {
        let counting = Arc::new(CountingFactory {
            base: BaseAuthorizerFactory::default(),
            calls: AtomicUsize::new(0),
        });
        let factory = DeduplicatingAuthorizerFactory::new(counting.clone());

        let first = factory
            .new_authorizer(&policy(
                r#"{"remote": {"endpoint": "https://authz.example.com/", "scope": {"a": 1, "b": 2}, "maximumCacheSize": 100}}"#,
            ))
            .unwrap();
        let second = factory
            .new_authorizer(&policy(
                r#"{"remote": {"maximumCacheSize": 100, "scope": {"b": 2, "a": 1}, "endpoint": "https://authz.example.com/"}}"#,
            ))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        let different = factory
            .new_authorizer(&policy(
                r#"{"remote": {"endpoint": "https://authz.example.com/", "scope": {"a": 1, "b": 3}, "maximumCacheSize": 100}}"#,
            ))
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &different));

        assert_eq!(counting.calls.load(Ordering::Relaxed), 2);
        assert_eq!(factory.len(), 2);
    }

    #[test]
    fn test_failed_builds_are_not_remembered() {
        let factory = DeduplicatingAuthorizerFactory::new(Arc::new(BaseAuthorizerFactory::default()));
        let invalid = policy(r#"{"jmespathExpression": {"expression": "["}}"#);

        assert!(factory.new_authorizer(&invalid).is_err());
        assert!(factory.new_authorizer(&invalid).is_err());
        assert!(factory.is_empty());
    }

    #[test]
    fn test_default_policies_are_shared() {
        let factory = DeduplicatingAuthorizerFactory::new(Arc::new(BaseAuthorizerFactory::default()));
        let allow = factory.new_authorizer(&AuthorizationPolicy::Allow).unwrap();
        let deny = factory.new_authorizer(&AuthorizationPolicy::Deny).unwrap();
        let allow_again = factory.new_authorizer(&policy(r#""allow""#)).unwrap();

        assert!(Arc::ptr_eq(&allow, &allow_again));
        assert!(!Arc::ptr_eq(&allow, &deny));
        assert_eq!(factory.len(), 2);
    }
}
