//! Authorization policy configuration.
//!
//! ```
//! use castellan_authz::config::AuthorizationPolicy;
//!
//! let policy: AuthorizationPolicy =
//!     serde_json::from_str(r#"{"instanceNamePrefix": ["prod", "staging/linux"]}"#).unwrap();
//! assert!(matches!(policy, AuthorizationPolicy::InstanceNamePrefix(ref prefixes) if prefixes.len() == 2));
//! ```

use std::time::Duration;

use castellan_authn::config::ExpressionConfig;
use castellan_cache::CacheReplacementPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::{
    instance_name::InstanceName,
    remote::{DEFAULT_MAXIMUM_CACHE_SIZE, DEFAULT_REMOTE_REQUEST_TIMEOUT},
};

fn default_maximum_cache_size() -> usize {
    DEFAULT_MAXIMUM_CACHE_SIZE
}

fn default_remote_request_timeout() -> Duration {
    DEFAULT_REMOTE_REQUEST_TIMEOUT
}

/// Policy for authorizing requests on instance names.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub enum AuthorizationPolicy {
    /// Allow every instance name.
    Allow,
    /// Deny every instance name.
    Deny,
    /// Allow instance names equal to or below one of these prefixes.
    InstanceNamePrefix(Vec<InstanceName>),
    /// Allow instance names for which a JMESPath expression is truthy.
    JmespathExpression(ExpressionConfig),
    /// Ask a remote service.
    Remote(RemoteAuthorizerConfig),
}

/// Configuration of [`AuthorizationPolicy::Remote`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, bon::Builder)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RemoteAuthorizerConfig {
    /// URL the batched requests are posted to.
    pub endpoint: Url,

    /// Opaque value forwarded with every request and part of the cache key.
    #[serde(default)]
    #[builder(default)]
    pub scope: Value,

    /// Eviction policy of the verdict cache.
    #[serde(default)]
    #[builder(default)]
    pub cache_replacement_policy: CacheReplacementPolicy,

    /// Maximum number of cached verdicts.
    #[serde(default = "default_maximum_cache_size")]
    #[builder(default = DEFAULT_MAXIMUM_CACHE_SIZE)]
    pub maximum_cache_size: usize,

    /// Timeout of each request.
    #[serde(with = "humantime_serde", default = "default_remote_request_timeout")]
    #[builder(default = DEFAULT_REMOTE_REQUEST_TIMEOUT)]
    pub timeout: Duration,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_unit_policies() {
        assert_eq!(
            serde_json::from_value::<AuthorizationPolicy>(json!("allow")).unwrap(),
            AuthorizationPolicy::Allow
        );
        assert_eq!(serde_json::to_value(AuthorizationPolicy::Deny).unwrap(), json!("deny"));
    }

    #[test]
    fn test_remote_defaults() {
        let policy: AuthorizationPolicy =
            serde_json::from_value(json!({"remote": {"endpoint": "https://authz.example.com/v1"}}))
                .unwrap();
        let AuthorizationPolicy::Remote(config) = policy else {
            panic!("expected a remote policy");
        };
        assert_eq!(config.scope, Value::Null);
        assert_eq!(config.cache_replacement_policy, CacheReplacementPolicy::default());
        assert_eq!(config.maximum_cache_size, DEFAULT_MAXIMUM_CACHE_SIZE);
        assert_eq!(config.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_remote_full() {
        let policy: AuthorizationPolicy = serde_json::from_value(json!({"remote": {
            "endpoint": "https://authz.example.com/v1",
            "scope": {"cluster": "eu-1"},
            "cacheReplacementPolicy": "FIFO",
            "maximumCacheSize": 5,
            "timeout": "2s",
        }}))
        .unwrap();
        assert_eq!(
            policy,
            AuthorizationPolicy::Remote(
                RemoteAuthorizerConfig::builder()
                    .endpoint(Url::parse("https://authz.example.com/v1").unwrap())
                    .scope(json!({"cluster": "eu-1"}))
                    .cache_replacement_policy(CacheReplacementPolicy::Fifo)
                    .maximum_cache_size(5)
                    .timeout(Duration::from_secs(2))
                    .build()
            )
        );
    }

    #[test]
    fn test_invalid_policies_rejected() {
        for invalid in [
            json!({"instanceNamePrefix": ["a//b"]}),
            json!({"remote": {"endpoint": "not a url"}}),
            json!({"remote": {"endpoint": "https://a", "unknown": 1}}),
            json!({"jmespathExpression": {"expression": "x", "extra": true}}),
            json!("maybe"),
        ] {
            assert!(
                serde_json::from_value::<AuthorizationPolicy>(invalid.clone()).is_err(),
                "{invalid} should be rejected"
            );
        }
    }

    #[test]
    fn test_expression_policy() {
        let policy: AuthorizationPolicy = serde_json::from_value(
            json!({"jmespathExpression": {"expression": "authenticationMetadata.private.admin"}}),
        )
        .unwrap();
        assert_eq!(
            policy,
            AuthorizationPolicy::JmespathExpression(ExpressionConfig::new(
                "authenticationMetadata.private.admin"
            ))
        );
    }
}
