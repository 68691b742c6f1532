//! Authorization delegated to a remote service.
//!
//! [`RemoteAuthorizer`] asks an [`AuthorizationBackend`] for verdicts and
//! caches them per `(scope, private metadata, instance name, permission)`.
//! The instance names of one call that are neither cached nor already being
//! fetched by another caller are sent in a single batched request.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use castellan_authn::{
    AuthError, AuthenticationMetadata, Result, metadata::canonical_json,
};
use castellan_cache::{
    CacheReplacementPolicy, CacheStats, Clock, InFlight, Lookup, RequestContext,
    SingleFlightCache, SystemClock,
};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use url::Url;

use crate::{
    authorizer::Authorizer,
    instance_name::{InstanceName, Permission},
};

/// Default timeout for calls to a remote authorization service.
pub const DEFAULT_REMOTE_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default maximum number of cached verdicts.
pub const DEFAULT_MAXIMUM_CACHE_SIZE: usize = 10_000;

/// Batched request sent to a remote authorization service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeRequest {
    /// Opaque value identifying the caller's deployment.
    pub scope: Value,
    /// The requester's metadata, reduced to its private section.
    pub authentication_metadata: Value,
    /// The operation being authorized.
    pub permission: Permission,
    /// Instance names to decide on.
    pub instance_names: Vec<InstanceName>,
}

/// Verdict of a remote authorization service for one instance name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthorizeVerdict {
    /// The requester may perform the operation.
    Allow,
    /// The requester may not perform the operation, for the given reason.
    Deny(String),
    /// The requester's identity is not acceptable, for the given reason.
    Unauthenticated(String),
}

/// Verdict for one instance name and how long it may be reused.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeResult {
    /// The verdict.
    pub verdict: AuthorizeVerdict,
    /// Until when the verdict may be reused. Absent means it must not be.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_expiration_time: Option<DateTime<Utc>>,
}

/// Response of a remote authorization service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeResponse {
    /// One result per requested instance name, in order.
    pub results: Vec<AuthorizeResult>,
}

/// Transport to a remote authorization service.
#[async_trait]
pub trait AuthorizationBackend: Send + Sync {
    /// Asks the service for verdicts.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Unavailable` if the service cannot be reached.
    async fn authorize(
        &self,
        ctx: &RequestContext,
        request: &AuthorizeRequest,
    ) -> Result<AuthorizeResponse>;
}

/// [`AuthorizationBackend`] speaking JSON over HTTP.
#[derive(Clone, Debug)]
pub struct HttpAuthorizationBackend {
    client: reqwest::Client,
    endpoint: Url,
    timeout: Duration,
}

#[bon::bon]
impl HttpAuthorizationBackend {
    /// Creates a backend posting requests to `endpoint`.
    #[builder]
    pub fn new(
        endpoint: Url,
        #[builder(default)] client: reqwest::Client,
        #[builder(default = DEFAULT_REMOTE_REQUEST_TIMEOUT)] timeout: Duration,
    ) -> Self {
        Self { client, endpoint, timeout }
    }
}

#[async_trait]
impl AuthorizationBackend for HttpAuthorizationBackend {
    async fn authorize(
        &self,
        ctx: &RequestContext,
        request: &AuthorizeRequest,
    ) -> Result<AuthorizeResponse> {
        let call = async {
            let response = self
                .client
                .post(self.endpoint.clone())
                .timeout(self.timeout)
                .json(request)
                .send()
                .await
                .map_err(|err| {
                    AuthError::unavailable_with_source(
                        "Failed to contact remote authorization service",
                        err,
                    )
                })?;
            let status = response.status();
            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                return Err(AuthError::unavailable(format!(
                    "Remote authorization service returned {status}"
                )));
            }
            if !status.is_success() {
                return Err(AuthError::internal(format!(
                    "Remote authorization service returned {status}"
                )));
            }
            response.json::<AuthorizeResponse>().await.map_err(|err| {
                AuthError::internal_with_source(
                    "Malformed response from remote authorization service",
                    err,
                )
            })
        };
        ctx.run(call).await
    }
}

type CachedVerdict = Result<()>;

/// Authorizes instance names by asking a remote service.
///
/// Verdicts are cached until their `cacheExpirationTime`. Only the private
/// section of the requester's metadata is forwarded and used in the cache
/// key. Transport failures are never cached.
pub struct RemoteAuthorizer {
    backend: Arc<dyn AuthorizationBackend>,
    scope: Value,
    cache: SingleFlightCache<[u8; 32], CachedVerdict>,
}

#[bon::bon]
impl RemoteAuthorizer {
    /// Creates an authorizer.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidArgument` if `maximum_cache_size` is zero.
    #[builder]
    pub fn new(
        backend: Arc<dyn AuthorizationBackend>,
        #[builder(default)] scope: Value,
        #[builder(default = Arc::new(SystemClock))] clock: Arc<dyn Clock>,
        #[builder(default)] cache_replacement_policy: CacheReplacementPolicy,
        #[builder(default = DEFAULT_MAXIMUM_CACHE_SIZE)] maximum_cache_size: usize,
    ) -> Result<Self> {
        if maximum_cache_size == 0 {
            return Err(AuthError::invalid_argument("Maximum cache size must be positive"));
        }
        Ok(Self {
            backend,
            scope,
            cache: SingleFlightCache::new(clock, cache_replacement_policy, maximum_cache_size),
        })
    }

    /// Returns the verdict cache's counters.
    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn cache_key(
        &self,
        private: &Value,
        permission: &Permission,
        instance_name: &InstanceName,
    ) -> [u8; 32] {
        let key = json!({
            "scope": self.scope,
            "private": private,
            "instanceName": instance_name.as_str(),
            "permission": permission.as_str(),
        });
        Sha256::digest(canonical_json(&key)).into()
    }

    /// Sends one request for all `owned` keys and completes them.
    async fn fetch<'a>(
        &self,
        ctx: &RequestContext,
        private: &Value,
        permission: &Permission,
        owned: Vec<(usize, &InstanceName, InFlight<'a, [u8; 32], CachedVerdict>)>,
        verdicts: &mut [Option<Result<()>>],
    ) {
        let request = AuthorizeRequest {
            scope: self.scope.clone(),
            authentication_metadata: json!({"private": private}),
            permission: permission.clone(),
            instance_names: owned.iter().map(|(_, name, _)| (*name).clone()).collect(),
        };
        let response = self.call_backend(ctx, &request).await.and_then(|response| {
            if response.results.len() == owned.len() {
                Ok(response.results)
            } else {
                Err(AuthError::internal(format!(
                    "Remote authorization service returned {} results for {} instance names",
                    response.results.len(),
                    owned.len()
                )))
            }
        });

        match response {
            Ok(results) => {
                for ((index, _, in_flight), result) in owned.into_iter().zip(results) {
                    let verdict = match result.verdict {
                        AuthorizeVerdict::Allow => Ok(()),
                        AuthorizeVerdict::Deny(reason) => Err(AuthError::permission_denied(reason)),
                        AuthorizeVerdict::Unauthenticated(reason) => {
                            Err(AuthError::unauthenticated(reason))
                        },
                    };
                    in_flight.complete(
                        result.cache_expiration_time.map(|until| (verdict.clone(), until)),
                    );
                    verdicts[index] = Some(verdict);
                }
            },
            Err(err) => {
                tracing::debug!(error = %err, "Remote authorization did not succeed");
                for (index, _, in_flight) in owned {
                    in_flight.complete(None);
                    verdicts[index] = Some(Err(err.clone()));
                }
            },
        }
    }

    async fn call_backend(
        &self,
        ctx: &RequestContext,
        request: &AuthorizeRequest,
    ) -> Result<AuthorizeResponse> {
        fail::fail_point!("remote-authz-before-rpc", |_| {
            Err(AuthError::unavailable("Injected failure before remote authorization"))
        });
        self.backend.authorize(ctx, request).await
    }
}

#[async_trait]
impl Authorizer for RemoteAuthorizer {
    #[tracing::instrument(
        name = "authorize",
        skip_all,
        fields(permission = permission.as_str(), instance_names = instance_names.len())
    )]
    async fn authorize(
        &self,
        ctx: &RequestContext,
        metadata: &AuthenticationMetadata,
        permission: &Permission,
        instance_names: &[InstanceName],
    ) -> Vec<Result<()>> {
        let private = metadata.private().cloned().unwrap_or(Value::Null);
        let keys: Vec<[u8; 32]> = instance_names
            .iter()
            .map(|name| self.cache_key(&private, permission, name))
            .collect();
        let mut verdicts: Vec<Option<Result<()>>> = vec![None; instance_names.len()];

        loop {
            let unresolved: Vec<usize> =
                (0..keys.len()).filter(|&index| verdicts[index].is_none()).collect();
            if unresolved.is_empty() {
                break;
            }
            let unresolved_keys: Vec<[u8; 32]> =
                unresolved.iter().map(|&index| keys[index]).collect();

            let mut owned = Vec::new();
            let mut waiters = Vec::new();
            let lookups = self.cache.lookup_many(&unresolved_keys);
            for (index, lookup) in unresolved.into_iter().zip(lookups) {
                match lookup {
                    Lookup::Cached(verdict) => verdicts[index] = Some(verdict),
                    Lookup::Wait(waiter) => waiters.push((index, waiter)),
                    Lookup::Owner(in_flight) => {
                        owned.push((index, &instance_names[index], in_flight));
                    },
                }
            }

            // Complete our own requests before waiting, as a name repeated
            // within this call waits on itself.
            if !owned.is_empty() {
                self.fetch(ctx, &private, permission, owned, &mut verdicts).await;
            }
            for (index, waiter) in waiters {
                if let Err(err) = waiter.wait(ctx).await {
                    verdicts[index] = Some(Err(err.into()));
                }
            }
        }

        verdicts
            .into_iter()
            .map(|verdict| {
                verdict.unwrap_or_else(|| Err(AuthError::internal("Instance name left undecided")))
            })
            .collect()
    }
}
