//! Authentication delegated to a remote service.
//!
//! [`RemoteRequestHeadersAuthenticator`] forwards a configured subset of the
//! request headers to an [`AuthenticationBackend`] and caches verdicts for as
//! long as the backend allows. Concurrent requests carrying the same headers
//! share a single RPC.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use castellan_cache::{
    CacheReplacementPolicy, CacheStats, Clock, Lookup, RequestContext, SingleFlightCache,
    SystemClock,
};
use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderName, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use url::Url;

use crate::{
    authenticator::Authenticator,
    error::{AuthError, Result},
    jwt::DEFAULT_MAXIMUM_CACHE_SIZE,
    metadata::{AuthenticationMetadata, canonical_json},
};

/// Default timeout for calls to a remote authentication service.
pub const DEFAULT_REMOTE_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Request sent to a remote authentication service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateRequest {
    /// Opaque value identifying the caller's deployment.
    pub scope: Value,
    /// Forwarded request headers, keyed by lower-case name.
    pub request_metadata: BTreeMap<String, Vec<String>>,
}

/// Verdict of a remote authentication service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthenticateVerdict {
    /// The request is authenticated, with the given raw metadata.
    Allow(Value),
    /// The request is rejected for the given reason.
    Deny(String),
}

/// Response of a remote authentication service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateResponse {
    /// The verdict.
    #[serde(flatten)]
    pub verdict: AuthenticateVerdict,
    /// Until when the verdict may be reused. Absent means it must not be.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_expiration_time: Option<DateTime<Utc>>,
}

/// Transport to a remote authentication service.
#[async_trait]
pub trait AuthenticationBackend: Send + Sync {
    /// Asks the service for a verdict.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Unavailable` if the service cannot be reached.
    async fn authenticate(
        &self,
        ctx: &RequestContext,
        request: &AuthenticateRequest,
    ) -> Result<AuthenticateResponse>;
}

/// [`AuthenticationBackend`] speaking JSON over HTTP.
#[derive(Clone, Debug)]
pub struct HttpAuthenticationBackend {
    client: reqwest::Client,
    endpoint: Url,
    timeout: Duration,
}

#[bon::bon]
impl HttpAuthenticationBackend {
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
impl AuthenticationBackend for HttpAuthenticationBackend {
    async fn authenticate(
        &self,
        ctx: &RequestContext,
        request: &AuthenticateRequest,
    ) -> Result<AuthenticateResponse> {
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
                        "Failed to contact remote authentication service",
                        err,
                    )
                })?;
            let status = response.status();
            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                return Err(AuthError::unavailable(format!(
                    "Remote authentication service returned {status}"
                )));
            }
            if !status.is_success() {
                return Err(AuthError::internal(format!(
                    "Remote authentication service returned {status}"
                )));
            }
            response.json::<AuthenticateResponse>().await.map_err(|err| {
                AuthError::internal_with_source(
                    "Malformed response from remote authentication service",
                    err,
                )
            })
        };
        ctx.run(call).await
    }
}

type CachedVerdict = Result<Arc<AuthenticationMetadata>>;

/// Authenticates requests by asking a remote service.
///
/// Only the configured headers are forwarded. The SHA-256 digest of the
/// forwarded request is the cache key, so credentials are not kept in memory
/// in plain text. Both allow and deny verdicts are cached until their
/// `cacheExpirationTime`; transport failures are never cached.
pub struct RemoteRequestHeadersAuthenticator {
    backend: Arc<dyn AuthenticationBackend>,
    scope: Value,
    header_keys: Vec<HeaderName>,
    cache: SingleFlightCache<[u8; 32], CachedVerdict>,
}

#[bon::bon]
impl RemoteRequestHeadersAuthenticator {
    /// Creates an authenticator.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidArgument` if a header key is not a valid
    /// header name.
    #[builder]
    pub fn new(
        backend: Arc<dyn AuthenticationBackend>,
        #[builder(default)] scope: Value,
        header_keys: Vec<String>,
        #[builder(default = Arc::new(SystemClock))] clock: Arc<dyn Clock>,
        #[builder(default)] cache_replacement_policy: CacheReplacementPolicy,
        #[builder(default = DEFAULT_MAXIMUM_CACHE_SIZE)] maximum_cache_size: usize,
    ) -> Result<Self> {
        let header_keys = header_keys
            .iter()
            .map(|key| {
                HeaderName::from_bytes(key.to_ascii_lowercase().as_bytes()).map_err(|_| {
                    AuthError::invalid_argument(format!("Invalid header key {key:?}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            backend,
            scope,
            header_keys,
            cache: SingleFlightCache::new(clock, cache_replacement_policy, maximum_cache_size),
        })
    }

    /// Returns the verdict cache's counters.
    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }

    fn request(&self, headers: &HeaderMap) -> AuthenticateRequest {
        let mut request_metadata = BTreeMap::new();
        for key in &self.header_keys {
            let values: Vec<String> = headers
                .get_all(key)
                .iter()
                .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
                .collect();
            if !values.is_empty() {
                request_metadata.insert(key.as_str().to_owned(), values);
            }
        }
        AuthenticateRequest { scope: self.scope.clone(), request_metadata }
    }
}

fn cache_key(request: &AuthenticateRequest) -> Result<[u8; 32]> {
    let value = serde_json::to_value(request).map_err(|err| {
        AuthError::internal_with_source("Failed to serialize authentication request", err)
    })?;
    Ok(Sha256::digest(canonical_json(&value)).into())
}

fn verdict_result(verdict: AuthenticateVerdict) -> CachedVerdict {
    match verdict {
        AuthenticateVerdict::Allow(raw) => AuthenticationMetadata::from_raw(raw)
            .map(Arc::new)
            .map_err(|err| {
                AuthError::internal(format!(
                    "Remote authentication service returned invalid metadata: {}",
                    err.message()
                ))
            }),
        AuthenticateVerdict::Deny(reason) => Err(AuthError::unauthenticated(reason)),
    }
}

#[async_trait]
impl Authenticator for RemoteRequestHeadersAuthenticator {
    #[tracing::instrument(name = "authenticate", skip_all)]
    async fn authenticate(
        &self,
        ctx: &RequestContext,
        headers: &HeaderMap,
    ) -> Result<Arc<AuthenticationMetadata>> {
        let request = self.request(headers);
        let key = cache_key(&request)?;
        loop {
            match self.cache.lookup(&key) {
                Lookup::Cached(verdict) => return verdict,
                Lookup::Wait(waiter) => waiter.wait(ctx).await?,
                Lookup::Owner(in_flight) => {
                    fail::fail_point!("remote-authn-before-rpc", |_| {
                        Err(AuthError::unavailable("Injected failure before remote authentication"))
                    });
                    let (verdict, cache_until) =
                        match self.backend.authenticate(ctx, &request).await {
                            Ok(response) => {
                                let verdict = verdict_result(response.verdict);
                                let cacheable = !matches!(&verdict, Err(AuthError::Internal { .. }));
                                (verdict, response.cache_expiration_time.filter(|_| cacheable))
                            },
                            Err(err) => (Err(err), None),
                        };
                    if let Err(err) = &verdict {
                        tracing::debug!(error = %err, "Remote authentication did not succeed");
                    }
                    in_flight.complete(cache_until.map(|until| (verdict.clone(), until)));
                    return verdict;
                },
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use castellan_cache::testutil::ManualClock;
    use chrono::TimeDelta;
    use http::HeaderValue;
    use serde_json::json;
    use tonic::Code;

    use super::*;
    use crate::testutil::MockAuthenticationBackend;

    fn authenticator(
        backend: Arc<MockAuthenticationBackend>,
        clock: Arc<ManualClock>,
    ) -> RemoteRequestHeadersAuthenticator {
        RemoteRequestHeadersAuthenticator::builder()
            .backend(backend)
            .scope(json!({"tenant": "a"}))
            .header_keys(vec!["Authorization".to_owned()])
            .clock(clock)
            .build()
            .unwrap()
    }

    fn headers(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_str(token).unwrap());
        headers.insert("x-ignored", HeaderValue::from_static("1"));
        headers
    }

    #[test]
    fn test_response_wire_format() {
        let allow: AuthenticateResponse = serde_json::from_value(json!({
            "allow": {"public": {"user": "alice"}},
            "cacheExpirationTime": "2021-11-01T16:00:00Z",
        }))
        .unwrap();
        assert_eq!(allow.verdict, AuthenticateVerdict::Allow(json!({"public": {"user": "alice"}})));
        assert!(allow.cache_expiration_time.is_some());

        let deny: AuthenticateResponse =
            serde_json::from_value(json!({"deny": "Token revoked"})).unwrap();
        assert_eq!(deny.verdict, AuthenticateVerdict::Deny("Token revoked".to_owned()));
        assert_eq!(deny.cache_expiration_time, None);
    }

    #[test]
    fn test_invalid_header_key() {
        let err = RemoteRequestHeadersAuthenticator::builder()
            .backend(Arc::new(MockAuthenticationBackend::deny("no")))
            .header_keys(vec!["bad header".to_owned()])
            .build()
            .err()
            .unwrap();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_only_configured_headers_are_forwarded() {
        let clock = Arc::new(ManualClock::at_unix(1_000));
        let backend = Arc::new(MockAuthenticationBackend::allow(json!({}), None));
        let authenticator = authenticator(backend.clone(), clock);

        authenticator.authenticate(&RequestContext::new(), &headers("Bearer x")).await.unwrap();

        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].scope, json!({"tenant": "a"}));
        assert_eq!(
            requests[0].request_metadata,
            BTreeMap::from([("authorization".to_owned(), vec!["Bearer x".to_owned()])])
        );
    }

    #[tokio::test]
    async fn test_verdicts_cached_until_expiration() {
        let clock = Arc::new(ManualClock::at_unix(1_000));
        let until = clock.now() + TimeDelta::seconds(60);
        let backend = Arc::new(MockAuthenticationBackend::allow(
            json!({"public": {"user": "alice"}}),
            Some(until),
        ));
        let authenticator = authenticator(backend.clone(), clock.clone());
        let ctx = RequestContext::new();

        let metadata = authenticator.authenticate(&ctx, &headers("Bearer x")).await.unwrap();
        assert_eq!(metadata.public(), Some(&json!({"user": "alice"})));
        authenticator.authenticate(&ctx, &headers("Bearer x")).await.unwrap();
        assert_eq!(backend.calls(), 1);

        // A different credential is a different key.
        authenticator.authenticate(&ctx, &headers("Bearer y")).await.unwrap();
        assert_eq!(backend.calls(), 2);

        clock.set(until);
        authenticator.authenticate(&ctx, &headers("Bearer x")).await.unwrap();
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test]
    async fn test_deny_is_unauthenticated_and_cached() {
        let clock = Arc::new(ManualClock::at_unix(1_000));
        let backend = Arc::new(
            MockAuthenticationBackend::deny("Token revoked")
                .with_cache_expiration_time(clock.now() + TimeDelta::seconds(60)),
        );
        let authenticator = authenticator(backend.clone(), clock);
        let ctx = RequestContext::new();

        for _ in 0..2 {
            let err = authenticator.authenticate(&ctx, &headers("Bearer x")).await.unwrap_err();
            assert_eq!(err.code(), Code::Unauthenticated);
            assert_eq!(err.message(), "Token revoked");
        }
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_uncacheable_verdicts_are_refetched() {
        let clock = Arc::new(ManualClock::at_unix(1_000));
        let backend = Arc::new(MockAuthenticationBackend::allow(json!({}), None));
        let authenticator = authenticator(backend.clone(), clock);
        let ctx = RequestContext::new();

        authenticator.authenticate(&ctx, &headers("Bearer x")).await.unwrap();
        authenticator.authenticate(&ctx, &headers("Bearer x")).await.unwrap();
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalid_metadata_is_internal_and_not_cached() {
        let clock = Arc::new(ManualClock::at_unix(1_000));
        let until = clock.now() + TimeDelta::seconds(60);
        let backend =
            Arc::new(MockAuthenticationBackend::allow(json!({"unexpected": true}), Some(until)));
        let authenticator = authenticator(backend.clone(), clock);
        let ctx = RequestContext::new();

        for _ in 0..2 {
            let err = authenticator.authenticate(&ctx, &headers("Bearer x")).await.unwrap_err();
            assert_eq!(err.code(), Code::Internal);
        }
        assert_eq!(backend.calls(), 2);
    }
}
