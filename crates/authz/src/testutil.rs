//! Shared test utilities for authorizers.
//!
//! Enabled with the `testutil` feature. Provides a scriptable
//! [`AuthorizationBackend`] that records the requests it receives.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use castellan_authn::{AuthError, Result};
use castellan_cache::RequestContext;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::remote::{
    AuthorizationBackend, AuthorizeRequest, AuthorizeResponse, AuthorizeResult, AuthorizeVerdict,
};

/// Scriptable [`AuthorizationBackend`].
///
/// Each requested instance name gets the verdict configured for it, or the
/// default verdict, with a common cache expiration time.
pub struct MockAuthorizationBackend {
    verdicts: HashMap<String, AuthorizeVerdict>,
    default_verdict: AuthorizeVerdict,
    cache_expiration_time: Option<DateTime<Utc>>,
    response: Mutex<Option<Result<AuthorizeResponse>>>,
    delay: Duration,
    requests: Mutex<Vec<AuthorizeRequest>>,
}

impl MockAuthorizationBackend {
    fn new(default_verdict: AuthorizeVerdict, cache_expiration_time: Option<DateTime<Utc>>) -> Self {
        Self {
            verdicts: HashMap::new(),
            default_verdict,
            cache_expiration_time,
            response: Mutex::new(None),
            delay: Duration::ZERO,
            requests: Mutex::default(),
        }
    }

    /// Creates a backend that allows every instance name.
    pub fn allow(cache_expiration_time: Option<DateTime<Utc>>) -> Self {
        Self::new(AuthorizeVerdict::Allow, cache_expiration_time)
    }

    /// Creates a backend that denies every instance name with `reason`.
    pub fn deny(reason: impl Into<String>, cache_expiration_time: Option<DateTime<Utc>>) -> Self {
        Self::new(AuthorizeVerdict::Deny(reason.into()), cache_expiration_time)
    }

    /// Creates a backend with per-instance-name verdicts. Other names are
    /// denied.
    pub fn with_verdicts<'a>(
        verdicts: impl IntoIterator<Item = (&'a str, AuthorizeVerdict)>,
        cache_expiration_time: Option<DateTime<Utc>>,
    ) -> Self {
        let mut backend =
            Self::new(AuthorizeVerdict::Deny("Unknown instance name".to_owned()), cache_expiration_time);
        backend.verdicts =
            verdicts.into_iter().map(|(name, verdict)| (name.to_owned(), verdict)).collect();
        backend
    }

    /// Creates a backend that fails every request with `err`.
    pub fn failing(err: AuthError) -> Self {
        let backend = Self::allow(None);
        backend.set_response(Err(err));
        backend
    }

    /// Delays every response by `delay`.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Returns `response` for every request from now on, regardless of the
    /// configured verdicts.
    pub fn set_response(&self, response: Result<AuthorizeResponse>) {
        *self.response.lock() = Some(response);
    }

    /// Returns the number of requests received.
    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    /// Returns the requests received so far.
    pub fn requests(&self) -> Vec<AuthorizeRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl AuthorizationBackend for MockAuthorizationBackend {
    async fn authorize(
        &self,
        ctx: &RequestContext,
        request: &AuthorizeRequest,
    ) -> Result<AuthorizeResponse> {
        self.requests.lock().push(request.clone());
        if !self.delay.is_zero() {
            ctx.run(async {
                tokio::time::sleep(self.delay).await;
                Ok::<_, AuthError>(())
            })
            .await?;
        }
        if let Some(response) = &*self.response.lock() {
            return response.clone();
        }
        let results = request
            .instance_names
            .iter()
            .map(|name| AuthorizeResult {
                verdict: self
                    .verdicts
                    .get(name.as_str())
                    .unwrap_or(&self.default_verdict)
                    .clone(),
                cache_expiration_time: self.cache_expiration_time,
            })
            .collect();
        Ok(AuthorizeResponse { results })
    }
}
