//! Request-metadata authenticators.
//!
//! An [`Authenticator`] inspects the headers (gRPC metadata) of an incoming
//! request and either produces [`AuthenticationMetadata`] or fails with
//! `Unauthenticated`. Authenticators compose:
//!
//! - [`AllowAuthenticator`] accepts every request with fixed metadata.
//! - [`DenyAuthenticator`] rejects every request with a fixed message.
//! - [`AnyAuthenticator`] returns the first success of its children.
//! - [`JwtAuthenticator`] validates `Authorization: Bearer` tokens.
//! - [`RemoteRequestHeadersAuthenticator`](crate::remote::RemoteRequestHeadersAuthenticator)
//!   delegates to a remote service.

use std::sync::Arc;

use async_trait::async_trait;
use castellan_cache::RequestContext;
use http::{HeaderMap, header::AUTHORIZATION};
use tonic::Code;

use crate::{
    error::{AuthError, Result},
    jwt::AuthorizationHeaderParser,
    metadata::AuthenticationMetadata,
};

/// Authenticates requests from their headers.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Returns the metadata of the authenticated requester.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Unauthenticated` if the request carries no
    /// acceptable credential, or another status for failures unrelated to
    /// the credential itself.
    async fn authenticate(
        &self,
        ctx: &RequestContext,
        headers: &HeaderMap,
    ) -> Result<Arc<AuthenticationMetadata>>;
}

/// Accepts every request.
#[derive(Debug)]
pub struct AllowAuthenticator {
    metadata: Arc<AuthenticationMetadata>,
}

impl AllowAuthenticator {
    /// Creates an authenticator that attaches `metadata` to every request.
    pub fn new(metadata: AuthenticationMetadata) -> Self {
        Self { metadata: Arc::new(metadata) }
    }
}

#[async_trait]
impl Authenticator for AllowAuthenticator {
    async fn authenticate(
        &self,
        _ctx: &RequestContext,
        _headers: &HeaderMap,
    ) -> Result<Arc<AuthenticationMetadata>> {
        Ok(Arc::clone(&self.metadata))
    }
}

/// Rejects every request.
#[derive(Debug)]
pub struct DenyAuthenticator {
    message: String,
}

impl DenyAuthenticator {
    /// Creates an authenticator failing with `message`.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

#[async_trait]
impl Authenticator for DenyAuthenticator {
    async fn authenticate(
        &self,
        _ctx: &RequestContext,
        _headers: &HeaderMap,
    ) -> Result<Arc<AuthenticationMetadata>> {
        Err(AuthError::unauthenticated(self.message.clone()))
    }
}

/// Tries each child in order and returns the first success.
///
/// A child failing with anything other than `Unauthenticated` ends the
/// search with that error. If every child fails with `Unauthenticated`, the
/// messages are combined.
pub struct AnyAuthenticator {
    authenticators: Vec<Arc<dyn Authenticator>>,
}

impl AnyAuthenticator {
    /// Creates an authenticator over `authenticators`.
    pub fn new(authenticators: Vec<Arc<dyn Authenticator>>) -> Self {
        Self { authenticators }
    }
}

#[async_trait]
impl Authenticator for AnyAuthenticator {
    async fn authenticate(
        &self,
        ctx: &RequestContext,
        headers: &HeaderMap,
    ) -> Result<Arc<AuthenticationMetadata>> {
        let mut messages = Vec::with_capacity(self.authenticators.len());
        for authenticator in &self.authenticators {
            match authenticator.authenticate(ctx, headers).await {
                Ok(metadata) => return Ok(metadata),
                Err(err) if err.code() == Code::Unauthenticated => {
                    messages.push(err.message().to_owned());
                },
                Err(err) => return Err(err),
            }
        }
        Err(join_unauthenticated(messages))
    }
}

pub(crate) fn join_unauthenticated(messages: Vec<String>) -> AuthError {
    if messages.is_empty() {
        AuthError::unauthenticated("No authenticators configured")
    } else {
        AuthError::unauthenticated(messages.join(", "))
    }
}

/// Authenticates requests carrying a valid JWT in an `Authorization` header.
pub struct JwtAuthenticator {
    parser: Arc<AuthorizationHeaderParser>,
}

impl JwtAuthenticator {
    /// Creates an authenticator backed by `parser`.
    pub fn new(parser: Arc<AuthorizationHeaderParser>) -> Self {
        Self { parser }
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(
        &self,
        _ctx: &RequestContext,
        headers: &HeaderMap,
    ) -> Result<Arc<AuthenticationMetadata>> {
        let values: Vec<&str> =
            headers.get_all(AUTHORIZATION).iter().filter_map(|value| value.to_str().ok()).collect();
        self.parser.parse_authorization_headers(&values).ok_or_else(|| {
            AuthError::unauthenticated("No valid authorization header containing a bearer token")
        })
    }
}
