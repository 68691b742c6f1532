//! HTTP authenticators.
//!
//! Unlike request-metadata [`Authenticator`]s, an [`HttpAuthenticator`] may
//! take over the response, for example to redirect a browser to an identity
//! provider. The outcome is an [`HttpAuthentication`]: either metadata
//! (optionally with a cookie to set on the eventual response) or a response
//! the caller must send instead of serving the request.

use std::sync::Arc;

use async_trait::async_trait;
use castellan_cache::RequestContext;
use http::{HeaderValue, header::ACCEPT, request::Parts};
use tonic::Code;

use crate::{
    authenticator::{Authenticator, join_unauthenticated},
    error::{AuthError, Result},
    metadata::AuthenticationMetadata,
};

/// Outcome of authenticating an HTTP request.
#[derive(Debug)]
pub enum HttpAuthentication {
    /// The request is authenticated and may be served.
    Authenticated {
        /// Metadata of the requester.
        metadata: Arc<AuthenticationMetadata>,
        /// `Set-Cookie` value to attach to the response, if any.
        set_cookie: Option<HeaderValue>,
    },
    /// The authenticator produced a response (such as a redirect) that must
    /// be sent instead of serving the request.
    Responded(http::Response<String>),
}

impl HttpAuthentication {
    /// Returns the metadata if the request was authenticated.
    pub fn metadata(&self) -> Option<&Arc<AuthenticationMetadata>> {
        match self {
            Self::Authenticated { metadata, .. } => Some(metadata),
            Self::Responded(_) => None,
        }
    }
}

/// Authenticates HTTP requests.
#[async_trait]
pub trait HttpAuthenticator: Send + Sync {
    /// Authenticates the request described by `request`.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Unauthenticated` if the request carries no
    /// acceptable credential and no response was produced.
    async fn authenticate(
        &self,
        ctx: &RequestContext,
        request: &Parts,
    ) -> Result<HttpAuthentication>;
}

/// Authenticates HTTP requests by their headers alone.
pub struct RequestHeadersHttpAuthenticator {
    authenticator: Arc<dyn Authenticator>,
}

impl RequestHeadersHttpAuthenticator {
    /// Wraps a request-metadata authenticator.
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self { authenticator }
    }
}

#[async_trait]
impl HttpAuthenticator for RequestHeadersHttpAuthenticator {
    async fn authenticate(
        &self,
        ctx: &RequestContext,
        request: &Parts,
    ) -> Result<HttpAuthentication> {
        let metadata = self.authenticator.authenticate(ctx, &request.headers).await?;
        Ok(HttpAuthentication::Authenticated { metadata, set_cookie: None })
    }
}

/// Tries each child in order and returns the first success or response.
///
/// Errors are combined as by
/// [`AnyAuthenticator`](crate::authenticator::AnyAuthenticator).
pub struct HttpAnyAuthenticator {
    authenticators: Vec<Arc<dyn HttpAuthenticator>>,
}

impl HttpAnyAuthenticator {
    /// Creates an authenticator over `authenticators`.
    pub fn new(authenticators: Vec<Arc<dyn HttpAuthenticator>>) -> Self {
        Self { authenticators }
    }
}

#[async_trait]
impl HttpAuthenticator for HttpAnyAuthenticator {
    async fn authenticate(
        &self,
        ctx: &RequestContext,
        request: &Parts,
    ) -> Result<HttpAuthentication> {
        let mut messages = Vec::with_capacity(self.authenticators.len());
        for authenticator in &self.authenticators {
            match authenticator.authenticate(ctx, request).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.code() == Code::Unauthenticated => {
                    messages.push(err.message().to_owned());
                },
                Err(err) => return Err(err),
            }
        }
        Err(join_unauthenticated(messages))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct MediaRange {
    kind: String,
    subtype: String,
}

impl MediaRange {
    /// Parses `type/subtype[;params]`, ignoring parameters.
    fn parse(value: &str) -> Option<Self> {
        let essence = value.split(';').next()?.trim();
        let (kind, subtype) = essence.split_once('/')?;
        let (kind, subtype) = (kind.trim(), subtype.trim());
        if kind.is_empty() || subtype.is_empty() {
            return None;
        }
        Some(Self { kind: kind.to_ascii_lowercase(), subtype: subtype.to_ascii_lowercase() })
    }

    /// Returns `true` if this range, taken from an `Accept` header, admits
    /// `media_type`.
    fn admits(&self, media_type: &MediaRange) -> bool {
        (self.kind == "*" || self.kind == media_type.kind)
            && (self.subtype == "*" || self.subtype == media_type.subtype)
    }

    /// `*/*` < `type/*` < `type/subtype`.
    fn specificity(&self) -> u8 {
        u8::from(self.kind != "*") + u8::from(self.subtype != "*")
    }
}

/// Parses an `Accept` header element into its range and `q` weight.
///
/// Elements with a malformed weight are skipped.
fn parse_accept_element(value: &str) -> Option<(MediaRange, f32)> {
    let range = MediaRange::parse(value)?;
    let mut quality = 1.0;
    for parameter in value.split(';').skip(1) {
        if let Some((name, weight)) = parameter.split_once('=')
            && name.trim().eq_ignore_ascii_case("q")
        {
            quality =
                weight.trim().parse::<f32>().ok().filter(|weight| (0.0..=1.0).contains(weight))?;
        }
    }
    Some((range, quality))
}

/// Applies another authenticator only to requests that accept one of a set
/// of media types.
///
/// A request without an `Accept` header accepts everything. Typically used
/// to restrict browser-oriented authentication (such as OIDC redirects) to
/// requests for HTML pages.
pub struct AcceptHeaderAuthenticator {
    media_types: Vec<MediaRange>,
    authenticator: Arc<dyn HttpAuthenticator>,
}

impl AcceptHeaderAuthenticator {
    /// Creates an authenticator delegating to `authenticator` when the
    /// request accepts one of `media_types`.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidArgument` if a media type is not of the
    /// form `type/subtype`.
    pub fn new(
        media_types: &[String],
        authenticator: Arc<dyn HttpAuthenticator>,
    ) -> Result<Self> {
        let media_types = media_types
            .iter()
            .map(|media_type| {
                MediaRange::parse(media_type).ok_or_else(|| {
                    AuthError::invalid_argument(format!("Invalid media type {media_type:?}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { media_types, authenticator })
    }

    fn accepts(&self, request: &Parts) -> bool {
        let mut values = request.headers.get_all(ACCEPT).iter().peekable();
        if values.peek().is_none() {
            return true;
        }
        let ranges: Vec<(MediaRange, f32)> = values
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .filter_map(parse_accept_element)
            .collect();
        // The most specific matching range decides; `q=0` means "not acceptable".
        self.media_types.iter().any(|media_type| {
            ranges
                .iter()
                .filter(|(range, _)| range.admits(media_type))
                .max_by_key(|(range, _)| range.specificity())
                .is_some_and(|(_, quality)| *quality > 0.0)
        })
    }
}

#[async_trait]
impl HttpAuthenticator for AcceptHeaderAuthenticator {
    async fn authenticate(
        &self,
        ctx: &RequestContext,
        request: &Parts,
    ) -> Result<HttpAuthentication> {
        if !self.accepts(request) {
            return Err(AuthError::unauthenticated(
                "Client does not accept any of the media types of this authentication method",
            ));
        }
        self.authenticator.authenticate(ctx, request).await
    }
}
