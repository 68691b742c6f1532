//! Authentication and authorization error types.
//!
//! Errors follow the gRPC status taxonomy so they can be surfaced unchanged
//! over RPC ([`tonic::Status`]) or mapped onto HTTP responses.

use std::sync::Arc;

use castellan_cache::ContextError;
use http::{HeaderValue, StatusCode, header::CONTENT_TYPE};
use thiserror::Error;
use tonic::Code;

/// Type alias for boxed errors used as error sources.
///
/// Uses `Arc` instead of `Box` so that [`AuthError`] can implement `Clone`,
/// which cached verdicts require.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Authentication and authorization errors.
///
/// # Non-exhaustive
///
/// New variants may be added in future minor releases. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// Malformed configuration or request data.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid or missing credential.
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// Valid credential that is not allowed to access the requested scope.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Transient failure of a remote service. Never cached.
    #[error("Unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
        /// The underlying error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// Unexpected failure of an expression or signature engine.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
        /// The underlying error, if any.
        #[source]
        source: Option<BoxError>,
    },

    /// The request context was cancelled.
    #[error("Request canceled")]
    Canceled,

    /// The request context's deadline passed.
    #[error("Deadline exceeded")]
    DeadlineExceeded,
}

impl AuthError {
    /// Creates a new `InvalidArgument` error.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Creates a new `Unauthenticated` error.
    #[must_use]
    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::Unauthenticated(message.into())
    }

    /// Creates a new `PermissionDenied` error.
    #[must_use]
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied(message.into())
    }

    /// Creates a new `Unavailable` error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable { message: message.into(), source: None }
    }

    /// Creates a new `Unavailable` error with a source error.
    #[must_use]
    pub fn unavailable_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Unavailable { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Internal` error with a source error.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Returns the status code of this error.
    #[must_use]
    pub fn code(&self) -> Code {
        match self {
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::Unauthenticated(_) => Code::Unauthenticated,
            Self::PermissionDenied(_) => Code::PermissionDenied,
            Self::Unavailable { .. } => Code::Unavailable,
            Self::Internal { .. } => Code::Internal,
            Self::Canceled => Code::Cancelled,
            Self::DeadlineExceeded => Code::DeadlineExceeded,
        }
    }

    /// Returns the message without the status prefix.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::InvalidArgument(message)
            | Self::Unauthenticated(message)
            | Self::PermissionDenied(message)
            | Self::Unavailable { message, .. }
            | Self::Internal { message, .. } => message,
            Self::Canceled => "Request canceled",
            Self::DeadlineExceeded => "Deadline exceeded",
        }
    }

    /// Returns `true` if retrying the same request may succeed.
    ///
    /// Transient errors are never cached.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Canceled | Self::DeadlineExceeded)
    }

    /// Returns the HTTP status used when this error ends an HTTP request.
    #[must_use]
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Self::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            // 499 Client Closed Request.
            Self::Canceled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            Self::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Converts this error into a plain-text HTTP response carrying the message.
    #[must_use]
    pub fn into_http_response(self) -> http::Response<String> {
        let status = self.http_status();
        let mut response = http::Response::new(self.message().to_owned());
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        response
    }
}

impl From<ContextError> for AuthError {
    fn from(err: ContextError) -> Self {
        match err {
            ContextError::Canceled => Self::Canceled,
            ContextError::DeadlineExceeded => Self::DeadlineExceeded,
        }
    }
}

impl From<AuthError> for tonic::Status {
    fn from(err: AuthError) -> Self {
        tonic::Status::new(err.code(), err.message())
    }
}

/// Result type alias for authentication and authorization operations.
pub type Result<T> = std::result::Result<T, AuthError>;
