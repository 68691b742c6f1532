//! # Castellan Authentication
//!
//! Authenticators that turn request credentials into
//! [`AuthenticationMetadata`], with the caches that keep them cheap.
//!
//! This crate provides:
//! - **Bearer JWTs**: signature validators for HMAC, RSA, ECDSA and Ed25519 keys loaded from JWK
//!   Sets (hot-reloaded from disk), and a caching `Authorization` header parser
//! - **OIDC**: browser login through an OpenID Connect provider with encrypted session cookies
//! - **Remote authentication**: verdicts from an external service, cached and deduplicated per
//!   credential
//! - **Combinators**: allow, deny, any-of and `Accept`-header routing
//! - **Configuration**: `serde` policy types and factories that validate them up front
//!
//! ## Example
//!
//! ```no_run
//! use castellan_authn::{
//!     config::AuthenticationPolicy,
//!     factory::{AuthenticatorDependencies, new_authenticator},
//! };
//! use castellan_cache::RequestContext;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy: AuthenticationPolicy = serde_json::from_str(
//!     r#"{"jwt": {
//!         "jwks": {"file": {"path": "/etc/castellan/jwks.json"}},
//!         "claimsValidation": {"expression": "iss == 'https://idp.example.com'"},
//!         "metadataExtraction": {"expression": "{public: {user: sub}}"}
//!     }}"#,
//! )?;
//! let authenticator = new_authenticator(&policy, &AuthenticatorDependencies::default())?;
//!
//! let headers = http::HeaderMap::new();
//! let metadata = authenticator.authenticate(&RequestContext::new(), &headers).await?;
//! println!("public metadata: {:?}", metadata.public());
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Request-metadata authenticators.
pub mod authenticator;
/// Authentication policy configuration.
pub mod config;
/// Authentication error types.
pub mod error;
/// JMESPath expressions.
pub mod expression;
/// Authenticators from configuration.
pub mod factory;
/// HTTP authenticators.
pub mod http;
/// JWK Set loading and reloading.
pub mod jwks;
/// Bearer JWT parsing and caching.
pub mod jwt;
/// Authentication metadata.
pub mod metadata;
/// OpenID Connect login.
pub mod oidc;
/// Remote authentication.
pub mod remote;
/// JWS signature validation.
pub mod signature;
/// Shared test utilities (enabled with the `testutil` feature).
#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

// Re-export key types for convenience
pub use authenticator::Authenticator;
pub use error::{AuthError, Result};
pub use factory::{AuthenticatorDependencies, new_authenticator, new_http_authenticator};
pub use crate::http::{HttpAuthentication, HttpAuthenticator};
pub use jwt::AuthorizationHeaderParser;
pub use metadata::AuthenticationMetadata;
pub use oidc::OidcAuthenticator;
pub use remote::RemoteRequestHeadersAuthenticator;
pub use crate::signature::SignatureValidator;
