//! Authentication policy configuration.
//!
//! Policies are plain `serde` types. Unions are externally tagged, so a
//! policy reads as `{"jwt": {...}}` or `{"any": [...]}`. Durations use
//! human-readable strings such as `"300s"` or `"1m"`.
//!
//! ```
//! use castellan_authn::config::AuthenticationPolicy;
//!
//! let policy: AuthenticationPolicy = serde_json::from_str(
//!     r#"{"any": [{"deny": "Maintenance"}, {"allow": {"public": {"user": "guest"}}}]}"#,
//! )
//! .unwrap();
//! assert!(matches!(policy, AuthenticationPolicy::Any(ref children) if children.len() == 2));
//! ```

use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use castellan_cache::CacheReplacementPolicy;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::{
    expression::DEFAULT_CONTEXT_FILE_REFRESH_INTERVAL, jwks::DEFAULT_JWK_SET_REFRESH_INTERVAL,
    jwt::DEFAULT_MAXIMUM_CACHE_SIZE, oidc::DEFAULT_OIDC_REQUEST_TIMEOUT,
    remote::DEFAULT_REMOTE_REQUEST_TIMEOUT,
};

fn default_maximum_cache_size() -> usize {
    DEFAULT_MAXIMUM_CACHE_SIZE
}

fn default_context_file_refresh_interval() -> Duration {
    DEFAULT_CONTEXT_FILE_REFRESH_INTERVAL
}

fn default_jwk_set_refresh_interval() -> Duration {
    DEFAULT_JWK_SET_REFRESH_INTERVAL
}

fn default_remote_request_timeout() -> Duration {
    DEFAULT_REMOTE_REQUEST_TIMEOUT
}

fn default_oidc_request_timeout() -> Duration {
    DEFAULT_OIDC_REQUEST_TIMEOUT
}

/// Policy for authenticating requests by their metadata (headers).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub enum AuthenticationPolicy {
    /// Accept every request with the given raw metadata.
    Allow(Value),
    /// Reject every request with the given message.
    Deny(String),
    /// Accept the request if any child policy accepts it.
    Any(Vec<AuthenticationPolicy>),
    /// Accept requests carrying a valid bearer JWT.
    Jwt(JwtConfig),
    /// Ask a remote service.
    Remote(RemoteAuthenticatorConfig),
}

/// Policy for authenticating HTTP requests.
///
/// A superset of [`AuthenticationPolicy`] that adds policies which need the
/// full request or may answer it themselves.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub enum HttpAuthenticationPolicy {
    /// Accept every request with the given raw metadata.
    Allow(Value),
    /// Reject every request with the given message.
    Deny(String),
    /// Accept the request if any child policy accepts it.
    Any(Vec<HttpAuthenticationPolicy>),
    /// Accept requests carrying a valid bearer JWT.
    Jwt(JwtConfig),
    /// Ask a remote service.
    Remote(RemoteAuthenticatorConfig),
    /// Log browsers in through an OpenID Connect provider.
    Oidc(OidcConfig),
    /// Apply a policy only to requests accepting certain media types.
    AcceptHeader(AcceptHeaderConfig),
}

/// Configuration of [`HttpAuthenticationPolicy::AcceptHeader`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, bon::Builder)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AcceptHeaderConfig {
    /// Media types (`type/subtype`) for which `policy` applies.
    pub media_types: Vec<String>,

    /// Policy applied to matching requests.
    pub policy: Box<HttpAuthenticationPolicy>,
}

/// A JMESPath expression and the files it may consult.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, bon::Builder)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExpressionConfig {
    /// The expression.
    #[builder(into)]
    pub expression: String,

    /// JSON files exposed to the expression under `files.<name>`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    #[builder(default)]
    pub context_files: BTreeMap<String, PathBuf>,

    /// How often `context_files` are reloaded.
    #[serde(with = "humantime_serde", default = "default_context_file_refresh_interval")]
    #[builder(default = DEFAULT_CONTEXT_FILE_REFRESH_INTERVAL)]
    pub refresh_interval: Duration,
}

impl ExpressionConfig {
    /// Returns a configuration for `expression` without context files.
    pub fn new(expression: impl Into<String>) -> Self {
        Self::builder().expression(expression).build()
    }
}

/// Where JWT signing keys come from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub enum JwksSource {
    /// A JWK Set embedded in the configuration.
    Inline(Value),
    /// A JWK Set file, reloaded periodically.
    File(JwksFileConfig),
}

/// Configuration of [`JwksSource::File`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, bon::Builder)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JwksFileConfig {
    /// Path of the JWK Set file.
    #[builder(into)]
    pub path: PathBuf,

    /// How often the file is reloaded.
    #[serde(with = "humantime_serde", default = "default_jwk_set_refresh_interval")]
    #[builder(default = DEFAULT_JWK_SET_REFRESH_INTERVAL)]
    pub refresh_interval: Duration,
}

/// Configuration of bearer JWT authentication.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, bon::Builder)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JwtConfig {
    /// Signing keys.
    pub jwks: JwksSource,

    /// Eviction policy of the header cache.
    #[serde(default)]
    #[builder(default)]
    pub cache_replacement_policy: CacheReplacementPolicy,

    /// Maximum number of cached headers.
    #[serde(default = "default_maximum_cache_size")]
    #[builder(default = DEFAULT_MAXIMUM_CACHE_SIZE)]
    pub maximum_cache_size: usize,

    /// Expression over the claims that must evaluate to `true`.
    pub claims_validation: ExpressionConfig,

    /// Expression mapping the claims to raw authentication metadata.
    pub metadata_extraction: ExpressionConfig,
}

/// Configuration of remote authentication.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, bon::Builder)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RemoteAuthenticatorConfig {
    /// URL of the remote authentication service.
    pub endpoint: Url,

    /// Opaque value forwarded with every request.
    #[serde(default)]
    #[builder(default)]
    pub scope: Value,

    /// Names of the headers forwarded to the service.
    #[serde(default)]
    #[builder(default)]
    pub header_keys: Vec<String>,

    /// Eviction policy of the verdict cache.
    #[serde(default)]
    #[builder(default)]
    pub cache_replacement_policy: CacheReplacementPolicy,

    /// Maximum number of cached verdicts.
    #[serde(default = "default_maximum_cache_size")]
    #[builder(default = DEFAULT_MAXIMUM_CACHE_SIZE)]
    pub maximum_cache_size: usize,

    /// Timeout of each call to the service.
    #[serde(with = "humantime_serde", default = "default_remote_request_timeout")]
    #[builder(default = DEFAULT_REMOTE_REQUEST_TIMEOUT)]
    pub timeout: Duration,
}

/// Where OIDC claims come from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub enum UserInfoSource {
    /// Fetch claims from the given user info endpoint.
    UserInfoEndpointUrl(Url),
    /// Use the claims of the ID token.
    UseIdTokenClaims,
}

/// HTTP client settings for calls to an OIDC provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HttpClientConfig {
    /// Timeout of each request.
    #[serde(with = "humantime_serde", default = "default_oidc_request_timeout")]
    #[builder(default = DEFAULT_OIDC_REQUEST_TIMEOUT)]
    pub timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Configuration of OIDC login.
///
/// The whole configuration, `cookie_seed` included, determines the session
/// cookie's name and key; any change logs every browser out.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, bon::Builder)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OidcConfig {
    /// OAuth2 client ID.
    #[builder(into)]
    pub client_id: String,

    /// OAuth2 client secret.
    #[builder(into)]
    pub client_secret: String,

    /// The provider's authorization endpoint.
    pub authorization_endpoint_url: Url,

    /// The provider's token endpoint.
    pub token_endpoint_url: Url,

    /// Where claims come from.
    pub user_info_source: UserInfoSource,

    /// Expression mapping the claims to raw authentication metadata.
    pub metadata_extraction: ExpressionConfig,

    /// URL the provider redirects browsers back to. Its path is reserved.
    pub redirect_url: Url,

    /// Scopes requested in addition to `openid`.
    #[serde(default)]
    #[builder(default)]
    pub scopes: Vec<String>,

    /// Secret mixed into the session cookie key.
    #[builder(into)]
    pub cookie_seed: String,

    /// HTTP client settings.
    #[serde(default)]
    #[builder(default)]
    pub http_client: HttpClientConfig,
}
