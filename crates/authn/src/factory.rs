//! Construction of authenticators from configuration.
//!
//! All validation happens here: a policy that builds successfully never
//! fails at request time because of its configuration.

use std::sync::Arc;

use castellan_cache::{Clock, SystemClock};
use tokio_util::sync::CancellationToken;

use crate::{
    authenticator::{
        AllowAuthenticator, AnyAuthenticator, Authenticator, DenyAuthenticator, JwtAuthenticator,
    },
    config::{
        AuthenticationPolicy, ExpressionConfig, HttpAuthenticationPolicy, JwksSource, JwtConfig,
        OidcConfig, RemoteAuthenticatorConfig, UserInfoSource,
    },
    error::{AuthError, Result},
    expression::Expression,
    http::{
        AcceptHeaderAuthenticator, HttpAnyAuthenticator, HttpAuthenticator,
        RequestHeadersHttpAuthenticator,
    },
    jwks::{
        parse_jwk_set, signature_validator_from_jwk_set, signature_validator_from_jwk_set_file,
        spawn_jwk_set_reloader,
    },
    jwt::AuthorizationHeaderParser,
    metadata::{AuthenticationMetadata, canonical_json},
    oidc::{ClaimsSource, OidcAuthenticator, SharedRng, default_rng},
    remote::{HttpAuthenticationBackend, RemoteRequestHeadersAuthenticator},
    signature::{ForwardingSignatureValidator, SignatureValidator},
};

/// Collaborators shared by every authenticator built from one
/// configuration.
///
/// Background tasks (key and context file reloaders) run until `shutdown`
/// is cancelled.
#[derive(Clone, bon::Builder)]
pub struct AuthenticatorDependencies {
    /// Source of the current time.
    #[builder(default = Arc::new(SystemClock))]
    pub clock: Arc<dyn Clock>,

    /// HTTP client for remote services and OIDC providers.
    #[builder(default)]
    pub http_client: reqwest::Client,

    /// Stops background tasks.
    #[builder(default)]
    pub shutdown: CancellationToken,

    /// Source of session nonces and state verifiers.
    #[builder(default = default_rng())]
    pub rng: SharedRng,
}

impl Default for AuthenticatorDependencies {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builds a request-metadata authenticator from `policy`.
///
/// # Errors
///
/// Returns `AuthError::InvalidArgument` if the policy is invalid, for
/// example because an expression does not compile or a JWK Set is empty.
pub fn new_authenticator(
    policy: &AuthenticationPolicy,
    dependencies: &AuthenticatorDependencies,
) -> Result<Arc<dyn Authenticator>> {
    let authenticator: Arc<dyn Authenticator> = match policy {
        AuthenticationPolicy::Allow(raw) => allow_authenticator(raw)?,
        AuthenticationPolicy::Deny(message) => Arc::new(DenyAuthenticator::new(message.clone())),
        AuthenticationPolicy::Any(policies) => Arc::new(AnyAuthenticator::new(
            policies
                .iter()
                .map(|policy| new_authenticator(policy, dependencies))
                .collect::<Result<_>>()?,
        )),
        AuthenticationPolicy::Jwt(config) => jwt_authenticator(config, dependencies)?,
        AuthenticationPolicy::Remote(config) => remote_authenticator(config, dependencies)?,
    };
    Ok(authenticator)
}

/// Builds an HTTP authenticator from `policy`.
///
/// # Errors
///
/// Returns `AuthError::InvalidArgument` if the policy is invalid.
pub fn new_http_authenticator(
    policy: &HttpAuthenticationPolicy,
    dependencies: &AuthenticatorDependencies,
) -> Result<Arc<dyn HttpAuthenticator>> {
    let headers_only = |authenticator: Arc<dyn Authenticator>| -> Arc<dyn HttpAuthenticator> {
        Arc::new(RequestHeadersHttpAuthenticator::new(authenticator))
    };
    let authenticator: Arc<dyn HttpAuthenticator> = match policy {
        HttpAuthenticationPolicy::Allow(raw) => headers_only(allow_authenticator(raw)?),
        HttpAuthenticationPolicy::Deny(message) => {
            headers_only(Arc::new(DenyAuthenticator::new(message.clone())))
        },
        HttpAuthenticationPolicy::Any(policies) => Arc::new(HttpAnyAuthenticator::new(
            policies
                .iter()
                .map(|policy| new_http_authenticator(policy, dependencies))
                .collect::<Result<_>>()?,
        )),
        HttpAuthenticationPolicy::Jwt(config) => {
            headers_only(jwt_authenticator(config, dependencies)?)
        },
        HttpAuthenticationPolicy::Remote(config) => {
            headers_only(remote_authenticator(config, dependencies)?)
        },
        HttpAuthenticationPolicy::Oidc(config) => {
            Arc::new(oidc_authenticator(config, dependencies)?)
        },
        HttpAuthenticationPolicy::AcceptHeader(config) => {
            Arc::new(AcceptHeaderAuthenticator::new(
                &config.media_types,
                new_http_authenticator(&config.policy, dependencies)?,
            )?)
        },
    };
    Ok(authenticator)
}

fn allow_authenticator(raw: &serde_json::Value) -> Result<Arc<dyn Authenticator>> {
    Ok(Arc::new(AllowAuthenticator::new(AuthenticationMetadata::from_raw(raw.clone())?)))
}

fn jwt_authenticator(
    config: &JwtConfig,
    dependencies: &AuthenticatorDependencies,
) -> Result<Arc<dyn Authenticator>> {
    Ok(Arc::new(JwtAuthenticator::new(Arc::new(new_authorization_header_parser(
        config,
        dependencies,
    )?))))
}

/// Builds the bearer token parser described by `config`.
///
/// A JWK Set file is loaded before this returns and then reloaded in the
/// background.
///
/// # Errors
///
/// Returns `AuthError::InvalidArgument` if the configuration is invalid,
/// and `AuthError::Internal` if a background task is needed but no Tokio
/// runtime is running.
pub fn new_authorization_header_parser(
    config: &JwtConfig,
    dependencies: &AuthenticatorDependencies,
) -> Result<AuthorizationHeaderParser> {
    check_maximum_cache_size(config.maximum_cache_size)?;
    let claims_validator = expression(&config.claims_validation, dependencies)?;
    let metadata_extractor = expression(&config.metadata_extraction, dependencies)?;

    let signature_validator: Arc<dyn SignatureValidator> = match &config.jwks {
        JwksSource::Inline(jwk_set) => {
            let bytes = serde_json::to_vec(jwk_set).map_err(|err| {
                AuthError::invalid_argument(format!("Invalid inline JWK Set: {err}"))
            })?;
            Arc::new(signature_validator_from_jwk_set(&parse_jwk_set(&bytes)?)?)
        },
        JwksSource::File(file) => {
            let initial = signature_validator_from_jwk_set_file(&file.path)?;
            require_runtime("JWK Set reloader")?;
            let forwarding = Arc::new(ForwardingSignatureValidator::new(Box::new(initial)));
            spawn_jwk_set_reloader(
                file.path.clone(),
                Arc::clone(&forwarding),
                file.refresh_interval,
                dependencies.shutdown.clone(),
            );
            forwarding
        },
    };

    AuthorizationHeaderParser::builder()
        .clock(Arc::clone(&dependencies.clock))
        .signature_validator(signature_validator)
        .claims_validator(claims_validator)
        .metadata_extractor(metadata_extractor)
        .cache_replacement_policy(config.cache_replacement_policy)
        .maximum_cache_size(config.maximum_cache_size)
        .build()
}

fn remote_authenticator(
    config: &RemoteAuthenticatorConfig,
    dependencies: &AuthenticatorDependencies,
) -> Result<Arc<dyn Authenticator>> {
    check_maximum_cache_size(config.maximum_cache_size)?;
    let backend = HttpAuthenticationBackend::builder()
        .endpoint(config.endpoint.clone())
        .client(dependencies.http_client.clone())
        .timeout(config.timeout)
        .build();
    Ok(Arc::new(
        RemoteRequestHeadersAuthenticator::builder()
            .backend(Arc::new(backend))
            .scope(config.scope.clone())
            .header_keys(config.header_keys.clone())
            .clock(Arc::clone(&dependencies.clock))
            .cache_replacement_policy(config.cache_replacement_policy)
            .maximum_cache_size(config.maximum_cache_size)
            .build()?,
    ))
}

fn oidc_authenticator(
    config: &OidcConfig,
    dependencies: &AuthenticatorDependencies,
) -> Result<OidcAuthenticator> {
    let serialized = serde_json::to_value(config).map_err(|err| {
        AuthError::invalid_argument(format!("Invalid OIDC configuration: {err}"))
    })?;
    let claims_source = match &config.user_info_source {
        UserInfoSource::UserInfoEndpointUrl(url) => ClaimsSource::UserInfoEndpoint(url.clone()),
        UserInfoSource::UseIdTokenClaims => ClaimsSource::IdToken,
    };
    OidcAuthenticator::builder()
        .client_id(config.client_id.clone())
        .client_secret(config.client_secret.clone())
        .authorization_endpoint_url(config.authorization_endpoint_url.clone())
        .token_endpoint_url(config.token_endpoint_url.clone())
        .redirect_url(config.redirect_url.clone())
        .scopes(config.scopes.clone())
        .claims_source(claims_source)
        .metadata_extraction(expression(&config.metadata_extraction, dependencies)?)
        .cookie_seed(&canonical_json(&serialized))
        .http_client(dependencies.http_client.clone())
        .request_timeout(config.http_client.timeout)
        .clock(Arc::clone(&dependencies.clock))
        .rng(Arc::clone(&dependencies.rng))
        .build()
}

fn expression(
    config: &ExpressionConfig,
    dependencies: &AuthenticatorDependencies,
) -> Result<Expression> {
    Expression::with_context_files(
        &config.expression,
        &config.context_files,
        config.refresh_interval,
        &dependencies.shutdown,
    )
}

fn check_maximum_cache_size(maximum_cache_size: usize) -> Result<()> {
    if maximum_cache_size == 0 {
        return Err(AuthError::invalid_argument("Maximum cache size must be positive"));
    }
    Ok(())
}

fn require_runtime(task: &str) -> Result<()> {
    tokio::runtime::Handle::try_current().map(drop).map_err(|err| {
        AuthError::internal_with_source(format!("{task} requires a Tokio runtime"), err)
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use castellan_cache::RequestContext;
    use http::{HeaderMap, HeaderValue, header::AUTHORIZATION};
    use serde_json::{Value, json};
    use tonic::Code;

    use super::*;
    use crate::testutil::{hmac_jwk, jwk_set, sign_hs256_jwt};

    fn jwt_policy(jwks: Value, maximum_cache_size: usize) -> AuthenticationPolicy {
        serde_json::from_value(json!({"jwt": {
            "jwks": {"inline": jwks},
            "maximumCacheSize": maximum_cache_size,
            "claimsValidation": {"expression": "`true`"},
            "metadataExtraction": {"expression": "{public: {sub: sub}}"},
        }}))
        .unwrap()
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}")).unwrap());
        headers
    }

    #[tokio::test]
    async fn test_jwt_policy_end_to_end() {
        let policy = jwt_policy(jwk_set([hmac_jwk(None, b"secret")]), 10);
        let authenticator = new_authenticator(&policy, &AuthenticatorDependencies::default()).unwrap();

        let token = sign_hs256_jwt(b"secret", None, &json!({"sub": "alice"}));
        let metadata =
            authenticator.authenticate(&RequestContext::new(), &bearer(&token)).await.unwrap();
        assert_eq!(metadata.public(), Some(&json!({"sub": "alice"})));

        let forged = sign_hs256_jwt(b"other", None, &json!({"sub": "alice"}));
        let err = authenticator.authenticate(&RequestContext::new(), &bearer(&forged)).await;
        assert_eq!(err.unwrap_err().code(), Code::Unauthenticated);
    }

    #[test]
    fn test_empty_jwk_set_is_rejected() {
        let policy = jwt_policy(jwk_set(Vec::<Value>::new()), 10);
        let err = new_authenticator(&policy, &AuthenticatorDependencies::default()).err().unwrap();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[test]
    fn test_zero_cache_size_is_rejected() {
        let policy = jwt_policy(jwk_set([hmac_jwk(None, b"secret")]), 0);
        let err = new_authenticator(&policy, &AuthenticatorDependencies::default()).err().unwrap();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[test]
    fn test_invalid_expression_is_rejected() {
        let policy: AuthenticationPolicy = serde_json::from_value(json!({"jwt": {
            "jwks": {"inline": jwk_set([hmac_jwk(None, b"secret")])},
            "claimsValidation": {"expression": "[["},
            "metadataExtraction": {"expression": "`{}`"},
        }}))
        .unwrap();
        let err = new_authenticator(&policy, &AuthenticatorDependencies::default()).err().unwrap();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[test]
    fn test_invalid_allow_metadata_is_rejected() {
        let policy = AuthenticationPolicy::Allow(json!({"secret": true}));
        let err = new_authenticator(&policy, &AuthenticatorDependencies::default()).err().unwrap();
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_any_policy_combines_children() {
        let policy: AuthenticationPolicy = serde_json::from_value(json!({"any": [
            {"deny": "Not this one"},
            {"allow": {"public": {"user": "guest"}}},
        ]}))
        .unwrap();
        let authenticator = new_authenticator(&policy, &AuthenticatorDependencies::default()).unwrap();
        let metadata =
            authenticator.authenticate(&RequestContext::new(), &HeaderMap::new()).await.unwrap();
        assert_eq!(metadata.public(), Some(&json!({"user": "guest"})));
    }

    #[test]
    fn test_jwk_set_file_requires_runtime() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), jwk_set([hmac_jwk(None, b"secret")]).to_string()).unwrap();
        let policy: AuthenticationPolicy = serde_json::from_value(json!({"jwt": {
            "jwks": {"file": {"path": file.path()}},
            "claimsValidation": {"expression": "`true`"},
            "metadataExtraction": {"expression": "`{}`"},
        }}))
        .unwrap();
        let err = new_authenticator(&policy, &AuthenticatorDependencies::default()).err().unwrap();
        assert_eq!(err.code(), Code::Internal);
    }

    #[test]
    fn test_invalid_media_type_is_rejected() {
        let policy: HttpAuthenticationPolicy = serde_json::from_value(json!({"acceptHeader": {
            "mediaTypes": ["not a media type"],
            "policy": {"allow": {}},
        }}))
        .unwrap();
        let err =
            new_http_authenticator(&policy, &AuthenticatorDependencies::default()).err().unwrap();
        assert_eq!(err.code(), Code::InvalidArgument);
    }
}
