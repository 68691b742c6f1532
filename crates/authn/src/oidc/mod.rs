//! Browser-facing OpenID Connect login.
//!
//! [`OidcAuthenticator`] keeps all session state in an encrypted cookie.
//! A request without a usable session is redirected to the identity
//! provider (or rejected, for programmatic clients). The provider sends the
//! browser back to the redirect URL, where the authorization code is
//! exchanged for tokens, claims are turned into authentication metadata and
//! an authenticated session cookie is issued. Expired sessions are renewed
//! with the refresh token when one is available.

mod session;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use castellan_cache::{Clock, RequestContext, SystemClock};
use chrono::{DateTime, TimeDelta, Utc};
use http::{
    HeaderName, HeaderValue, StatusCode,
    header::{ACCEPT, LOCATION, SET_COOKIE},
    request::Parts,
};
use parking_lot::Mutex;
use rand::{SeedableRng, rngs::StdRng};
use rand_core::RngCore;
use serde::Deserialize;
use serde_json::Value;
use subtle::ConstantTimeEq;
use url::Url;

use self::session::{SessionCodec, SessionState};
use crate::{
    error::{AuthError, Result},
    expression::Expression,
    http::{HttpAuthentication, HttpAuthenticator},
    metadata::AuthenticationMetadata,
};

/// Default timeout for requests to the token and user info endpoints.
pub const DEFAULT_OIDC_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Session lifetime assumed for the first token response without
/// `expires_in`. Each subsequent such response doubles it.
const INITIAL_DEFAULT_EXPIRATION_SECONDS: u64 = 60;

const STATE_VERIFIER_SIZE: usize = 16;
const OPENID_SCOPE: &str = "openid";
const SEC_FETCH_DEST: HeaderName = HeaderName::from_static("sec-fetch-dest");

/// Random number generator shared by components that draw secrets.
pub type SharedRng = Arc<Mutex<dyn RngCore + Send>>;

/// Returns a [`SharedRng`] seeded from the operating system.
pub fn default_rng() -> SharedRng {
    Arc::new(Mutex::new(StdRng::from_entropy()))
}

/// Where the claims fed to the metadata extraction expression come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimsSource {
    /// Fetch claims from the provider's user info endpoint.
    UserInfoEndpoint(Url),
    /// Decode the claims of the ID token returned by the token endpoint.
    IdToken,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
}

/// Authenticates browsers through an OpenID Connect provider.
pub struct OidcAuthenticator {
    client_id: String,
    client_secret: String,
    authorization_endpoint_url: Url,
    token_endpoint_url: Url,
    redirect_url: Url,
    scope: String,
    claims_source: ClaimsSource,
    metadata_extraction: Expression,
    codec: SessionCodec,
    http_client: reqwest::Client,
    request_timeout: Duration,
    clock: Arc<dyn Clock>,
    rng: SharedRng,
}

#[bon::bon]
impl OidcAuthenticator {
    /// Creates an authenticator.
    ///
    /// `cookie_seed` determines the session cookie's name and encryption
    /// key. Sessions issued under one seed are not readable under another.
    /// `scopes` are requested in addition to `openid`, which is always
    /// requested first.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Internal` if the cookie key cannot be derived.
    #[builder]
    pub fn new(
        #[builder(into)] client_id: String,
        #[builder(into)] client_secret: String,
        authorization_endpoint_url: Url,
        token_endpoint_url: Url,
        redirect_url: Url,
        #[builder(default)] scopes: Vec<String>,
        claims_source: ClaimsSource,
        metadata_extraction: Expression,
        cookie_seed: &[u8],
        #[builder(default)] http_client: reqwest::Client,
        #[builder(default = DEFAULT_OIDC_REQUEST_TIMEOUT)] request_timeout: Duration,
        #[builder(default = Arc::new(SystemClock))] clock: Arc<dyn Clock>,
        #[builder(default = default_rng())] rng: SharedRng,
    ) -> Result<Self> {
        let mut requested = vec![OPENID_SCOPE];
        for scope in &scopes {
            if !requested.contains(&scope.as_str()) {
                requested.push(scope);
            }
        }
        Ok(Self {
            client_id,
            client_secret,
            authorization_endpoint_url,
            token_endpoint_url,
            redirect_url,
            scope: requested.join(" "),
            claims_source,
            metadata_extraction,
            codec: SessionCodec::new(cookie_seed)?,
            http_client,
            request_timeout,
            clock,
            rng,
        })
    }

    /// Returns the name of the session cookie.
    pub fn cookie_name(&self) -> &str {
        self.codec.cookie_name()
    }

    fn is_callback(&self, request: &Parts) -> bool {
        request.uri.path() == self.redirect_url.path()
    }

    fn seal(&self, state: &SessionState) -> Result<HeaderValue> {
        let mut rng = self.rng.lock();
        self.codec.seal(state, &mut *rng)
    }

    fn authorization_url(&self, state_verifier: &str) -> Url {
        let mut url = self.authorization_endpoint_url.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", self.redirect_url.as_str())
            .append_pair("scope", &self.scope)
            .append_pair("state", state_verifier);
        url
    }

    /// Sends the browser to the identity provider.
    fn start_login(&self, request: &Parts) -> Result<HttpAuthentication> {
        if self.is_callback(request) {
            return Err(AuthError::invalid_argument(
                "Redirect URL reached without an OIDC login in progress",
            ));
        }
        if request.headers.get(SEC_FETCH_DEST).is_some_and(|dest| dest == "empty") {
            return Err(AuthError::unauthenticated("No valid OIDC session state cookie found"));
        }

        let mut verifier = [0u8; STATE_VERIFIER_SIZE];
        self.rng.lock().fill_bytes(&mut verifier);
        let state_verifier = URL_SAFE_NO_PAD.encode(verifier);
        let original_request_uri = request
            .uri
            .path_and_query()
            .map_or_else(|| "/".to_owned(), |path_and_query| path_and_query.to_string());

        let location = self.authorization_url(&state_verifier);
        let set_cookie =
            self.seal(&SessionState::Authenticating { state_verifier, original_request_uri })?;
        tracing::debug!(uri = %request.uri, "Redirecting to OIDC provider");
        Ok(HttpAuthentication::Responded(see_other(location.as_str(), set_cookie)?))
    }

    /// Handles the provider redirecting the browser back to us.
    async fn complete_login(
        &self,
        ctx: &RequestContext,
        request: &Parts,
        state_verifier: &str,
        original_request_uri: &str,
    ) -> Result<HttpAuthentication> {
        let mut error = None;
        let mut error_description = None;
        let mut state = None;
        let mut code = None;
        let query = request.uri.query().unwrap_or_default();
        for (name, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let slot = match name.as_ref() {
                "error" => &mut error,
                "error_description" => &mut error_description,
                "state" => &mut state,
                "code" => &mut code,
                _ => continue,
            };
            slot.get_or_insert(value.into_owned());
        }

        if let Some(error) = error {
            return Err(AuthError::unauthenticated(match error_description {
                Some(description) => format!("OIDC provider returned error {error:?}: {description}"),
                None => format!("OIDC provider returned error {error:?}"),
            }));
        }
        let state_matches = state
            .is_some_and(|state| bool::from(state.as_bytes().ct_eq(state_verifier.as_bytes())));
        if !state_matches {
            return Err(AuthError::invalid_argument("Invalid OIDC state verifier"));
        }
        let Some(code) = code else {
            return Err(AuthError::invalid_argument("Missing OIDC authorization code"));
        };

        let token = self
            .request_token(ctx, &[
                ("grant_type", "authorization_code"),
                ("code", code.as_str()),
                ("redirect_uri", self.redirect_url.as_str()),
            ])
            .await?;
        let (_, session) =
            self.establish_session(ctx, token, None, INITIAL_DEFAULT_EXPIRATION_SECONDS).await?;
        let set_cookie = self.seal(&session)?;
        tracing::debug!("Completed OIDC login");
        Ok(HttpAuthentication::Responded(see_other(original_request_uri, set_cookie)?))
    }

    #[tracing::instrument(skip_all)]
    async fn refresh_session(
        &self,
        ctx: &RequestContext,
        refresh_token: &str,
        default_expiration: u64,
    ) -> Result<HttpAuthentication> {
        let token = self
            .request_token(ctx, &[("grant_type", "refresh_token"), ("refresh_token", refresh_token)])
            .await?;
        let (metadata, session) = self
            .establish_session(ctx, token, Some(refresh_token.to_owned()), default_expiration)
            .await?;
        let set_cookie = self.seal(&session)?;
        Ok(HttpAuthentication::Authenticated { metadata, set_cookie: Some(set_cookie) })
    }

    /// Turns a token response into metadata and the session to store.
    async fn establish_session(
        &self,
        ctx: &RequestContext,
        token: TokenResponse,
        previous_refresh_token: Option<String>,
        default_expiration: u64,
    ) -> Result<(Arc<AuthenticationMetadata>, SessionState)> {
        let claims = match &self.claims_source {
            ClaimsSource::UserInfoEndpoint(url) => {
                self.fetch_user_info(ctx, url, &token.access_token).await?
            },
            ClaimsSource::IdToken => id_token_claims(token.id_token.as_deref())?,
        };
        let raw = self.metadata_extraction.search(&claims)?;
        let metadata = Arc::new(AuthenticationMetadata::from_raw(raw.clone())?);

        let (lifetime, next_default_expiration) =
            session_lifetime(token.expires_in, default_expiration);
        let expiration = i64::try_from(lifetime)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|lifetime| self.clock.now().checked_add_signed(lifetime))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let session = SessionState::Authenticated {
            authentication_metadata: raw,
            expiration,
            refresh_token: token.refresh_token.or(previous_refresh_token),
            default_expiration: next_default_expiration,
        };
        Ok((metadata, session))
    }

    #[tracing::instrument(skip_all)]
    async fn request_token(
        &self,
        ctx: &RequestContext,
        grant: &[(&str, &str)],
    ) -> Result<TokenResponse> {
        let mut form = grant.to_vec();
        form.push(("client_id", self.client_id.as_str()));
        form.push(("client_secret", self.client_secret.as_str()));
        let request = self
            .http_client
            .post(self.token_endpoint_url.clone())
            .timeout(self.request_timeout)
            .header(ACCEPT, "application/json")
            .form(&form);
        let response = send(ctx, request, "token").await?;
        ctx.run(async {
            response.json::<TokenResponse>().await.map_err(|err| {
                AuthError::unauthenticated(format!("Malformed OIDC token response: {err}"))
            })
        })
        .await
    }

    async fn fetch_user_info(
        &self,
        ctx: &RequestContext,
        url: &Url,
        access_token: &str,
    ) -> Result<Value> {
        let request = self
            .http_client
            .get(url.clone())
            .timeout(self.request_timeout)
            .header(ACCEPT, "application/json")
            .bearer_auth(access_token);
        let response = send(ctx, request, "user info").await?;
        ctx.run(async {
            response.json::<Value>().await.map_err(|err| {
                AuthError::unauthenticated(format!("Malformed OIDC user info response: {err}"))
            })
        })
        .await
    }
}

#[async_trait]
impl HttpAuthenticator for OidcAuthenticator {
    async fn authenticate(
        &self,
        ctx: &RequestContext,
        request: &Parts,
    ) -> Result<HttpAuthentication> {
        match self.codec.read(&request.headers) {
            Some(SessionState::Authenticated {
                authentication_metadata,
                expiration,
                refresh_token,
                default_expiration,
            }) => {
                if self.clock.now() < expiration {
                    if let Ok(metadata) = AuthenticationMetadata::from_raw(authentication_metadata) {
                        return Ok(HttpAuthentication::Authenticated {
                            metadata: Arc::new(metadata),
                            set_cookie: None,
                        });
                    }
                } else if let Some(refresh_token) = refresh_token {
                    match self.refresh_session(ctx, &refresh_token, default_expiration).await {
                        Ok(outcome) => return Ok(outcome),
                        Err(err @ (AuthError::Canceled | AuthError::DeadlineExceeded)) => {
                            return Err(err);
                        },
                        Err(err) => {
                            tracing::debug!(error = %err, "OIDC session refresh failed, restarting login");
                        },
                    }
                }
            },
            Some(SessionState::Authenticating { state_verifier, original_request_uri })
                if self.is_callback(request) =>
            {
                return self
                    .complete_login(ctx, request, &state_verifier, &original_request_uri)
                    .await;
            },
            _ => {},
        }
        self.start_login(request)
    }
}

fn see_other(location: &str, set_cookie: HeaderValue) -> Result<http::Response<String>> {
    http::Response::builder()
        .status(StatusCode::SEE_OTHER)
        .header(LOCATION, location)
        .header(SET_COOKIE, set_cookie)
        .body(String::new())
        .map_err(|err| AuthError::internal_with_source("Failed to build redirect response", err))
}

/// Sends a request to one of the provider's endpoints.
///
/// Transport failures and server errors are transient. Any other
/// unsuccessful status rejects the login.
async fn send(
    ctx: &RequestContext,
    request: reqwest::RequestBuilder,
    endpoint: &str,
) -> Result<reqwest::Response> {
    let response = ctx
        .run(async {
            request.send().await.map_err(|err| {
                AuthError::unavailable_with_source(
                    format!("Failed to contact OIDC {endpoint} endpoint"),
                    err,
                )
            })
        })
        .await?;
    let status = response.status();
    if status.is_server_error() {
        return Err(AuthError::unavailable(format!("OIDC {endpoint} endpoint returned {status}")));
    }
    if !status.is_success() {
        return Err(AuthError::unauthenticated(format!(
            "OIDC {endpoint} endpoint returned {status}"
        )));
    }
    Ok(response)
}

/// Decodes the payload of an ID token.
///
/// The token was received directly from the token endpoint, so its
/// signature is not checked.
/// Returns the lifetime in seconds of a session established from a token
/// response, and the fallback lifetime to persist for the next one.
fn session_lifetime(expires_in: Option<u64>, default_expiration: u64) -> (u64, u64) {
    match expires_in {
        Some(expires_in) => (expires_in, default_expiration),
        None => (default_expiration, default_expiration.saturating_mul(2)),
    }
}

fn id_token_claims(id_token: Option<&str>) -> Result<Value> {
    let Some(id_token) = id_token else {
        return Err(AuthError::unauthenticated("OIDC token response contains no ID token"));
    };
    id_token
        .split('.')
        .nth(1)
        .and_then(|payload| URL_SAFE_NO_PAD.decode(payload).ok())
        .and_then(|payload| serde_json::from_slice::<Value>(&payload).ok())
        .filter(Value::is_object)
        .ok_or_else(|| AuthError::unauthenticated("Malformed OIDC ID token"))
}
