//! Encrypted OIDC session cookies.
//!
//! The cookie name and the AES-128-GCM key are both derived from a SHA-256
//! digest of the authenticator's configuration, so changing the
//! configuration invalidates every outstanding session. The cookie value is
//! `base64url(nonce ‖ ciphertext)` with a fresh 96-bit nonce per write.

use aes_gcm::{
    Aes128Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use cookie::{Cookie, SameSite};
use http::{HeaderMap, HeaderValue, header::COOKIE};
use rand_core::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{AuthError, Result};

const NONCE_SIZE: usize = 12;

/// State carried by the session cookie.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub(crate) enum SessionState {
    /// A login was started and the browser was sent to the identity provider.
    Authenticating {
        /// Base64url-encoded random value echoed back in the `state` parameter.
        state_verifier: String,
        /// Where to send the browser once the login completes.
        original_request_uri: String,
    },
    /// The login completed.
    Authenticated {
        /// Raw authentication metadata.
        authentication_metadata: Value,
        /// When the access token expires.
        expiration: DateTime<Utc>,
        /// Token used to renew the session, if the provider issued one.
        refresh_token: Option<String>,
        /// Lifetime in seconds to assume for the next token without
        /// `expires_in`.
        default_expiration: u64,
    },
}

/// Seals and opens session cookies for one OIDC configuration.
pub(crate) struct SessionCodec {
    cookie_name: String,
    cipher: Aes128Gcm,
}

impl SessionCodec {
    /// Derives the cookie name and key from the canonical configuration.
    pub(crate) fn new(canonical_configuration: &[u8]) -> Result<Self> {
        let digest = Sha256::digest(canonical_configuration);
        let cookie_name = URL_SAFE_NO_PAD.encode(&digest[..16]);
        let cipher = Aes128Gcm::new_from_slice(&digest[16..])
            .map_err(|_| AuthError::internal("Failed to derive session cookie key"))?;
        Ok(Self { cookie_name, cipher })
    }

    /// Returns the name of the session cookie.
    pub(crate) fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    /// Returns the session carried by the request's cookies, if any.
    ///
    /// Cookies that fail to decode, decrypt or parse are ignored.
    pub(crate) fn read(&self, headers: &HeaderMap) -> Option<SessionState> {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(Cookie::split_parse)
            .filter_map(std::result::Result::ok)
            .filter(|cookie| cookie.name() == self.cookie_name)
            .find_map(|cookie| self.open(cookie.value_trimmed()))
    }

    fn open(&self, value: &str) -> Option<SessionState> {
        let sealed = URL_SAFE_NO_PAD.decode(value).ok()?;
        if sealed.len() < NONCE_SIZE {
            return None;
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        let plaintext = self.cipher.decrypt(Nonce::from_slice(nonce), ciphertext).ok()?;
        serde_json::from_slice(&plaintext).ok()
    }

    /// Returns a `Set-Cookie` header value storing `state`.
    pub(crate) fn seal<R>(&self, state: &SessionState, rng: &mut R) -> Result<HeaderValue>
    where
        R: RngCore + ?Sized,
    {
        let plaintext = zeroize::Zeroizing::new(serde_json::to_vec(state).map_err(|err| {
            AuthError::internal_with_source("Failed to serialize session state", err)
        })?);
        let mut nonce = [0u8; NONCE_SIZE];
        rng.fill_bytes(&mut nonce);
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|_| AuthError::internal("Failed to encrypt session state"))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        let cookie = Cookie::build((self.cookie_name.as_str(), URL_SAFE_NO_PAD.encode(&sealed)))
            .path("/")
            .http_only(true)
            .secure(true)
            .same_site(SameSite::Lax)
            .build();
        HeaderValue::from_str(&cookie.to_string())
            .map_err(|err| AuthError::internal_with_source("Invalid session cookie", err))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;

    fn authenticating() -> SessionState {
        SessionState::Authenticating {
            state_verifier: "c3RhdGU".to_owned(),
            original_request_uri: "/builds?page=2".to_owned(),
        }
    }

    fn sealed_value(set_cookie: &HeaderValue) -> String {
        Cookie::parse(set_cookie.to_str().unwrap()).unwrap().value().to_owned()
    }

    fn cookie_header(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(value).unwrap());
        headers
    }

    fn request_cookie(codec: &SessionCodec, set_cookie: &HeaderValue) -> HeaderMap {
        cookie_header(&format!("other=1; {}={}", codec.cookie_name(), sealed_value(set_cookie)))
    }

    #[test]
    fn test_seal_then_read() {
        let codec = SessionCodec::new(b"configuration").unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let set_cookie = codec.seal(&authenticating(), &mut rng).unwrap();

        let cookie = Cookie::parse(set_cookie.to_str().unwrap()).unwrap();
        assert_eq!(cookie.name(), codec.cookie_name());
        assert_eq!(cookie.path(), Some("/"));
        assert_eq!(cookie.http_only(), Some(true));
        assert_eq!(cookie.secure(), Some(true));
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(codec.read(&request_cookie(&codec, &set_cookie)), Some(authenticating()));
    }

    #[test]
    fn test_read_tolerates_quoting_and_spacing() {
        let codec = SessionCodec::new(b"configuration").unwrap();
        let mut rng = StdRng::seed_from_u64(4);
        let value = sealed_value(&codec.seal(&authenticating(), &mut rng).unwrap());

        let quoted = cookie_header(&format!("other=1;{}=\"{value}\" ; last=2", codec.cookie_name()));
        assert_eq!(codec.read(&quoted), Some(authenticating()));

        let mut headers = cookie_header("other=1");
        headers.append(COOKIE, HeaderValue::from_str(&format!("{}={value}", codec.cookie_name())).unwrap());
        assert_eq!(codec.read(&headers), Some(authenticating()));
    }

    #[test]
    fn test_cookie_name_depends_on_configuration() {
        let a = SessionCodec::new(b"configuration a").unwrap();
        let b = SessionCodec::new(b"configuration b").unwrap();
        assert_ne!(a.cookie_name(), b.cookie_name());
        assert_eq!(a.cookie_name().len(), 22);
    }

    #[test]
    fn test_other_configuration_cannot_read_cookie() {
        let a = SessionCodec::new(b"configuration").unwrap();
        let mut rng = StdRng::seed_from_u64(2);
        let set_cookie = a.seal(&authenticating(), &mut rng).unwrap();

        // Same cookie name, different key.
        let b = SessionCodec { cookie_name: a.cookie_name().to_owned(), ..SessionCodec::new(b"x").unwrap() };
        assert_eq!(b.read(&request_cookie(&b, &set_cookie)), None);
    }

    #[test]
    fn test_garbage_cookies_are_ignored() {
        let codec = SessionCodec::new(b"configuration").unwrap();
        let short = URL_SAFE_NO_PAD.encode([0u8; 40]);
        for value in ["", "AAAA", "!!!", short.as_str()] {
            let headers = cookie_header(&format!("{}={value}", codec.cookie_name()));
            assert_eq!(codec.read(&headers), None, "{value:?}");
        }
    }

    #[test]
    fn test_nonces_differ_per_write() {
        let codec = SessionCodec::new(b"configuration").unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let first = codec.seal(&authenticating(), &mut rng).unwrap();
        let second = codec.seal(&authenticating(), &mut rng).unwrap();
        assert_ne!(first, second);
    }
}
