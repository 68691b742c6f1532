//! Shared test utilities for authentication testing.
//!
//! This module provides helpers for generating signing keys, creating
//! signed JWTs, crafting raw JWT strings (for attack testing), building
//! JWK Sets, and a scriptable [`AuthenticationBackend`]. It is feature-gated
//! behind `testutil` to prevent leaking into production builds.
//!
//! # Usage
//!
//! In integration tests, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! castellan-authn = { path = "../authn", features = ["testutil"] }
//! ```
//!
//! Then import helpers:
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use castellan_authn::testutil::{generate_ed25519_keypair, sign_eddsa_jwt};
//! ```

use std::time::Duration;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use castellan_cache::RequestContext;
use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use rand_core::OsRng;
use serde_json::{Value, json};
use zeroize::Zeroizing;

use crate::{
    error::{AuthError, Result},
    remote::{AuthenticateRequest, AuthenticateResponse, AuthenticateVerdict, AuthenticationBackend},
};

/// Generates a test Ed25519 key pair.
///
/// Returns `(pkcs8_der, public_key)` where:
/// - `pkcs8_der` is the private key in PKCS#8 DER format wrapped in [`Zeroizing`] (suitable for
///   [`EncodingKey::from_ed_der`])
/// - `public_key` is the raw 32-byte public key
///
/// Each call generates a fresh random key pair.
pub fn generate_ed25519_keypair() -> (Zeroizing<Vec<u8>>, [u8; 32]) {
    let signing_key = SigningKey::generate(&mut OsRng);
    let public_key = signing_key.verifying_key().to_bytes();

    let private_bytes: Zeroizing<[u8; 32]> = Zeroizing::new(signing_key.to_bytes());
    let mut pkcs8_der = Zeroizing::new(vec![
        0x30, 0x2e, // SEQUENCE, 46 bytes
        0x02, 0x01, 0x00, // INTEGER version 0
        0x30, 0x05, // SEQUENCE, 5 bytes (algorithm identifier)
        0x06, 0x03, 0x2b, 0x65, 0x70, // OID 1.3.101.112 (Ed25519)
        0x04, 0x22, // OCTET STRING, 34 bytes
        0x04, 0x20, // OCTET STRING, 32 bytes (the actual key)
    ]);
    pkcs8_der.extend_from_slice(&*private_bytes);

    (pkcs8_der, public_key)
}

/// Returns a JWK describing an Ed25519 public key.
pub fn ed25519_jwk(kid: &str, public_key: &[u8; 32]) -> Value {
    json!({
        "kty": "OKP",
        "crv": "Ed25519",
        "kid": kid,
        "x": URL_SAFE_NO_PAD.encode(public_key),
    })
}

/// Returns a JWK describing an HMAC secret.
pub fn hmac_jwk(kid: Option<&str>, secret: &[u8]) -> Value {
    let mut jwk = json!({"kty": "oct", "k": URL_SAFE_NO_PAD.encode(secret)});
    if let Some(kid) = kid {
        jwk["kid"] = json!(kid);
    }
    jwk
}

/// Wraps keys into a JWK Set document.
pub fn jwk_set(keys: impl IntoIterator<Item = Value>) -> Value {
    json!({"keys": keys.into_iter().collect::<Vec<_>>()})
}

/// Creates a JWT over `payload` signed with HMAC-SHA256.
///
/// # Panics
///
/// Panics if JWT encoding fails (should not happen with valid inputs).
#[allow(clippy::expect_used)]
pub fn sign_hs256_jwt(secret: &[u8], kid: Option<&str>, payload: &Value) -> String {
    let mut header = Header::new(Algorithm::HS256);
    header.kid = kid.map(str::to_owned);
    jsonwebtoken::encode(&header, payload, &EncodingKey::from_secret(secret))
        .expect("Failed to encode test JWT")
}

/// Creates a JWT over `payload` signed with an Ed25519 key in PKCS#8 DER
/// format.
///
/// # Panics
///
/// Panics if JWT encoding fails (should not happen with valid inputs).
#[allow(clippy::expect_used)]
pub fn sign_eddsa_jwt(pkcs8_der: &[u8], kid: &str, payload: &Value) -> String {
    let mut header = Header::new(Algorithm::EdDSA);
    header.kid = Some(kid.to_owned());
    jsonwebtoken::encode(&header, payload, &EncodingKey::from_ed_der(pkcs8_der))
        .expect("Failed to encode test JWT")
}

/// Creates a raw JWT string from arbitrary header and payload JSON.
///
/// The resulting JWT has the structure `{header_b64}.{payload_b64}.{signature_b64}`
/// with the given signature bytes. This is useful for testing rejection of
/// malformed or attack JWTs (e.g., `alg: "none"`, algorithm confusion).
///
/// # Panics
///
/// Panics if JSON serialization fails.
#[allow(clippy::expect_used)]
pub fn craft_raw_jwt(header_json: &Value, payload_json: &Value, signature: &[u8]) -> String {
    let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(header_json).expect("header json"));
    let payload_b64 =
        URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload_json).expect("payload json"));
    format!("{header_b64}.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(signature))
}

/// Scriptable [`AuthenticationBackend`] that records every request.
pub struct MockAuthenticationBackend {
    response: Mutex<Result<AuthenticateResponse>>,
    delay: Duration,
    requests: Mutex<Vec<AuthenticateRequest>>,
}

impl MockAuthenticationBackend {
    fn new(response: Result<AuthenticateResponse>) -> Self {
        Self { response: Mutex::new(response), delay: Duration::ZERO, requests: Mutex::default() }
    }

    /// Creates a backend that allows every request with `metadata`.
    pub fn allow(metadata: Value, cache_expiration_time: Option<DateTime<Utc>>) -> Self {
        Self::new(Ok(AuthenticateResponse {
            verdict: AuthenticateVerdict::Allow(metadata),
            cache_expiration_time,
        }))
    }

    /// Creates a backend that denies every request with `reason`.
    pub fn deny(reason: impl Into<String>) -> Self {
        Self::new(Ok(AuthenticateResponse {
            verdict: AuthenticateVerdict::Deny(reason.into()),
            cache_expiration_time: None,
        }))
    }

    /// Creates a backend that fails every request with `err`.
    pub fn failing(err: AuthError) -> Self {
        Self::new(Err(err))
    }

    /// Sets the cache expiration time of successful responses.
    #[must_use]
    pub fn with_cache_expiration_time(self, until: DateTime<Utc>) -> Self {
        if let Ok(response) = &mut *self.response.lock() {
            response.cache_expiration_time = Some(until);
        }
        self
    }

    /// Delays every response by `delay`.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Replaces the response returned from now on.
    pub fn set_response(&self, response: Result<AuthenticateResponse>) {
        *self.response.lock() = response;
    }

    /// Returns the number of requests received.
    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    /// Returns the requests received so far.
    pub fn requests(&self) -> Vec<AuthenticateRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl AuthenticationBackend for MockAuthenticationBackend {
    async fn authenticate(
        &self,
        ctx: &RequestContext,
        request: &AuthenticateRequest,
    ) -> Result<AuthenticateResponse> {
        self.requests.lock().push(request.clone());
        if !self.delay.is_zero() {
            ctx.run(async {
                tokio::time::sleep(self.delay).await;
                Ok::<_, AuthError>(())
            })
            .await?;
        }
        self.response.lock().clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_ed25519_keypair_produces_valid_key() {
        let (pkcs8_der, _) = generate_ed25519_keypair();
        // PKCS#8 DER for Ed25519 is 48 bytes (16 header + 32 key)
        assert_eq!(pkcs8_der.len(), 48);
    }

    #[test]
    fn test_generate_ed25519_keypair_unique() {
        let (_, pk1) = generate_ed25519_keypair();
        let (_, pk2) = generate_ed25519_keypair();
        assert_ne!(pk1, pk2, "each call should produce a unique key pair");
    }

    #[test]
    fn test_sign_eddsa_jwt_produces_three_part_token() {
        let (pkcs8_der, _) = generate_ed25519_keypair();
        let jwt = sign_eddsa_jwt(&pkcs8_der, "kid-001", &json!({"sub": "alice"}));
        let parts: Vec<&str> = jwt.split('.').collect();
        assert_eq!(parts.len(), 3, "JWT should have header.payload.signature");
        assert!(!parts[2].is_empty(), "signature should not be empty");
    }

    #[test]
    fn test_craft_raw_jwt_format() {
        let jwt = craft_raw_jwt(&json!({"alg": "none"}), &json!({"sub": "test"}), b"");
        let parts: Vec<&str> = jwt.split('.').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[2].is_empty(), "signature should be empty");
    }

    #[test]
    fn test_hmac_jwk_omits_absent_kid() {
        assert_eq!(hmac_jwk(None, b"k"), json!({"kty": "oct", "k": "aw"}));
        assert_eq!(hmac_jwk(Some("a"), b"k")["kid"], "a");
    }
}
