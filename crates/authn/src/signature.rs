//! JWT signature validators.
//!
//! A [`SignatureValidator`] checks the signature of a JWT given its `alg`
//! header, optional `kid` header, the signed `header.payload` bytes and the
//! decoded signature. Supported algorithms:
//!
//! | Family | Algorithms | Key |
//! |--------|------------|-----|
//! | HMAC-SHA-2 | `HS256`, `HS384`, `HS512` | shared secret |
//! | RSA PKCS#1 v1.5 | `RS256`, `RS384`, `RS512` | RSA public key |
//! | ECDSA | `ES256`, `ES384`, `ES512` | P-256, P-384, P-521 public key |
//! | EdDSA | `EdDSA` | Ed25519 public key |
//!
//! Keys from a JWK Set are combined by [`DemultiplexingSignatureValidator`];
//! [`ForwardingSignatureValidator`] allows the combined validator to be
//! replaced atomically when the key set is reloaded.

use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;
use hmac::{Hmac, Mac};
use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256, Sha384, Sha512};
use signature::Verifier;
use zeroize::Zeroizing;

use crate::error::{AuthError, Result};

/// Verifies JWT signatures.
pub trait SignatureValidator: Send + Sync {
    /// Returns `true` if `signature` is a valid signature of
    /// `header_and_payload` under `algorithm`.
    fn validate_signature(
        &self,
        algorithm: &str,
        key_id: Option<&str>,
        header_and_payload: &[u8],
        signature: &[u8],
    ) -> bool;
}

/// Validates `HS256`, `HS384` and `HS512` signatures with a shared secret.
///
/// Comparison is constant-time.
pub struct HmacSha2SignatureValidator {
    key: Zeroizing<Vec<u8>>,
}

impl HmacSha2SignatureValidator {
    /// Creates a validator for the given secret.
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: Zeroizing::new(key.into()) }
    }
}

fn verify_hmac<M: Mac + hmac::digest::KeyInit>(key: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(mut mac) = <M as Mac>::new_from_slice(key) else {
        return false;
    };
    mac.update(message);
    mac.verify_slice(signature).is_ok()
}

impl SignatureValidator for HmacSha2SignatureValidator {
    fn validate_signature(
        &self,
        algorithm: &str,
        _key_id: Option<&str>,
        header_and_payload: &[u8],
        signature: &[u8],
    ) -> bool {
        match algorithm {
            "HS256" => verify_hmac::<Hmac<Sha256>>(&self.key, header_and_payload, signature),
            "HS384" => verify_hmac::<Hmac<Sha384>>(&self.key, header_and_payload, signature),
            "HS512" => verify_hmac::<Hmac<Sha512>>(&self.key, header_and_payload, signature),
            _ => false,
        }
    }
}

/// Validates `RS256`, `RS384` and `RS512` signatures.
pub struct RsaSha2SignatureValidator {
    key: RsaPublicKey,
}

impl RsaSha2SignatureValidator {
    /// Creates a validator for an RSA public key.
    pub fn new(key: RsaPublicKey) -> Self {
        Self { key }
    }

    /// Creates a validator from big-endian modulus and exponent bytes.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidArgument` if the parameters do not form a
    /// valid public key.
    pub fn from_components(modulus: &[u8], exponent: &[u8]) -> Result<Self> {
        RsaPublicKey::new(BigUint::from_bytes_be(modulus), BigUint::from_bytes_be(exponent))
            .map(Self::new)
            .map_err(|err| AuthError::invalid_argument(format!("Invalid RSA public key: {err}")))
    }
}

impl SignatureValidator for RsaSha2SignatureValidator {
    fn validate_signature(
        &self,
        algorithm: &str,
        _key_id: Option<&str>,
        header_and_payload: &[u8],
        signature: &[u8],
    ) -> bool {
        let (scheme, hashed) = match algorithm {
            "RS256" => (Pkcs1v15Sign::new::<Sha256>(), Sha256::digest(header_and_payload).to_vec()),
            "RS384" => (Pkcs1v15Sign::new::<Sha384>(), Sha384::digest(header_and_payload).to_vec()),
            "RS512" => (Pkcs1v15Sign::new::<Sha512>(), Sha512::digest(header_and_payload).to_vec()),
            _ => return false,
        };
        self.key.verify(scheme, &hashed, signature).is_ok()
    }
}

/// Elliptic curves supported for ECDSA signatures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EcdsaCurve {
    /// NIST P-256, used by `ES256`.
    P256,
    /// NIST P-384, used by `ES384`.
    P384,
    /// NIST P-521, used by `ES512`.
    P521,
}

impl EcdsaCurve {
    /// Returns the size in bytes of a field element, and of each of the `r`
    /// and `s` halves of a signature.
    pub fn field_size(self) -> usize {
        match self {
            Self::P256 => 32,
            Self::P384 => 48,
            Self::P521 => 66,
        }
    }

    /// Returns the JWT algorithm that signs with this curve.
    pub fn algorithm(self) -> &'static str {
        match self {
            Self::P256 => "ES256",
            Self::P384 => "ES384",
            Self::P521 => "ES512",
        }
    }
}

enum EcdsaVerifyingKey {
    P256(p256::ecdsa::VerifyingKey),
    P384(p384::ecdsa::VerifyingKey),
    P521(p521::ecdsa::VerifyingKey),
}

/// Validates `ES256`, `ES384` and `ES512` signatures.
///
/// Signatures are the concatenation `r‖s` of two big-endian integers of the
/// curve's field size. Other lengths are rejected.
pub struct EcdsaSha2SignatureValidator {
    curve: EcdsaCurve,
    key: EcdsaVerifyingKey,
}

impl EcdsaSha2SignatureValidator {
    /// Creates a validator from the big-endian affine coordinates of a
    /// public key. Coordinates shorter than the field size are left-padded.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidArgument` if the coordinates are too long
    /// or do not describe a point on the curve.
    pub fn from_coordinates(curve: EcdsaCurve, x: &[u8], y: &[u8]) -> Result<Self> {
        let size = curve.field_size();
        if x.len() > size || y.len() > size {
            return Err(AuthError::invalid_argument(format!(
                "ECDSA coordinates exceed {size} bytes for {}",
                curve.algorithm()
            )));
        }
        let mut sec1 = Vec::with_capacity(1 + 2 * size);
        sec1.push(0x04);
        for coordinate in [x, y] {
            sec1.resize(sec1.len() + size - coordinate.len(), 0);
            sec1.extend_from_slice(coordinate);
        }

        let invalid = || {
            AuthError::invalid_argument(format!("Invalid ECDSA public key for {}", curve.algorithm()))
        };
        let key = match curve {
            EcdsaCurve::P256 => EcdsaVerifyingKey::P256(
                p256::ecdsa::VerifyingKey::from_sec1_bytes(&sec1).map_err(|_| invalid())?,
            ),
            EcdsaCurve::P384 => EcdsaVerifyingKey::P384(
                p384::ecdsa::VerifyingKey::from_sec1_bytes(&sec1).map_err(|_| invalid())?,
            ),
            EcdsaCurve::P521 => EcdsaVerifyingKey::P521(
                p521::ecdsa::VerifyingKey::from_sec1_bytes(&sec1).map_err(|_| invalid())?,
            ),
        };
        Ok(Self { curve, key })
    }

    /// Returns the curve of the public key.
    pub fn curve(&self) -> EcdsaCurve {
        self.curve
    }
}

impl SignatureValidator for EcdsaSha2SignatureValidator {
    fn validate_signature(
        &self,
        algorithm: &str,
        _key_id: Option<&str>,
        header_and_payload: &[u8],
        signature: &[u8],
    ) -> bool {
        if algorithm != self.curve.algorithm() || signature.len() != 2 * self.curve.field_size() {
            return false;
        }
        match &self.key {
            EcdsaVerifyingKey::P256(key) => p256::ecdsa::Signature::from_slice(signature)
                .is_ok_and(|signature| key.verify(header_and_payload, &signature).is_ok()),
            EcdsaVerifyingKey::P384(key) => p384::ecdsa::Signature::from_slice(signature)
                .is_ok_and(|signature| key.verify(header_and_payload, &signature).is_ok()),
            EcdsaVerifyingKey::P521(key) => p521::ecdsa::Signature::from_slice(signature)
                .is_ok_and(|signature| key.verify(header_and_payload, &signature).is_ok()),
        }
    }
}

/// Validates `EdDSA` signatures made with Ed25519 keys.
pub struct Ed25519SignatureValidator {
    key: ed25519_dalek::VerifyingKey,
}

impl Ed25519SignatureValidator {
    /// Creates a validator from a 32-byte public key.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidArgument` if the key has the wrong length
    /// or is not a valid curve point.
    pub fn from_bytes(public_key: &[u8]) -> Result<Self> {
        let bytes: &[u8; 32] = public_key.try_into().map_err(|_| {
            AuthError::invalid_argument(format!(
                "Ed25519 public key must be 32 bytes, got {}",
                public_key.len()
            ))
        })?;
        let key = ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|err| AuthError::invalid_argument(format!("Invalid Ed25519 public key: {err}")))?;
        Ok(Self { key })
    }
}

impl SignatureValidator for Ed25519SignatureValidator {
    fn validate_signature(
        &self,
        algorithm: &str,
        _key_id: Option<&str>,
        header_and_payload: &[u8],
        signature: &[u8],
    ) -> bool {
        if algorithm != "EdDSA" {
            return false;
        }
        ed25519_dalek::Signature::from_slice(signature)
            .is_ok_and(|signature| self.key.verify(header_and_payload, &signature).is_ok())
    }
}

/// Dispatches to per-key validators.
///
/// A token that names a key ID is checked against that key only; an unknown
/// key ID is rejected. A token without a key ID is accepted if any key
/// accepts it.
#[derive(Default)]
pub struct DemultiplexingSignatureValidator {
    by_key_id: HashMap<String, Arc<dyn SignatureValidator>>,
    all: Vec<Arc<dyn SignatureValidator>>,
}

impl DemultiplexingSignatureValidator {
    /// Creates an empty validator that rejects every signature.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a validator, optionally reachable by key ID.
    pub fn add(&mut self, key_id: Option<String>, validator: Arc<dyn SignatureValidator>) {
        if let Some(key_id) = key_id {
            self.by_key_id.insert(key_id, Arc::clone(&validator));
        }
        self.all.push(validator);
    }

    /// Returns the number of validators.
    pub fn len(&self) -> usize {
        self.all.len()
    }

    /// Returns `true` if no validators were added.
    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }
}

impl SignatureValidator for DemultiplexingSignatureValidator {
    fn validate_signature(
        &self,
        algorithm: &str,
        key_id: Option<&str>,
        header_and_payload: &[u8],
        signature: &[u8],
    ) -> bool {
        match key_id {
            Some(key_id) => self.by_key_id.get(key_id).is_some_and(|validator| {
                validator.validate_signature(algorithm, Some(key_id), header_and_payload, signature)
            }),
            None => self.all.iter().any(|validator| {
                validator.validate_signature(algorithm, None, header_and_payload, signature)
            }),
        }
    }
}

/// Forwards to a validator that can be replaced at any time.
///
/// Readers take a lock-free snapshot; [`store`](Self::store) publishes a new
/// validator to subsequent calls.
pub struct ForwardingSignatureValidator {
    inner: ArcSwap<Box<dyn SignatureValidator>>,
}

impl ForwardingSignatureValidator {
    /// Creates a validator forwarding to `initial`.
    pub fn new(initial: Box<dyn SignatureValidator>) -> Self {
        Self { inner: ArcSwap::from_pointee(initial) }
    }

    /// Replaces the validator used by subsequent calls.
    pub fn store(&self, validator: Box<dyn SignatureValidator>) {
        self.inner.store(Arc::new(validator));
    }
}

impl SignatureValidator for ForwardingSignatureValidator {
    fn validate_signature(
        &self,
        algorithm: &str,
        key_id: Option<&str>,
        header_and_payload: &[u8],
        signature: &[u8],
    ) -> bool {
        self.inner.load().validate_signature(algorithm, key_id, header_and_payload, signature)
    }
}
