//! JWK Set loading and hot reload.
//!
//! Key sets are parsed with `jsonwebtoken`'s JWK types and turned into a
//! [`DemultiplexingSignatureValidator`]. Invalid or unsupported keys are
//! configuration errors. A key set read from a file can be kept current with
//! [`spawn_jwk_set_reloader`], which swaps a [`ForwardingSignatureValidator`]
//! and keeps the previous keys when the file cannot be loaded.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use jsonwebtoken::jwk::{AlgorithmParameters, EllipticCurve, Jwk, JwkSet};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{AuthError, Result},
    signature::{
        DemultiplexingSignatureValidator, EcdsaCurve, EcdsaSha2SignatureValidator,
        Ed25519SignatureValidator, ForwardingSignatureValidator, HmacSha2SignatureValidator,
        RsaSha2SignatureValidator, SignatureValidator,
    },
};

/// Default interval between reloads of a JWK Set file.
pub const DEFAULT_JWK_SET_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Parses a JWK Set document.
///
/// The algorithm of each key is derived from its type and curve, so `alg`
/// members are ignored. They are removed before parsing because
/// `jsonwebtoken` does not recognize every valid value (notably `ES512`).
///
/// # Errors
///
/// Returns `AuthError::InvalidArgument` if the document is not a JWK Set.
pub fn parse_jwk_set(bytes: &[u8]) -> Result<JwkSet> {
    let mut document: Value = serde_json::from_slice(bytes)
        .map_err(|err| AuthError::invalid_argument(format!("JWK Set is not valid JSON: {err}")))?;
    if let Some(keys) = document.get_mut("keys").and_then(Value::as_array_mut) {
        for key in keys.iter_mut().filter_map(Value::as_object_mut) {
            key.remove("alg");
        }
    }
    serde_json::from_value(document)
        .map_err(|err| AuthError::invalid_argument(format!("Invalid JWK Set: {err}")))
}

/// Builds a validator accepting signatures made with any key of `jwk_set`.
///
/// # Errors
///
/// Returns `AuthError::InvalidArgument` if the set is empty or any key is
/// invalid or of an unsupported type.
pub fn signature_validator_from_jwk_set(
    jwk_set: &JwkSet,
) -> Result<DemultiplexingSignatureValidator> {
    if jwk_set.keys.is_empty() {
        return Err(AuthError::invalid_argument("JWK Set contains no keys"));
    }
    let mut validator = DemultiplexingSignatureValidator::new();
    for (index, jwk) in jwk_set.keys.iter().enumerate() {
        let key = signature_validator_from_jwk(jwk).map_err(|err| {
            AuthError::invalid_argument(format!(
                "Key {} of JWK Set: {}",
                jwk.common.key_id.as_deref().map_or_else(|| index.to_string(), str::to_owned),
                err.message()
            ))
        })?;
        validator.add(jwk.common.key_id.clone(), key);
    }
    Ok(validator)
}

/// Reads a JWK Set file and builds a validator for it.
///
/// # Errors
///
/// Returns `AuthError::InvalidArgument` if the file cannot be read or does
/// not contain a valid, non-empty JWK Set.
pub fn signature_validator_from_jwk_set_file(
    path: &Path,
) -> Result<DemultiplexingSignatureValidator> {
    let bytes = std::fs::read(path).map_err(|err| {
        AuthError::invalid_argument(format!("Failed to read JWK Set {}: {err}", path.display()))
    })?;
    signature_validator_from_jwk_set(&parse_jwk_set(&bytes)?)
}

fn signature_validator_from_jwk(jwk: &Jwk) -> Result<Arc<dyn SignatureValidator>> {
    match &jwk.algorithm {
        AlgorithmParameters::OctetKey(params) => {
            Ok(Arc::new(HmacSha2SignatureValidator::new(decode(&params.value, "k")?)))
        },
        AlgorithmParameters::RSA(params) => Ok(Arc::new(RsaSha2SignatureValidator::from_components(
            &decode(&params.n, "n")?,
            &decode(&params.e, "e")?,
        )?)),
        AlgorithmParameters::EllipticCurve(params) => {
            let curve = match params.curve {
                EllipticCurve::P256 => EcdsaCurve::P256,
                EllipticCurve::P384 => EcdsaCurve::P384,
                EllipticCurve::P521 => EcdsaCurve::P521,
                ref other => {
                    return Err(AuthError::invalid_argument(format!(
                        "Unsupported elliptic curve {other:?}"
                    )));
                },
            };
            Ok(Arc::new(EcdsaSha2SignatureValidator::from_coordinates(
                curve,
                &decode(&params.x, "x")?,
                &decode(&params.y, "y")?,
            )?))
        },
        AlgorithmParameters::OctetKeyPair(params) => match params.curve {
            EllipticCurve::Ed25519 => {
                Ok(Arc::new(Ed25519SignatureValidator::from_bytes(&decode(&params.x, "x")?)?))
            },
            ref other => Err(AuthError::invalid_argument(format!(
                "Unsupported octet key pair curve {other:?}"
            ))),
        },
    }
}

fn decode(value: &str, member: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD.decode(value.trim_end_matches('=')).map_err(|err| {
        AuthError::invalid_argument(format!("Member {member:?} is not valid base64url: {err}"))
    })
}

/// Periodically reloads the JWK Set at `path` into `forwarding` until
/// `shutdown` is cancelled.
///
/// A file that cannot be read or parsed is logged and the previous keys
/// stay in effect.
///
/// # Panics
///
/// Must be called within a Tokio runtime context.
pub fn spawn_jwk_set_reloader(
    path: PathBuf,
    forwarding: Arc<ForwardingSignatureValidator>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; the caller loaded the file already.
        ticker.tick().await;
        tracing::info!(path = %path.display(), "JWK Set reloader started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(path = %path.display(), "JWK Set reloader shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let loaded = match tokio::fs::read(&path).await {
                        Ok(bytes) => parse_jwk_set(&bytes)
                            .and_then(|jwk_set| signature_validator_from_jwk_set(&jwk_set)),
                        Err(err) => Err(AuthError::unavailable_with_source("Failed to read JWK Set", err)),
                    };
                    match loaded {
                        Ok(validator) => {
                            tracing::debug!(path = %path.display(), keys = validator.len(), "reloaded JWK Set");
                            forwarding.store(Box::new(validator));
                        },
                        Err(err) => {
                            tracing::warn!(
                                path = %path.display(),
                                error = %err,
                                "failed to reload JWK Set, keeping previous keys"
                            );
                        },
                    }
                }
            }
        }
    })
}
