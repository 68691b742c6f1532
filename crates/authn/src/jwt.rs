//! `Authorization: Bearer` header parsing and JWT validation.
//!
//! [`AuthorizationHeaderParser`] validates JWTs and caches the verdict per
//! header value. A cache entry records the validity window
//! `[not_before, expiration)` of the token; a token is only accepted while
//! the current time lies inside its window. Tokens that fail validation are
//! cached with an empty window and are therefore rejected forever, which is
//! sound because the header value itself is the cache key.
//!
//! Validation steps:
//!
//! 1. Match `Bearer <header>.<payload>.<signature>` (base64url segments).
//! 2. Verify the signature with the configured [`SignatureValidator`].
//! 3. Require the claims-validation expression to yield `true`.
//! 4. Turn the result of the metadata-extraction expression into
//!    [`AuthenticationMetadata`].
//! 5. Read `nbf` and `exp` (integer or fractional seconds). Absent claims do
//!    not restrict the window.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use castellan_authn::{
//!     expression::Expression,
//!     jwt::AuthorizationHeaderParser,
//!     signature::HmacSha2SignatureValidator,
//! };
//! use castellan_cache::SystemClock;
//!
//! # fn example(header: &str) -> castellan_authn::Result<()> {
//! let parser = AuthorizationHeaderParser::builder()
//!     .clock(Arc::new(SystemClock))
//!     .signature_validator(Arc::new(HmacSha2SignatureValidator::new(b"secret".to_vec())))
//!     .claims_validator(Expression::compile("`true`")?)
//!     .metadata_extractor(Expression::compile("{public: @}")?)
//!     .build()?;
//!
//! if let Some(metadata) = parser.parse_authorization_headers(&[header]) {
//!     println!("authenticated: {:?}", metadata.public());
//! }
//! # Ok(())
//! # }
//! ```

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use castellan_cache::{BoundedCache, CacheReplacementPolicy, CacheStats, Clock};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    error::{AuthError, Result},
    expression::Expression,
    metadata::AuthenticationMetadata,
    signature::SignatureValidator,
};

/// Default maximum number of cached header verdicts.
pub const DEFAULT_MAXIMUM_CACHE_SIZE: usize = 10_000;

const BEARER_PATTERN: &str =
    r"^Bearer\s+(([-_A-Za-z0-9]+)\.([-_A-Za-z0-9]+))\.([-_A-Za-z0-9]+)$";

#[derive(Deserialize)]
struct JoseHeader {
    alg: String,
    #[serde(default)]
    kid: Option<String>,
}

#[derive(Clone)]
struct HeaderVerdict {
    metadata: Option<Arc<AuthenticationMetadata>>,
    not_before: DateTime<Utc>,
    expiration: DateTime<Utc>,
}

impl HeaderVerdict {
    fn unauthenticated() -> Self {
        Self { metadata: None, not_before: DateTime::<Utc>::MAX_UTC, expiration: DateTime::<Utc>::MIN_UTC }
    }

    fn authenticated_at(&self, now: DateTime<Utc>) -> Option<&Arc<AuthenticationMetadata>> {
        if self.not_before <= now && now < self.expiration {
            self.metadata.as_ref()
        } else {
            None
        }
    }
}

/// Validates bearer tokens and caches the verdicts.
pub struct AuthorizationHeaderParser {
    clock: Arc<dyn Clock>,
    signature_validator: Arc<dyn SignatureValidator>,
    claims_validator: Expression,
    metadata_extractor: Expression,
    header_format: Regex,
    cache: Mutex<BoundedCache<String, HeaderVerdict>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[bon::bon]
impl AuthorizationHeaderParser {
    /// Creates a parser with an empty cache.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Internal` if the header pattern fails to compile.
    #[builder]
    pub fn new(
        clock: Arc<dyn Clock>,
        signature_validator: Arc<dyn SignatureValidator>,
        claims_validator: Expression,
        metadata_extractor: Expression,
        #[builder(default)] cache_replacement_policy: CacheReplacementPolicy,
        #[builder(default = DEFAULT_MAXIMUM_CACHE_SIZE)] maximum_cache_size: usize,
    ) -> Result<Self> {
        let header_format = Regex::new(BEARER_PATTERN)
            .map_err(|err| AuthError::internal_with_source("Invalid bearer token pattern", err))?;
        Ok(Self {
            clock,
            signature_validator,
            claims_validator,
            metadata_extractor,
            header_format,
            cache: Mutex::new(BoundedCache::new(cache_replacement_policy, maximum_cache_size)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }
}

impl AuthorizationHeaderParser {
    /// Returns the metadata of the first header carrying a token that is
    /// valid now, or `None` if there is none.
    pub fn parse_authorization_headers(
        &self,
        headers: &[&str],
    ) -> Option<Arc<AuthenticationMetadata>> {
        let now = self.clock.now();
        let mut cache = self.cache.lock();

        let mut uncached = Vec::new();
        for header in headers {
            match cache.get(*header) {
                Some(verdict) => {
                    if let Some(metadata) = verdict.authenticated_at(now) {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(cache = "jwt", "cache hit");
                        return Some(Arc::clone(metadata));
                    }
                },
                None => uncached.push(*header),
            }
        }

        let mut result = None;
        for header in uncached {
            self.misses.fetch_add(1, Ordering::Relaxed);
            let verdict = match self.validate(header) {
                Ok(verdict) => verdict,
                Err(err) => {
                    tracing::debug!(error = %err, "rejected bearer token");
                    HeaderVerdict::unauthenticated()
                },
            };
            if result.is_none() {
                result = verdict.authenticated_at(now).cloned();
            }
            cache.insert(header.to_owned(), verdict);
        }
        result
    }

    /// Returns a snapshot of the verdict cache counters.
    pub fn stats(&self) -> CacheStats {
        let cache = self.cache.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            waits: 0,
            evictions: cache.evictions(),
            entries: cache.len(),
        }
    }

    fn validate(&self, header: &str) -> Result<HeaderVerdict> {
        let captures = self
            .header_format
            .captures(header)
            .ok_or_else(|| AuthError::unauthenticated("Authorization header is not a bearer token"))?;
        let (header_and_payload, encoded_header, encoded_payload, encoded_signature) =
            (&captures[1], &captures[2], &captures[3], &captures[4]);

        let jose: JoseHeader = serde_json::from_slice(&decode_segment(encoded_header, "header")?)
            .map_err(|err| AuthError::unauthenticated(format!("Invalid JWT header: {err}")))?;
        let signature = decode_segment(encoded_signature, "signature")?;
        if !self.signature_validator.validate_signature(
            &jose.alg,
            jose.kid.as_deref(),
            header_and_payload.as_bytes(),
            &signature,
        ) {
            return Err(AuthError::unauthenticated("Invalid JWT signature"));
        }

        let payload: Value = serde_json::from_slice(&decode_segment(encoded_payload, "payload")?)
            .map_err(|err| AuthError::unauthenticated(format!("Invalid JWT payload: {err}")))?;
        if !self.claims_validator.evaluate_boolean(&payload)? {
            return Err(AuthError::unauthenticated("JWT claims rejected"));
        }
        let metadata = AuthenticationMetadata::from_raw(self.metadata_extractor.search(&payload)?)?;

        let not_before = numeric_date(&payload, "nbf")?.unwrap_or(DateTime::<Utc>::MIN_UTC);
        let expiration = numeric_date(&payload, "exp")?.unwrap_or(DateTime::<Utc>::MAX_UTC);
        Ok(HeaderVerdict { metadata: Some(Arc::new(metadata)), not_before, expiration })
    }
}

fn decode_segment(segment: &str, name: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(segment)
        .map_err(|err| AuthError::unauthenticated(format!("Invalid JWT {name} encoding: {err}")))
}

/// Reads a JWT NumericDate claim, accepting integer and fractional seconds.
fn numeric_date(payload: &Value, claim: &str) -> Result<Option<DateTime<Utc>>> {
    let Some(value) = payload.get(claim) else {
        return Ok(None);
    };
    let invalid = || AuthError::unauthenticated(format!("Invalid {claim} claim"));
    let Value::Number(number) = value else {
        return Err(invalid());
    };
    let date = if let Some(seconds) = number.as_i64() {
        DateTime::from_timestamp(seconds, 0)
    } else {
        number.as_f64().filter(|seconds| seconds.is_finite()).and_then(|seconds| {
            let whole = seconds.floor();
            let nanos = ((seconds - whole) * 1e9).clamp(0.0, 999_999_999.0) as u32;
            DateTime::from_timestamp(whole as i64, nanos)
        })
    };
    date.map(Some).ok_or_else(invalid)
}
