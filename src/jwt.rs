//! JWT codec — encode, decode, sign, and verify compact three-part tokens.
//!
//! RS256 is the only supported algorithm; the key pair is supplied through
//! configuration as base64-encoded PEM material. Signing happens inside
//! [`JwtCodec::generate`]; asking for any other algorithm there is a typed
//! error, while [`JwtCodec::verify`] treats it as just another invalid token.
//!
//! # Malformed input policy
//!
//! [`JwtCodec::parse`] never errors: wrong segment count, undecodable
//! base64url, or non-JSON payloads all yield `None`, the same as no token at
//! all. Probing with garbage must not raise server errors.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde_json::{Map, Value};
use tracing::debug;

use crate::audit::{self, AuditEvent};
use crate::config::TokenConfig;
use crate::session::SessionStore;
use crate::{Error, Result};

/// Claim names the broker stamps itself; callers may not supply them.
pub const RESERVED_CLAIMS: [&str; 5] = ["iss", "exp", "nbf", "iat", "jti"];

/// Application claims every locally-issued token must carry.
pub const REQUIRED_CLAIMS: [&str; 4] = ["username", "name", "roles", "last_ip"];

/// A token split into its decoded parts. Signature bytes are raw, not
/// base64url.
#[derive(Debug, Clone)]
pub struct ParsedToken {
    /// Decoded header JSON
    pub header: Value,
    /// Decoded claims map
    pub claims: Map<String, Value>,
    /// Raw signature bytes
    pub signature: Vec<u8>,
}

/// Codec for locally-issued identity tokens.
pub struct JwtCodec {
    issuer: String,
    default_lifetime_secs: u64,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtCodec {
    /// Build a codec from token configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the key material is missing, not valid
    /// base64, or not a parseable RSA PEM.
    pub fn from_config(config: &TokenConfig) -> Result<Self> {
        let private_pem = config.resolve_private_key()?;
        let public_pem = config.resolve_public_key()?;

        let encoding_key = EncodingKey::from_rsa_pem(&private_pem)
            .map_err(|e| Error::Config(format!("token.private_key is not a valid RSA PEM: {e}")))?;
        let decoding_key = DecodingKey::from_rsa_pem(&public_pem)
            .map_err(|e| Error::Config(format!("token.public_key is not a valid RSA PEM: {e}")))?;

        Ok(Self {
            issuer: config.issuer.clone(),
            default_lifetime_secs: config.lifetime_secs,
            encoding_key,
            decoding_key,
        })
    }

    /// Split and decode a compact token without verifying anything.
    ///
    /// Returns `None` for anything that is not three base64url segments with
    /// JSON header and object payload.
    #[must_use]
    pub fn parse(token: &str) -> Option<ParsedToken> {
        let segments: Vec<&str> = token.split('.').collect();
        if segments.len() != 3 {
            return None;
        }

        let header_bytes = URL_SAFE_NO_PAD.decode(segments[0]).ok()?;
        let payload_bytes = URL_SAFE_NO_PAD.decode(segments[1]).ok()?;
        let signature = URL_SAFE_NO_PAD.decode(segments[2]).ok()?;

        let header: Value = serde_json::from_slice(&header_bytes).ok()?;
        let payload: Value = serde_json::from_slice(&payload_bytes).ok()?;
        let claims = payload.as_object().cloned()?;

        Some(ParsedToken {
            header,
            claims,
            signature,
        })
    }

    /// Issue a signed token carrying `claims` plus the system-managed claims.
    ///
    /// `lifetime_secs` defaults to the configured token lifetime. The stamped
    /// claims are `iss` (configured issuer), `exp = now + lifetime`,
    /// `nbf = now - 1`, `iat = now`, and a random 128-bit hex `jti`.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedAlgorithm`] for anything but RS256.
    /// [`Error::InvalidClaims`] when a reserved claim is supplied, a required
    /// application claim is missing, or `roles` is not a list.
    pub fn generate(
        &self,
        claims: &Map<String, Value>,
        lifetime_secs: Option<u64>,
        algorithm: Algorithm,
    ) -> Result<String> {
        if algorithm != Algorithm::RS256 {
            return Err(Error::UnsupportedAlgorithm(format!("{algorithm:?}")));
        }

        for reserved in RESERVED_CLAIMS {
            if claims.contains_key(reserved) {
                return Err(Error::InvalidClaims(format!(
                    "claim '{reserved}' is system-managed and may not be supplied"
                )));
            }
        }

        for required in REQUIRED_CLAIMS {
            if !claims.contains_key(required) {
                return Err(Error::InvalidClaims(format!(
                    "required claim '{required}' is missing"
                )));
            }
        }

        if !claims["roles"].is_array() {
            return Err(Error::InvalidClaims(
                "claim 'roles' must be a list".to_string(),
            ));
        }

        let lifetime = lifetime_secs.unwrap_or(self.default_lifetime_secs);
        let now = Utc::now().timestamp();

        let mut full = claims.clone();
        full.insert("iss".to_string(), Value::from(self.issuer.clone()));
        let exp = now.saturating_add(i64::try_from(lifetime).unwrap_or(i64::MAX));
        full.insert("exp".to_string(), Value::from(exp));
        full.insert("nbf".to_string(), Value::from(now - 1));
        full.insert("iat".to_string(), Value::from(now));
        full.insert("jti".to_string(), Value::from(generate_jti()));

        jsonwebtoken::encode(&Header::new(algorithm), &full, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("Token signing failed: {e}")))
    }

    /// Verify the token signature against the configured public key.
    ///
    /// Any failure mode — malformed token, wrong key, wrong algorithm —
    /// is `false`, never an error.
    #[must_use]
    pub fn verify(&self, token: &str, algorithm: Algorithm) -> bool {
        Self::verify_with_key(token, &self.decoding_key, algorithm)
    }

    /// Verify a token signature against an explicit key.
    ///
    /// Used for provider-issued tokens whose keys come from the signing-key
    /// resolver rather than local configuration.
    #[must_use]
    pub fn verify_with_key(token: &str, key: &DecodingKey, algorithm: Algorithm) -> bool {
        if algorithm != Algorithm::RS256 {
            return false;
        }

        let mut validation = Validation::new(algorithm);
        // Signature check only — expiry has its own predicate
        validation.validate_exp = false;
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();
        validation.leeway = 0;

        jsonwebtoken::decode::<Value>(token, key, &validation).is_ok()
    }

    /// Check the time-window claims without touching the signature.
    ///
    /// True iff `exp` is present and not in the past, and `nbf` (when
    /// present) is not in the future.
    #[must_use]
    pub fn check_expiration(token: &str) -> bool {
        let Some(parsed) = Self::parse(token) else {
            return false;
        };

        let now = Utc::now().timestamp();

        let Some(exp) = parsed.claims.get("exp").and_then(Value::as_i64) else {
            return false;
        };
        if exp < now {
            return false;
        }

        if let Some(nbf) = parsed.claims.get("nbf").and_then(Value::as_i64) {
            if nbf > now {
                return false;
            }
        }

        true
    }

    /// Pull a username out of a token payload.
    ///
    /// Claims are tried in priority order `username`, `preferred_username`,
    /// `email`; the first present wins. Empty string when none is present or
    /// the token does not parse.
    #[must_use]
    pub fn extract_username(token: &str) -> String {
        let Some(parsed) = Self::parse(token) else {
            return String::new();
        };

        for claim in ["username", "preferred_username", "email"] {
            if let Some(value) = parsed.claims.get(claim).and_then(Value::as_str) {
                return value.to_string();
            }
        }

        String::new()
    }

    /// Combined validity check: signature valid AND within the time window.
    ///
    /// A failed check logs the user out — the supplied session state is
    /// cleared before `false` is returned.
    pub fn check_token(&self, token: &str, session: &dyn SessionStore) -> bool {
        let reason = if !self.verify(token, Algorithm::RS256) {
            Some("signature verification failed")
        } else if !Self::check_expiration(token) {
            Some("token expired or not yet valid")
        } else {
            None
        };

        let Some(reason) = reason else {
            return true;
        };

        debug!(reason = %reason, "Token failed validation, clearing session");
        audit::emit(&AuditEvent::rejected(&Self::extract_username(token), reason));
        session.clear();
        false
    }
}

/// Random 128-bit hex token id.
fn generate_jti() -> String {
    use rand::RngExt;
    let bytes: [u8; 16] = rand::rng().random();
    bytes.iter().fold(String::with_capacity(32), |mut acc, b| {
        use std::fmt::Write;
        let _ = write!(acc, "{b:02x}");
        acc
    })
}
