//! Signing-key resolver — fetches and caches provider public key material.
//!
//! Provider-issued tokens are signed with rotating keys published at each
//! provider's discovery endpoint. The resolver caches the material per key id
//! with a fixed one-day expiry: Azure entries store the first `x5c`
//! certificate of the matching JWKS entry, Google entries store the RSA
//! modulus and exponent composed as `"n e"`.
//!
//! MS Live is accepted as a provider value but has no key discovery path;
//! requesting it yields `None`. Do not add an endpoint without confirmation
//! of the real one.
//!
//! Outbound fetches run under a bounded 10-second timeout. A timeout or
//! transport failure is a retryable "fetch failed" condition — the resolver
//! returns `None` and the caller falls back to its redirect/deny path; it
//! never takes the process down.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use base64::{
    Engine as _,
    engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD},
};
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey};
use serde_json::Value;
use tracing::{debug, warn};
use x509_parser::parse_x509_certificate;

use crate::audit::{self, AuditEvent};
use crate::cache::TokenCache;
use crate::jwt::JwtCodec;
use crate::provider::Provider;
use crate::{Error, Result};

/// Azure AD key discovery endpoint template. `{tenant}` is substituted.
pub const AZURE_KEYS_ENDPOINT: &str = "https://login.microsoftonline.com/{tenant}/discovery/keys";

/// Google JWKS endpoint.
pub const GOOGLE_KEYS_ENDPOINT: &str = "https://www.googleapis.com/oauth2/v3/certs";

/// How long fetched key material stays cached.
const KEY_CACHE_DAYS: i64 = 1;

/// Resolves and caches provider signing-key material by key id.
pub struct SigningKeyResolver {
    cache: Arc<dyn TokenCache>,
    http: reqwest::Client,
    azure_endpoint: String,
    google_endpoint: String,
}

impl SigningKeyResolver {
    /// Create a resolver with the default provider endpoints.
    #[must_use]
    pub fn new(cache: Arc<dyn TokenCache>) -> Self {
        Self::with_endpoints(cache, AZURE_KEYS_ENDPOINT, GOOGLE_KEYS_ENDPOINT)
    }

    /// Create a resolver with explicit discovery endpoints (tests, sovereign
    /// clouds).
    #[must_use]
    pub fn with_endpoints(
        cache: Arc<dyn TokenCache>,
        azure_endpoint: impl Into<String>,
        google_endpoint: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            http: reqwest::Client::builder()
                .timeout(StdDuration::from_secs(10))
                .build()
                .unwrap_or_default(),
            azure_endpoint: azure_endpoint.into(),
            google_endpoint: google_endpoint.into(),
        }
    }

    /// Return the signing-key material for `key_id`, consulting the cache
    /// first.
    ///
    /// An expired cache row is deleted before a fresh fetch. `None` means the
    /// provider has no such key (or the fetch failed / the provider has no
    /// discovery path).
    ///
    /// # Errors
    ///
    /// [`Error::Storage`] on cache faults only.
    pub async fn load(
        &self,
        app_id: &str,
        tenant: &str,
        key_id: &str,
        provider: Provider,
    ) -> Result<Option<String>> {
        let kind = provider.key_cache_kind();

        if let Some(row) = self.cache.get(kind, key_id).await? {
            if row.is_expired(Utc::now()) {
                debug!(key_id = %key_id, provider = %provider, "Cached signing key expired");
                self.cache.delete(kind, key_id).await?;
            } else {
                return Ok(Some(row.value));
            }
        }

        self.fetch(app_id, tenant, key_id, provider).await
    }

    /// Fetch fresh key material from the provider's discovery endpoint.
    ///
    /// Every successful fetch is written to the cache with a one-day expiry,
    /// also when called directly instead of through [`load`](Self::load).
    pub async fn fetch(
        &self,
        app_id: &str,
        tenant: &str,
        key_id: &str,
        provider: Provider,
    ) -> Result<Option<String>> {
        let material = match provider {
            Provider::Azure => self.fetch_azure(app_id, tenant, key_id).await,
            Provider::Google => self.fetch_google(key_id).await,
            // Known gap: no discovery endpoint is implemented for MS Live
            Provider::MsLive => None,
        };

        let Some(material) = material else {
            return Ok(None);
        };

        self.cache
            .create(
                &material,
                Utc::now() + Duration::days(KEY_CACHE_DAYS),
                provider.key_cache_kind(),
                key_id,
            )
            .await?;

        audit::emit(&AuditEvent::signing_key_fetched(provider, key_id));
        Ok(Some(material))
    }

    async fn fetch_azure(&self, app_id: &str, tenant: &str, key_id: &str) -> Option<String> {
        let tenant = if tenant.is_empty() { "common" } else { tenant };
        let mut url = self.azure_endpoint.replace("{tenant}", tenant);
        if !app_id.is_empty() {
            url = format!("{url}?appid={app_id}");
        }

        let doc = self.fetch_discovery_document(&url).await?;
        azure_certificate(&doc, key_id)
    }

    async fn fetch_google(&self, key_id: &str) -> Option<String> {
        let doc = self.fetch_discovery_document(&self.google_endpoint).await?;
        google_components(&doc, key_id)
    }

    async fn fetch_discovery_document(&self, url: &str) -> Option<Value> {
        let response = match self.http.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(url = %url, error = %e, "Signing-key fetch failed");
                return None;
            }
        };

        if !response.status().is_success() {
            warn!(url = %url, status = %response.status(), "Signing-key fetch rejected");
            return None;
        }

        match response.json::<Value>().await {
            Ok(doc) => Some(doc),
            Err(e) => {
                warn!(url = %url, error = %e, "Signing-key document is not JSON");
                None
            }
        }
    }

    /// Verify a provider-issued RS256 token using the key named by its
    /// header `kid`.
    ///
    /// `false` covers every non-storage failure: malformed token, missing
    /// `kid`, unknown key, unusable material, bad signature.
    ///
    /// # Errors
    ///
    /// [`Error::Storage`] on cache faults only.
    pub async fn verify_provider_token(
        &self,
        token: &str,
        app_id: &str,
        tenant: &str,
        provider: Provider,
    ) -> Result<bool> {
        let Some(parsed) = JwtCodec::parse(token) else {
            return Ok(false);
        };
        let Some(key_id) = parsed.header.get("kid").and_then(Value::as_str) else {
            return Ok(false);
        };

        let Some(material) = self.load(app_id, tenant, key_id, provider).await? else {
            return Ok(false);
        };

        let Ok(key) = decoding_key_for(provider, &material) else {
            warn!(key_id = %key_id, provider = %provider, "Cached key material is unusable");
            return Ok(false);
        };

        Ok(JwtCodec::verify_with_key(token, &key, Algorithm::RS256))
    }
}

/// First `x5c` certificate of the discovery entry matching `key_id`.
fn azure_certificate(doc: &Value, key_id: &str) -> Option<String> {
    let keys = doc.get("keys")?.as_array()?;

    keys.iter()
        .find(|entry| entry.get("kid").and_then(Value::as_str) == Some(key_id))
        .and_then(|entry| entry.get("x5c")?.as_array()?.first()?.as_str())
        .map(str::to_string)
}

/// RSA modulus and exponent of the JWKS entry matching `key_id`, composed as
/// `"n e"`.
fn google_components(doc: &Value, key_id: &str) -> Option<String> {
    let keys = doc.get("keys")?.as_array()?;

    let entry = keys
        .iter()
        .find(|entry| entry.get("kid").and_then(Value::as_str) == Some(key_id))?;

    let n = entry.get("n")?.as_str()?;
    let e = entry.get("e")?.as_str()?;
    Some(format!("{n} {e}"))
}

/// Turn cached key material into an RS256 verification key.
///
/// Azure material is a base64 DER certificate whose RSA public key is
/// extracted; Google material is the `"n e"` component pair.
pub fn decoding_key_for(provider: Provider, material: &str) -> Result<DecodingKey> {
    match provider {
        Provider::Azure | Provider::MsLive => {
            let der = STANDARD
                .decode(material.trim())
                .map_err(|e| Error::Internal(format!("x5c material is not base64: {e}")))?;
            let (_, cert) = parse_x509_certificate(&der)
                .map_err(|e| Error::Internal(format!("x5c material is not a certificate: {e}")))?;

            match cert.public_key().parsed() {
                Ok(x509_parser::public_key::PublicKey::RSA(rsa)) => {
                    let n = URL_SAFE_NO_PAD.encode(rsa.modulus);
                    let e = URL_SAFE_NO_PAD.encode(rsa.exponent);
                    DecodingKey::from_rsa_components(&n, &e)
                        .map_err(|e| Error::Internal(format!("invalid RSA components: {e}")))
                }
                _ => Err(Error::Internal(
                    "certificate key is not RSA".to_string(),
                )),
            }
        }
        Provider::Google => {
            let (n, e) = material
                .split_once(' ')
                .ok_or_else(|| Error::Internal("google key material is not 'n e'".to_string()))?;
            DecodingKey::from_rsa_components(n, e)
                .map_err(|e| Error::Internal(format!("invalid RSA components: {e}")))
        }
    }
}
