//! External-provider access-token manager.
//!
//! Per-user cache of a third-party OAuth access token. Expired or
//! wrong-audience tokens are not refreshed in place — the user is sent back
//! through the provider's consent flow, and the callback handler stores the
//! fresh token via [`AccessTokenManager::save`]. Refresh-token rotation is
//! deliberately absent; the redirect IS the recovery path.
//!
//! # Flow outcome
//!
//! [`TokenFlow`] makes the halt explicit: `Granted` carries a usable token,
//! `Redirect` means the response must be the given redirect and nothing after
//! it may run. Callers cannot accidentally fall through a redirect.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{debug, warn};
use url::form_urlencoded;

use crate::audit::{self, AuditEvent};
use crate::cache::TokenCache;
use crate::jwt::JwtCodec;
use crate::provider::{Provider, ScopeMatcher};
use crate::{Error, Result};

/// Cache row kind for provider access tokens.
pub const ACCESS_TOKEN_KIND: &str = "access_token";

/// Validity assumed for tokens whose payload cannot be decoded (opaque
/// MS-Live-style tokens carry no `exp` of their own).
const OPAQUE_TOKEN_VALIDITY_SECS: i64 = 3600;

/// Outcome of an access-token lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenFlow {
    /// A usable access token; the request continues.
    Granted(String),
    /// The user must be redirected to this URL; request handling stops here.
    Redirect(String),
}

impl TokenFlow {
    /// `true` for the redirect-and-stop variant.
    #[must_use]
    pub fn is_redirect(&self) -> bool {
        matches!(self, Self::Redirect(_))
    }
}

/// One manager serves every provider; the audience comparison strategy is
/// the only per-provider part.
pub struct AccessTokenManager {
    cache: Arc<dyn TokenCache>,
    matcher: Arc<dyn ScopeMatcher>,
    provider: Provider,
    default_scope: String,
    verbose_errors: bool,
}

impl AccessTokenManager {
    /// Create a manager for `provider`.
    #[must_use]
    pub fn new(
        cache: Arc<dyn TokenCache>,
        matcher: Arc<dyn ScopeMatcher>,
        provider: Provider,
        default_scope: impl Into<String>,
        verbose_errors: bool,
    ) -> Self {
        Self {
            cache,
            matcher,
            provider,
            default_scope: default_scope.into(),
            verbose_errors,
        }
    }

    /// Look up the cached access token for `(username, scope)`.
    ///
    /// Returns `Granted` with the cached token when it is unexpired and its
    /// audience satisfies `scope` (opaque tokens match automatically).
    /// Otherwise the stale row is deleted and a `Redirect` to the acquisition
    /// endpoint is returned, carrying `return_to` as the `state` to resume.
    ///
    /// # Errors
    ///
    /// [`Error::Storage`] when the cache layer fails; the message carries the
    /// underlying detail only in verbose mode.
    pub async fn get(&self, username: &str, scope: &str, return_to: &str) -> Result<TokenFlow> {
        let row = self
            .cache
            .get(ACCESS_TOKEN_KIND, username)
            .await
            .map_err(|e| self.storage_err(e))?;

        let Some(row) = row else {
            return Ok(self.redirect(username, scope, return_to, "no cached access token"));
        };

        if row.is_expired(Utc::now()) {
            self.cache
                .delete(ACCESS_TOKEN_KIND, username)
                .await
                .map_err(|e| self.storage_err(e))?;
            return Ok(self.redirect(username, scope, return_to, "cached access token expired"));
        }

        let Some(parsed) = JwtCodec::parse(&row.value) else {
            // Opaque provider token: no payload to compare, matches any scope
            debug!(username = %username, "Cached access token is opaque, returning as-is");
            return Ok(TokenFlow::Granted(row.value));
        };

        let audience = parsed
            .claims
            .get("aud")
            .and_then(Value::as_str)
            .unwrap_or("");

        if self.matcher.matches(audience, scope) {
            Ok(TokenFlow::Granted(row.value))
        } else {
            self.cache
                .delete(ACCESS_TOKEN_KIND, username)
                .await
                .map_err(|e| self.storage_err(e))?;
            Ok(self.redirect(
                username,
                scope,
                return_to,
                "cached audience does not satisfy requested scope",
            ))
        }
    }

    /// Persist a freshly acquired access token for `username`.
    ///
    /// Undecodable payloads get a synthesized one-hour validity. A cached row
    /// with the same audience is updated in place; a different audience
    /// creates a new row.
    ///
    /// # Errors
    ///
    /// [`Error::Storage`] on cache failure, mode-filtered as in [`get`](Self::get).
    pub async fn save(&self, token: &str, username: &str) -> Result<()> {
        let (audience, expires_at) = match JwtCodec::parse(token) {
            Some(parsed) => {
                let audience = parsed
                    .claims
                    .get("aud")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let expires_at = parsed
                    .claims
                    .get("exp")
                    .and_then(Value::as_i64)
                    .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
                    .unwrap_or_else(opaque_token_expiry);
                (audience, expires_at)
            }
            // Opaque token: synthesize a one-hour pseudo-claim set
            None => (None, opaque_token_expiry()),
        };

        let existing = self
            .cache
            .get(ACCESS_TOKEN_KIND, username)
            .await
            .map_err(|e| self.storage_err(e))?;

        match existing {
            None => {
                self.cache
                    .create(token, expires_at, ACCESS_TOKEN_KIND, username)
                    .await
                    .map_err(|e| self.storage_err(e))?;
            }
            Some(row) => {
                let cached_audience = JwtCodec::parse(&row.value).and_then(|parsed| {
                    parsed
                        .claims
                        .get("aud")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                });

                if cached_audience == audience {
                    self.cache
                        .update(token, expires_at, ACCESS_TOKEN_KIND, username)
                        .await
                        .map_err(|e| self.storage_err(e))?;
                } else {
                    // Different audience keeps its own row. The lookup key
                    // does not include the audience, so the most recently
                    // written row wins subsequent lookups.
                    self.cache
                        .create(token, expires_at, ACCESS_TOKEN_KIND, username)
                        .await
                        .map_err(|e| self.storage_err(e))?;
                }
            }
        }

        audit::emit(&AuditEvent::access_token_saved(username, self.provider));
        Ok(())
    }

    /// Build the redirect to the acquisition endpoint.
    ///
    /// Query: `state` (URI to resume), `username`, and `scope` unless it is
    /// the provider default.
    fn redirect(&self, username: &str, scope: &str, return_to: &str, reason: &str) -> TokenFlow {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("state", return_to);
        query.append_pair("username", username);
        if scope != self.default_scope {
            query.append_pair("scope", scope);
        }

        audit::emit(&AuditEvent::access_token_redirected(
            username,
            self.provider,
            scope,
            reason,
        ));

        TokenFlow::Redirect(format!(
            "{}?{}",
            self.provider.acquisition_path(),
            query.finish()
        ))
    }

    /// Re-wrap a cache-layer failure for callers, logging the full detail
    /// regardless of the disclosure mode.
    fn storage_err(&self, err: Error) -> Error {
        warn!(provider = %self.provider, error = %err, "Token cache operation failed");
        match err {
            Error::Storage(detail) => Error::storage(detail, self.verbose_errors),
            other => other,
        }
    }
}

fn opaque_token_expiry() -> DateTime<Utc> {
    Utc::now() + Duration::seconds(OPAQUE_TOKEN_VALIDITY_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CachedToken, InMemoryTokenCache, format_expiration};
    use crate::provider::DefaultScopeMatcher;
    use async_trait::async_trait;
    use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
    use pretty_assertions::assert_eq;

    const GRAPH: &str = "https://graph.microsoft.com";

    fn manager(cache: Arc<dyn TokenCache>) -> AccessTokenManager {
        AccessTokenManager::new(
            cache,
            Arc::new(DefaultScopeMatcher),
            Provider::Azure,
            format!("{GRAPH}/.default"),
            true,
        )
    }

    /// Build a decodable (but unsigned) provider token with the given claims.
    fn provider_token(claims: &Value) -> String {
        let header = serde_json::json!({"alg": "RS256", "typ": "JWT"});
        format!(
            "{}.{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header).unwrap()),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap()),
            URL_SAFE_NO_PAD.encode(b"sig"),
        )
    }

    fn graph_token(expires_in_secs: i64) -> String {
        provider_token(&serde_json::json!({
            "aud": GRAPH,
            "exp": Utc::now().timestamp() + expires_in_secs,
        }))
    }

    async fn seed(cache: &InMemoryTokenCache, username: &str, value: &str, expires_in_secs: i64) {
        cache
            .create(
                value,
                Utc::now() + Duration::seconds(expires_in_secs),
                ACCESS_TOKEN_KIND,
                username,
            )
            .await
            .unwrap();
    }

    // =========================================================================
    // get — redirect paths
    // =========================================================================

    #[tokio::test]
    async fn absent_token_redirects_to_acquisition_endpoint() {
        // GIVEN: no cached token for alice
        let cache = Arc::new(InMemoryTokenCache::new());
        let manager = manager(cache);

        // WHEN: a token is requested
        let flow = manager
            .get("alice", &format!("{GRAPH}/.default"), "/reports/weekly")
            .await
            .unwrap();

        // THEN: the flow halts with a redirect carrying state and username
        let TokenFlow::Redirect(url) = flow else {
            panic!("expected redirect")
        };
        assert!(url.starts_with("/auth/azure/request-access-token?"));

        let query: Vec<(String, String)> =
            form_urlencoded::parse(url.split_once('?').unwrap().1.as_bytes())
                .into_owned()
                .collect();
        assert!(query.contains(&("state".to_string(), "/reports/weekly".to_string())));
        assert!(query.contains(&("username".to_string(), "alice".to_string())));
        // Default scope is omitted from the query
        assert!(!query.iter().any(|(k, _)| k == "scope"));
    }

    #[tokio::test]
    async fn non_default_scope_is_carried_in_redirect() {
        let cache = Arc::new(InMemoryTokenCache::new());
        let manager = manager(cache);

        let flow = manager
            .get("alice", "https://outlook.office.com/.default", "/mail")
            .await
            .unwrap();

        let TokenFlow::Redirect(url) = flow else {
            panic!("expected redirect")
        };
        let query: Vec<(String, String)> =
            form_urlencoded::parse(url.split_once('?').unwrap().1.as_bytes())
                .into_owned()
                .collect();
        assert!(query.contains(&(
            "scope".to_string(),
            "https://outlook.office.com/.default".to_string()
        )));
    }

    #[tokio::test]
    async fn expired_token_is_deleted_then_redirected() {
        // GIVEN: a cached token that expired yesterday
        let cache = Arc::new(InMemoryTokenCache::new());
        seed(&cache, "alice", &graph_token(3600), -86_400).await;
        let manager = manager(cache.clone());

        // WHEN: a token is requested
        let flow = manager
            .get("alice", &format!("{GRAPH}/.default"), "/home")
            .await
            .unwrap();

        // THEN: redirect, and the stale row is gone
        assert!(flow.is_redirect());
        assert!(
            cache
                .get(ACCESS_TOKEN_KIND, "alice")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn wrong_audience_is_deleted_then_redirected() {
        // GIVEN: an unexpired token for a different API
        let cache = Arc::new(InMemoryTokenCache::new());
        let other = provider_token(&serde_json::json!({"aud": "https://other.api.com"}));
        seed(&cache, "alice", &other, 3600).await;
        let manager = manager(cache.clone());

        // WHEN: graph scope is requested
        let flow = manager
            .get("alice", &format!("{GRAPH}/.default"), "/home")
            .await
            .unwrap();

        // THEN: mismatch forces re-consent
        assert!(flow.is_redirect());
        assert!(
            cache
                .get(ACCESS_TOKEN_KIND, "alice")
                .await
                .unwrap()
                .is_none()
        );
    }

    // =========================================================================
    // get — granted paths
    // =========================================================================

    #[tokio::test]
    async fn matching_audience_is_granted() {
        // GIVEN: an unexpired token whose aud satisfies the suffix rule
        let cache = Arc::new(InMemoryTokenCache::new());
        let token = graph_token(3600);
        seed(&cache, "alice", &token, 3600).await;
        let manager = manager(cache);

        // WHEN: the /.default scope is requested
        let flow = manager
            .get("alice", &format!("{GRAPH}/.default"), "/home")
            .await
            .unwrap();

        // THEN: the cached token is returned
        assert_eq!(flow, TokenFlow::Granted(token));
    }

    #[tokio::test]
    async fn opaque_token_is_granted_without_scope_check() {
        // GIVEN: an unexpired cached value that is not a JWT at all
        let cache = Arc::new(InMemoryTokenCache::new());
        seed(&cache, "alice", "EwAoA8l6BAAU...opaque-ms-live", 3600).await;
        let manager = manager(cache);

        // WHEN: any scope is requested
        let flow = manager
            .get("alice", "https://anything.example/.default", "/home")
            .await
            .unwrap();

        // THEN: the opaque token passes through untouched
        assert_eq!(
            flow,
            TokenFlow::Granted("EwAoA8l6BAAU...opaque-ms-live".to_string())
        );
    }

    // =========================================================================
    // save
    // =========================================================================

    #[tokio::test]
    async fn save_creates_row_with_token_expiry() {
        let cache = Arc::new(InMemoryTokenCache::new());
        let manager = manager(cache.clone());
        let exp = Utc::now().timestamp() + 7200;
        let token = provider_token(&serde_json::json!({"aud": GRAPH, "exp": exp}));

        manager.save(&token, "alice").await.unwrap();

        let row = cache.get(ACCESS_TOKEN_KIND, "alice").await.unwrap().unwrap();
        assert_eq!(row.value, token);
        assert_eq!(
            row.expiration,
            format_expiration(DateTime::<Utc>::from_timestamp(exp, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn save_of_opaque_token_synthesizes_one_hour_validity() {
        // GIVEN: a token whose payload does not decode
        let cache = Arc::new(InMemoryTokenCache::new());
        let manager = manager(cache.clone());

        // WHEN: saved
        manager.save("opaque-blob", "alice").await.unwrap();

        // THEN: the row is valid for roughly one hour
        let row = cache.get(ACCESS_TOKEN_KIND, "alice").await.unwrap().unwrap();
        let expires = row.expires_at().unwrap();
        let delta = (expires - Utc::now()).num_seconds();
        assert!((3500..=3600).contains(&delta), "unexpected validity: {delta}s");
    }

    #[tokio::test]
    async fn save_same_audience_updates_in_place() {
        // GIVEN: a cached graph token
        let cache = Arc::new(InMemoryTokenCache::new());
        let manager = manager(cache.clone());
        manager.save(&graph_token(600), "alice").await.unwrap();
        let first = cache.get(ACCESS_TOKEN_KIND, "alice").await.unwrap().unwrap();

        // WHEN: a fresh token for the same audience is saved
        let fresh = graph_token(7200);
        manager.save(&fresh, "alice").await.unwrap();

        // THEN: the row is updated, identity (id) unchanged
        let row = cache.get(ACCESS_TOKEN_KIND, "alice").await.unwrap().unwrap();
        assert_eq!(row.id, first.id);
        assert_eq!(row.value, fresh);
    }

    #[tokio::test]
    async fn save_different_audience_creates_new_row() {
        // Known modeling ambiguity: the lookup key is (type, username) without
        // the audience, so "create" for a second audience leaves whichever row
        // was written last as the one subsequent lookups see.
        let cache = Arc::new(InMemoryTokenCache::new());
        let manager = manager(cache.clone());
        manager.save(&graph_token(3600), "alice").await.unwrap();
        let first = cache.get(ACCESS_TOKEN_KIND, "alice").await.unwrap().unwrap();

        // WHEN: a token for a different audience is saved
        let outlook = provider_token(&serde_json::json!({
            "aud": "https://outlook.office.com",
            "exp": Utc::now().timestamp() + 3600,
        }));
        manager.save(&outlook, "alice").await.unwrap();

        // THEN: a new row (fresh id) now answers lookups for alice
        let row = cache.get(ACCESS_TOKEN_KIND, "alice").await.unwrap().unwrap();
        assert_ne!(row.id, first.id);
        assert_eq!(row.value, outlook);
    }

    // =========================================================================
    // storage error disclosure
    // =========================================================================

    struct FailingCache;

    #[async_trait]
    impl TokenCache for FailingCache {
        async fn get(&self, _: &str, _: &str) -> crate::Result<Option<CachedToken>> {
            Err(Error::Storage("permission denied on /var/cache/row".to_string()))
        }

        async fn create(
            &self,
            _: &str,
            _: DateTime<Utc>,
            _: &str,
            _: &str,
        ) -> crate::Result<u64> {
            Err(Error::Storage("permission denied on /var/cache/row".to_string()))
        }

        async fn update(
            &self,
            _: &str,
            _: DateTime<Utc>,
            _: &str,
            _: &str,
        ) -> crate::Result<usize> {
            Err(Error::Storage("permission denied on /var/cache/row".to_string()))
        }

        async fn delete(&self, _: &str, _: &str) -> crate::Result<usize> {
            Err(Error::Storage("permission denied on /var/cache/row".to_string()))
        }
    }

    #[tokio::test]
    async fn storage_failures_surface_detail_only_in_verbose_mode() {
        // GIVEN: a cache that always fails, verbose off
        let quiet = AccessTokenManager::new(
            Arc::new(FailingCache),
            Arc::new(DefaultScopeMatcher),
            Provider::Azure,
            "",
            false,
        );

        let err = quiet.get("alice", GRAPH, "/home").await.unwrap_err();
        assert!(!err.to_string().contains("permission denied"));

        // GIVEN: the same failure with verbose on
        let verbose = AccessTokenManager::new(
            Arc::new(FailingCache),
            Arc::new(DefaultScopeMatcher),
            Provider::Azure,
            "",
            true,
        );

        let err = verbose.get("alice", GRAPH, "/home").await.unwrap_err();
        assert!(err.to_string().contains("permission denied"));
    }
}
