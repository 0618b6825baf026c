//! HTTP surface — the broker's axum router and shared state.
//!
//! Three route groups:
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Liveness, unauthenticated |
//! | `GET` | `/auth/{provider}/access-token` | Cached access token lookup (redirects into consent on miss) |
//! | `GET` | `/auth/{provider}/request-access-token` | Start the provider consent flow |
//! | `GET` | `/auth/{provider}/callback` | OAuth code-exchange / token callback |

pub mod handler;

use std::sync::Arc;

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::Result;
use crate::access_token::AccessTokenManager;
use crate::cache::{FileTokenCache, TokenCache};
use crate::config::Config;
use crate::issuer::IdentityTokenIssuer;
use crate::jwt::JwtCodec;
use crate::provider::{DefaultScopeMatcher, Provider};
use crate::signing_key::SigningKeyResolver;

/// Shared state behind every handler.
pub struct AppState {
    /// Loaded configuration
    pub config: Config,
    /// Token cache shared by the managers and the resolver
    pub cache: Arc<dyn TokenCache>,
    /// Codec for locally-issued tokens
    pub codec: Arc<JwtCodec>,
    /// Local identity token issuer
    pub issuer: IdentityTokenIssuer,
    /// Provider signing-key resolver
    pub resolver: SigningKeyResolver,
    /// Outbound HTTP client for code exchange
    pub http: reqwest::Client,
}

impl AppState {
    /// Build the full state from configuration.
    pub fn from_config(config: Config) -> Result<Self> {
        let cache: Arc<dyn TokenCache> = if config.cache.directory.is_empty() {
            Arc::new(FileTokenCache::default_location()?)
        } else {
            Arc::new(FileTokenCache::new(config.cache.directory.clone().into())?)
        };

        Self::with_cache(config, cache)
    }

    /// Build the state over an explicit cache backend (tests inject
    /// [`InMemoryTokenCache`](crate::cache::InMemoryTokenCache) here).
    pub fn with_cache(config: Config, cache: Arc<dyn TokenCache>) -> Result<Self> {
        let codec = Arc::new(JwtCodec::from_config(&config.token)?);
        let issuer = IdentityTokenIssuer::new(codec.clone(), &config.token);

        let keys_endpoint = |name: &str, fallback: &str| {
            config
                .providers
                .get(name)
                .map(|p| p.keys_endpoint.clone())
                .filter(|endpoint| !endpoint.is_empty())
                .unwrap_or_else(|| fallback.to_string())
        };
        let resolver = SigningKeyResolver::with_endpoints(
            cache.clone(),
            keys_endpoint("azure", crate::signing_key::AZURE_KEYS_ENDPOINT),
            keys_endpoint("google", crate::signing_key::GOOGLE_KEYS_ENDPOINT),
        );

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Ok(Self {
            config,
            cache,
            codec,
            issuer,
            resolver,
            http,
        })
    }

    /// Access-token manager for `provider`, sharing the broker cache.
    pub fn manager_for(&self, provider: Provider) -> Result<AccessTokenManager> {
        let provider_config = self.config.provider(provider.as_str())?;

        Ok(AccessTokenManager::new(
            self.cache.clone(),
            Arc::new(DefaultScopeMatcher),
            provider,
            provider_config.default_scope.clone(),
            self.config.errors.verbose,
        ))
    }
}

/// Build the broker router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handler::health))
        .route(
            "/auth/{provider}/access-token",
            get(handler::access_token),
        )
        .route(
            "/auth/{provider}/request-access-token",
            get(handler::request_access_token),
        )
        .route("/auth/{provider}/callback", get(handler::oauth_callback))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
