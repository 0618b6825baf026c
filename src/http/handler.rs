//! HTTP handlers for the auth endpoints.
//!
//! ## Consent round-trip
//!
//! `request-access-token` sends the browser to the provider's authorize
//! endpoint. The original request URI travels in `state`, with the username
//! appended as a `username=` query member; the callback peels that member off
//! again before redirecting back, so the resumed URI is exactly what the user
//! originally asked for.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json,
    extract::{OriginalUri, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};
use url::{Url, form_urlencoded};

use super::AppState;
use crate::access_token::TokenFlow;
use crate::config::ProviderConfig;
use crate::provider::Provider;
use crate::{Error, Result};

// ── Request types ─────────────────────────────────────────────────────────

/// Query for the cached access-token lookup.
#[derive(Debug, Deserialize)]
pub struct AccessTokenQuery {
    /// Token owner
    pub username: String,

    /// Requested scope; provider default when omitted
    #[serde(default)]
    pub scope: Option<String>,
}

/// Query for the consent-flow start.
#[derive(Debug, Deserialize)]
pub struct AcquisitionParams {
    /// URI to resume after the round-trip
    #[serde(default)]
    pub state: Option<String>,

    /// Token owner
    #[serde(default)]
    pub username: Option<String>,

    /// Requested scope; provider default when omitted
    #[serde(default)]
    pub scope: Option<String>,
}

/// OAuth callback query parameters.
///
/// Providers either send an authorization `code` to exchange, or (MS Live
/// style) the `access_token` directly.
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    /// Authorization code
    pub code: Option<String>,

    /// State parameter carried through the round-trip
    pub state: Option<String>,

    /// Provider session id (Azure sends this; unused)
    pub session_state: Option<String>,

    /// Direct access token
    pub access_token: Option<String>,

    /// Token type for the direct form
    pub token_type: Option<String>,

    /// Validity in seconds for the direct form
    pub expires_in: Option<u64>,

    /// Granted scope for the direct form
    pub scope: Option<String>,

    /// Error code
    pub error: Option<String>,

    /// Error description
    pub error_description: Option<String>,
}

/// Successful code-exchange response body.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

// ── Handlers ──────────────────────────────────────────────────────────────

/// `GET /health` — liveness.
pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

/// `GET /auth/{provider}/access-token` — return the cached access token for
/// a user, or redirect through the consent flow.
pub async fn access_token(
    State(state): State<Arc<AppState>>,
    Path(provider_name): Path<String>,
    OriginalUri(uri): OriginalUri,
    Query(query): Query<AccessTokenQuery>,
) -> Response {
    let Ok(provider) = provider_name.parse::<Provider>() else {
        return unknown_provider(&provider_name);
    };

    let manager = match state.manager_for(provider) {
        Ok(m) => m,
        Err(e) => return error_response(StatusCode::SERVICE_UNAVAILABLE, "provider_not_configured", &e.to_string()),
    };

    let scope = match query.scope {
        Some(ref s) if !s.is_empty() => s.clone(),
        _ => match state.config.provider(provider.as_str()) {
            Ok(cfg) => cfg.default_scope.clone(),
            Err(e) => {
                return error_response(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "provider_not_configured",
                    &e.to_string(),
                );
            }
        },
    };

    let return_to = uri
        .path_and_query()
        .map_or_else(|| "/".to_string(), |pq| pq.as_str().to_string());

    match manager.get(&query.username, &scope, &return_to).await {
        Ok(TokenFlow::Granted(token)) => (
            StatusCode::OK,
            Json(json!({"access_token": token, "token_type": "Bearer"})),
        )
            .into_response(),
        // The explicit halt: nothing runs past this redirect
        Ok(TokenFlow::Redirect(url)) => Redirect::to(&url).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", &e.to_string()),
    }
}

/// `GET /auth/{provider}/request-access-token` — start the consent flow.
pub async fn request_access_token(
    State(state): State<Arc<AppState>>,
    Path(provider_name): Path<String>,
    Query(params): Query<AcquisitionParams>,
) -> Response {
    let Ok(provider) = provider_name.parse::<Provider>() else {
        return unknown_provider(&provider_name);
    };

    let provider_config = match state.config.provider(provider.as_str()) {
        Ok(cfg) => cfg,
        Err(e) => {
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "provider_not_configured",
                &e.to_string(),
            );
        }
    };

    let username = params.username.unwrap_or_default();
    let return_to = params.state.unwrap_or_else(|| "/".to_string());
    let scope = match params.scope {
        Some(ref s) if !s.is_empty() => s.clone(),
        _ => provider_config.default_scope.clone(),
    };

    let composite_state = append_username(&return_to, &username);

    match build_authorize_url(provider_config, &scope, &composite_state) {
        Ok(url) => {
            debug!(provider = %provider, username = %username, "Redirecting to provider consent");
            Redirect::to(&url).into_response()
        }
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "invalid_provider_config",
            &e.to_string(),
        ),
    }
}

/// `GET /auth/{provider}/callback` — finish the consent flow.
///
/// Exchanges the authorization code (or accepts a directly-delivered access
/// token), persists it for the user carried in `state`, and resumes the
/// original URI.
pub async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Path(provider_name): Path<String>,
    Query(params): Query<CallbackParams>,
) -> Response {
    let Ok(provider) = provider_name.parse::<Provider>() else {
        return unknown_provider(&provider_name);
    };

    if let Some(error) = params.error {
        let description = params
            .error_description
            .unwrap_or_else(|| "Unknown error".to_string());
        warn!(provider = %provider, error = %error, "Provider returned an error");
        return error_response(
            StatusCode::BAD_REQUEST,
            "provider_error",
            &format!("{error}: {description}"),
        );
    }

    let state_param = params.state.clone().unwrap_or_default();
    let (return_to, username) = split_username(&state_param);

    let Some(username) = username.filter(|u| !u.is_empty()) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_state",
            "state is missing the username member",
        );
    };

    let token = if let Some(access_token) = params.access_token {
        // Direct delivery (MS Live style implicit response)
        access_token
    } else if let Some(ref code) = params.code {
        match exchange_code(&state, provider, code).await {
            Ok(token) => token,
            Err(e) => {
                warn!(provider = %provider, error = %e, "Code exchange failed");
                return error_response(StatusCode::BAD_GATEWAY, "exchange_failed", &e.to_string());
            }
        }
    } else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "callback carried neither code nor access_token",
        );
    };

    let manager = match state.manager_for(provider) {
        Ok(m) => m,
        Err(e) => {
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "provider_not_configured",
                &e.to_string(),
            );
        }
    };

    if let Err(e) = manager.save(&token, &username).await {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", &e.to_string());
    }

    let target = if return_to.is_empty() {
        "/"
    } else {
        return_to.as_str()
    };
    Redirect::to(target).into_response()
}

// ── Helpers ───────────────────────────────────────────────────────────────

/// Exchange an authorization code at the provider token endpoint.
async fn exchange_code(state: &AppState, provider: Provider, code: &str) -> Result<String> {
    let config = state.config.provider(provider.as_str())?;

    let client_id = config.resolve_client_id();
    let client_secret = config.resolve_client_secret();

    let mut params = HashMap::new();
    params.insert("grant_type", "authorization_code");
    params.insert("code", code);
    params.insert("redirect_uri", &config.redirect_uri);
    params.insert("client_id", &client_id);
    params.insert("client_secret", &client_secret);

    let response = state
        .http
        .post(&config.token_endpoint)
        .form(&params)
        .send()
        .await
        .map_err(|e| Error::Internal(format!("Token request failed: {e}")))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(Error::Internal(format!(
            "Token exchange failed: HTTP {status} - {body}"
        )));
    }

    let token_response: TokenResponse = response
        .json()
        .await
        .map_err(|e| Error::Internal(format!("Failed to parse token response: {e}")))?;

    Ok(token_response.access_token)
}

/// Build the provider authorize URL for the consent redirect.
fn build_authorize_url(config: &ProviderConfig, scope: &str, state: &str) -> Result<String> {
    let mut url = Url::parse(&config.authorize_endpoint)
        .map_err(|e| Error::Config(format!("Invalid authorize endpoint: {e}")))?;

    {
        let mut params = url.query_pairs_mut();
        params.append_pair("response_type", "code");
        params.append_pair("client_id", &config.resolve_client_id());
        params.append_pair("redirect_uri", &config.redirect_uri);
        params.append_pair("state", state);

        if !scope.is_empty() {
            params.append_pair("scope", scope);
        }
    }

    Ok(url.to_string())
}

/// Append the username to a state URI as a query member.
fn append_username(state: &str, username: &str) -> String {
    if username.is_empty() {
        return state.to_string();
    }

    let encoded: String = form_urlencoded::byte_serialize(username.as_bytes()).collect();
    let separator = if state.contains('?') { '&' } else { '?' };
    format!("{state}{separator}username={encoded}")
}

/// Remove the `username=` query member from a state URI, returning the
/// cleaned URI and the username when present.
fn split_username(state: &str) -> (String, Option<String>) {
    let Some((path, query)) = state.split_once('?') else {
        return (state.to_string(), None);
    };

    let mut username = None;
    let kept: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .filter(|(key, value)| {
            if key == "username" {
                username = Some(value.clone());
                false
            } else {
                true
            }
        })
        .collect();

    if kept.is_empty() {
        (path.to_string(), username)
    } else {
        let rebuilt = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(kept)
            .finish();
        (format!("{path}?{rebuilt}"), username)
    }
}

fn unknown_provider(name: &str) -> Response {
    error_response(
        StatusCode::BAD_REQUEST,
        "unknown_provider",
        &format!("'{name}' is not a supported provider"),
    )
}

/// Create a JSON error response.
fn error_response(status: StatusCode, error: &str, message: &str) -> Response {
    (status, Json(json!({"error": error, "message": message}))).into_response()
}
