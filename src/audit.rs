//! Audit logging for token lifecycle events.
//!
//! Every event is emitted via `tracing::info!` with structured fields, making
//! the audit trail queryable by any log aggregator (Loki, CloudWatch, Datadog).
//!
//! # Events
//!
//! | Event | When |
//! |-------|------|
//! | `token.issued` | A local identity token is issued at login |
//! | `token.rejected` | A presented token failed signature/expiry checks |
//! | `access_token.saved` | A provider access token was written to the cache |
//! | `access_token.redirected` | A request was sent through the re-consent flow |
//! | `signing_key.fetched` | Fresh signing-key material was fetched from a provider |

use serde::Serialize;

use crate::provider::Provider;

/// Structured audit event emitted for every token lifecycle transition.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type string (e.g., `"token.issued"`).
    pub event: &'static str,
    /// Username the event concerns, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// External provider involved, when any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
    /// Requested scope (for access-token events).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Signing key id (for key events).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    /// Human-readable reason for rejection/redirect events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AuditEvent {
    /// Construct a `token.issued` event.
    #[must_use]
    pub fn issued(username: &str) -> Self {
        Self {
            event: "token.issued",
            username: Some(username.to_string()),
            provider: None,
            scope: None,
            key_id: None,
            reason: None,
        }
    }

    /// Construct a `token.rejected` event.
    #[must_use]
    pub fn rejected(username: &str, reason: impl Into<String>) -> Self {
        Self {
            event: "token.rejected",
            username: Some(username.to_string()),
            provider: None,
            scope: None,
            key_id: None,
            reason: Some(reason.into()),
        }
    }

    /// Construct an `access_token.saved` event.
    #[must_use]
    pub fn access_token_saved(username: &str, provider: Provider) -> Self {
        Self {
            event: "access_token.saved",
            username: Some(username.to_string()),
            provider: Some(provider),
            scope: None,
            key_id: None,
            reason: None,
        }
    }

    /// Construct an `access_token.redirected` event.
    #[must_use]
    pub fn access_token_redirected(
        username: &str,
        provider: Provider,
        scope: &str,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            event: "access_token.redirected",
            username: Some(username.to_string()),
            provider: Some(provider),
            scope: Some(scope.to_string()),
            key_id: None,
            reason: Some(reason.into()),
        }
    }

    /// Construct a `signing_key.fetched` event.
    #[must_use]
    pub fn signing_key_fetched(provider: Provider, key_id: &str) -> Self {
        Self {
            event: "signing_key.fetched",
            username: None,
            provider: Some(provider),
            scope: None,
            key_id: Some(key_id.to_string()),
            reason: None,
        }
    }
}

/// Emit an audit event via `tracing::info!` with structured fields.
///
/// The event is serialized as a JSON blob in the `audit` field:
///
/// ```text
/// INFO token_broker::audit audit={"event":"token.issued","username":...}
/// ```
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(audit = %json, "token audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
