//! Local token issuer — the only component with a concrete claims schema.
//!
//! Thin wrapper over [`JwtCodec::generate`] that fixes the application claim
//! set (username, display name, roles, last IP) and adds the "remember me"
//! convenience mode: both the token lifetime and the reported client-side
//! persistence duration switch to a long interval, one year by default.

use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::Result;
use crate::audit::{self, AuditEvent};
use crate::config::TokenConfig;
use crate::jwt::JwtCodec;

/// Application claims carried by every locally-issued identity token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserClaims {
    /// Login name
    pub username: String,
    /// Display name
    pub name: String,
    /// Granted roles
    pub roles: Vec<String>,
    /// IP address observed at login
    pub last_ip: String,
}

/// A freshly issued token plus the duration the client should persist it.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    /// The signed compact token
    pub token: String,
    /// Seconds the client should keep the token (cookie max-age)
    pub expires_in: u64,
}

/// Issues locally-signed identity tokens.
pub struct IdentityTokenIssuer {
    codec: Arc<JwtCodec>,
    lifetime_secs: u64,
    remember_lifetime_secs: u64,
}

impl IdentityTokenIssuer {
    /// Create an issuer sharing the given codec.
    #[must_use]
    pub fn new(codec: Arc<JwtCodec>, config: &TokenConfig) -> Self {
        Self {
            codec,
            lifetime_secs: config.lifetime_secs,
            remember_lifetime_secs: config.remember_lifetime_secs,
        }
    }

    /// Issue an identity token for `user`.
    ///
    /// `remember` extends both the token expiry and the client persistence
    /// duration to the configured long interval.
    pub fn issue(&self, user: &UserClaims, remember: bool) -> Result<IssuedToken> {
        let lifetime = if remember {
            self.remember_lifetime_secs
        } else {
            self.lifetime_secs
        };

        let mut claims = Map::new();
        claims.insert("username".to_string(), Value::from(user.username.clone()));
        claims.insert("name".to_string(), Value::from(user.name.clone()));
        claims.insert("roles".to_string(), Value::from(user.roles.clone()));
        claims.insert("last_ip".to_string(), Value::from(user.last_ip.clone()));

        let token = self
            .codec
            .generate(&claims, Some(lifetime), Algorithm::RS256)?;

        audit::emit(&AuditEvent::issued(&user.username));

        Ok(IssuedToken {
            token,
            expires_in: lifetime,
        })
    }
}
