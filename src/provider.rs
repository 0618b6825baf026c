//! External identity providers and audience/scope matching.
//!
//! One [`AccessTokenManager`](crate::access_token::AccessTokenManager) serves
//! every provider; the per-provider difference — how a cached token's `aud`
//! claim is compared against a requested scope — lives behind the
//! [`ScopeMatcher`] strategy so the manager code has a single path.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Supported external identity providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Azure AD (Entra ID)
    Azure,
    /// Microsoft Live (consumer accounts)
    MsLive,
    /// Google
    Google,
}

impl Provider {
    /// Provider name as used in config keys and URL paths.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Azure => "azure",
            Self::MsLive => "mslive",
            Self::Google => "google",
        }
    }

    /// Cache row kind for this provider's signing-key material.
    #[must_use]
    pub fn key_cache_kind(self) -> &'static str {
        match self {
            Self::Azure | Self::MsLive => "x5c",
            Self::Google => "x509",
        }
    }

    /// Path of the access-token acquisition endpoint for this provider.
    #[must_use]
    pub fn acquisition_path(self) -> String {
        format!("/auth/{}/request-access-token", self.as_str())
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "azure" => Ok(Self::Azure),
            "mslive" => Ok(Self::MsLive),
            "google" => Ok(Self::Google),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

/// Strategy for deciding whether a cached token's audience satisfies a
/// requested scope.
pub trait ScopeMatcher: Send + Sync {
    /// `true` when a token issued for `audience` is usable for `scope`.
    fn matches(&self, audience: &str, scope: &str) -> bool;
}

/// Tolerant matcher used by all current providers.
///
/// A requested scope is a space-separated list of scope tokens. The audience
/// satisfies the request when, for any scope token, one of these holds:
///
/// - exact match;
/// - the scope token is the audience with a `/.default` suffix appended
///   (Azure's resource-wide scope convention);
/// - the audience is a path-prefix of the scope token, tolerating a trailing
///   slash on the audience (`https://graph.microsoft.com/` vs
///   `https://graph.microsoft.com/User.Read`).
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultScopeMatcher;

impl ScopeMatcher for DefaultScopeMatcher {
    fn matches(&self, audience: &str, scope: &str) -> bool {
        if audience.is_empty() {
            return false;
        }

        let trimmed_aud = audience.trim_end_matches('/');

        scope.split_whitespace().any(|scope_token| {
            if scope_token == audience || scope_token == trimmed_aud {
                return true;
            }

            if scope_token == format!("{trimmed_aud}/.default") {
                return true;
            }

            scope_token.starts_with(&format!("{trimmed_aud}/"))
        })
    }
}
