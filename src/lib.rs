//! Token Broker Library
//!
//! Authentication/token core for server-rendered admin applications:
//!
//! - **Local identity tokens**: RS256 JWT issuance and verification with a
//!   fixed application claims schema and "remember me" lifetimes
//! - **Provider access tokens**: per-user cache with redirect-driven
//!   re-consent on expiry or audience mismatch (Azure AD, MS Live, Google)
//! - **Signing keys**: provider x5c/x509 key material resolved by key id and
//!   cached for a day
//! - **Token cache**: narrow get/create/update/delete persistence shared by
//!   both token kinds
//!
//! The crate ships a small axum surface for the consent round-trip; the
//! embedding application drives everything else through the library types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod access_token;
pub mod audit;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod http;
pub mod issuer;
pub mod jwt;
pub mod provider;
pub mod session;
pub mod signing_key;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
