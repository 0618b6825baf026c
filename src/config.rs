//! Configuration management

use std::{collections::HashMap, env, path::Path};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Server configuration
    pub server: ServerConfig,
    /// Locally-issued identity token configuration
    pub token: TokenConfig,
    /// Token cache configuration
    pub cache: CacheConfig,
    /// Error disclosure configuration
    pub errors: ErrorsConfig,
    /// External provider configurations, keyed by provider name
    /// (`azure`, `mslive`, `google`)
    pub providers: HashMap<String, ProviderConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 39700,
        }
    }
}

/// Configuration for locally-issued identity tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Issuer string stamped into the `iss` claim
    pub issuer: String,
    /// Default token lifetime in seconds
    pub lifetime_secs: u64,
    /// "Remember me" lifetime in seconds (token and client-side persistence)
    pub remember_lifetime_secs: u64,
    /// Base64-encoded PEM private key (RS256). Supports `env:VAR_NAME`.
    pub private_key: String,
    /// Base64-encoded PEM public key (RS256). Supports `env:VAR_NAME`.
    pub public_key: String,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            issuer: "token-broker".to_string(),
            lifetime_secs: 3600,
            // One year: the non-expiring-session convenience mode
            remember_lifetime_secs: 365 * 24 * 3600,
            private_key: String::new(),
            public_key: String::new(),
        }
    }
}

impl TokenConfig {
    /// Resolve the private key material (expand `env:VAR`, decode base64).
    pub fn resolve_private_key(&self) -> Result<Vec<u8>> {
        decode_key_material(&self.private_key, "token.private_key")
    }

    /// Resolve the public key material (expand `env:VAR`, decode base64).
    pub fn resolve_public_key(&self) -> Result<Vec<u8>> {
        decode_key_material(&self.public_key, "token.public_key")
    }
}

fn decode_key_material(value: &str, field: &str) -> Result<Vec<u8>> {
    let raw = resolve_secret(value);
    if raw.is_empty() {
        return Err(Error::Config(format!("{field} is not set")));
    }
    base64::Engine::decode(&base64::engine::general_purpose::STANDARD, raw.trim())
        .map_err(|e| Error::Config(format!("{field} is not valid base64: {e}")))
}

/// Token cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Base directory for the file-backed token cache.
    /// Empty means the default location under the home directory.
    pub directory: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: String::new(),
        }
    }
}

/// Error disclosure configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct ErrorsConfig {
    /// Expose underlying storage error details to callers.
    /// Off in production; storage failures then surface as a fixed
    /// generic message.
    pub verbose: bool,
}

/// External provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct ProviderConfig {
    /// OAuth client id (supports `env:VAR_NAME`)
    pub client_id: String,
    /// OAuth client secret (supports `env:VAR_NAME`)
    pub client_secret: String,
    /// Redirect URI registered with the provider
    pub redirect_uri: String,
    /// Authorization endpoint URL
    pub authorize_endpoint: String,
    /// Token (code exchange) endpoint URL
    pub token_endpoint: String,
    /// Signing-key discovery endpoint URL. `{tenant}` is substituted.
    pub keys_endpoint: String,
    /// Directory tenant (Azure). Empty for providers without tenants.
    pub tenant: String,
    /// Scope requested when the caller does not name one
    pub default_scope: String,
}

impl ProviderConfig {
    /// Resolve the client id (expand `env:VAR`)
    #[must_use]
    pub fn resolve_client_id(&self) -> String {
        resolve_secret(&self.client_id)
    }

    /// Resolve the client secret (expand `env:VAR`)
    #[must_use]
    pub fn resolve_client_secret(&self) -> String {
        resolve_secret(&self.client_secret)
    }
}

/// Expand `env:VAR_NAME` indirection; other values pass through unchanged.
fn resolve_secret(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        // Load from file if provided
        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (TOKEN_BROKER_ prefix)
        figment = figment.merge(Env::prefixed("TOKEN_BROKER_").split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        // Load env files into process environment (before secret resolution)
        config.load_env_files();

        Ok(config)
    }

    /// Look up a provider configuration by name.
    pub fn provider(&self, name: &str) -> Result<&ProviderConfig> {
        self.providers
            .get(name)
            .ok_or_else(|| Error::ProviderNotConfigured(name.to_string()))
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_token_lifetimes() {
        let config = Config::default();

        assert_eq!(config.token.lifetime_secs, 3600);
        assert_eq!(config.token.remember_lifetime_secs, 365 * 24 * 3600);
        assert_eq!(config.token.issuer, "token-broker");
    }

    #[test]
    fn resolve_secret_passes_literal_through() {
        assert_eq!(resolve_secret("plain-secret"), "plain-secret");
    }

    #[test]
    fn resolve_secret_expands_env_var() {
        // PATH is set in any test environment
        let expected = env::var("PATH").unwrap();
        assert_eq!(resolve_secret("env:PATH"), expected);
    }

    #[test]
    fn resolve_secret_keeps_reference_when_var_missing() {
        assert_eq!(
            resolve_secret("env:TB_DEFINITELY_NOT_SET_12345"),
            "env:TB_DEFINITELY_NOT_SET_12345"
        );
    }

    #[test]
    fn key_material_rejects_empty_value() {
        let config = TokenConfig::default();
        assert!(config.resolve_private_key().is_err());
    }

    #[test]
    fn key_material_rejects_invalid_base64() {
        let config = TokenConfig {
            private_key: "not base64 !!!".to_string(),
            ..TokenConfig::default()
        };
        assert!(config.resolve_private_key().is_err());
    }

    #[test]
    fn key_material_decodes_base64_pem() {
        let pem = "-----BEGIN PUBLIC KEY-----\nabc\n-----END PUBLIC KEY-----\n";
        let config = TokenConfig {
            public_key: base64::Engine::encode(
                &base64::engine::general_purpose::STANDARD,
                pem,
            ),
            ..TokenConfig::default()
        };

        let decoded = config.resolve_public_key().unwrap();
        assert_eq!(decoded, pem.as_bytes());
    }

    #[test]
    fn provider_lookup_fails_for_unknown_name() {
        let config = Config::default();
        assert!(config.provider("azure").is_err());
    }
}
