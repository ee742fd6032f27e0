//! Construction-time configuration.
//!
//! Loadable from a JSON file; every section is optional and falls back to
//! defaults. Secrets are never stored in the file, only the names of the
//! environment variables that hold them.

use anyhow::{Context, Result, bail};
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{
    ApiKeyAuth, AuthProvider, BearerAuth, NoAuth, SignedRequestAuth, StaticToken, TokenEndpoint,
    mask,
};
use crate::cache::CacheConfig;
use crate::error::ClientError;
use crate::http::join_url;
use crate::retry::RetryConfig;

pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_MAX_CONNECTIONS_PER_HOST: usize = 8;

pub const DEFAULT_API_KEY_ENV: &str = "RESTWELL_API_KEY";
pub const DEFAULT_TOKEN_ENV: &str = "RESTWELL_TOKEN";
pub const DEFAULT_SECRET_ENV: &str = "RESTWELL_SECRET";
pub const DEFAULT_CLIENT_ID_ENV: &str = "RESTWELL_CLIENT_ID";
pub const DEFAULT_CLIENT_SECRET_ENV: &str = "RESTWELL_CLIENT_SECRET";

fn default_api_key_header() -> String {
    "x-api-key".to_string()
}

fn default_api_key_env() -> String {
    DEFAULT_API_KEY_ENV.to_string()
}

fn default_token_env() -> String {
    DEFAULT_TOKEN_ENV.to_string()
}

fn default_secret_env() -> String {
    DEFAULT_SECRET_ENV.to_string()
}

fn default_client_id_env() -> String {
    DEFAULT_CLIENT_ID_ENV.to_string()
}

fn default_client_secret_env() -> String {
    DEFAULT_CLIENT_SECRET_ENV.to_string()
}

/// Authentication strategy and where its secrets come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum AuthConfig {
    #[default]
    None,
    ApiKey {
        #[serde(default = "default_api_key_header")]
        header: String,
        /// Send the key as this query parameter instead of a header.
        #[serde(default)]
        query_param: Option<String>,
        #[serde(default = "default_api_key_env")]
        key_env: String,
    },
    Bearer {
        #[serde(default = "default_token_env")]
        token_env: String,
        /// Client-credentials endpoint used to obtain and refresh tokens.
        /// When set, `token_env` is ignored.
        #[serde(default)]
        token_url: Option<String>,
        #[serde(default = "default_client_id_env")]
        client_id_env: String,
        #[serde(default = "default_client_secret_env")]
        client_secret_env: String,
        #[serde(default)]
        scope: Option<String>,
    },
    Signed {
        key_id: String,
        #[serde(default = "default_secret_env")]
        secret_env: String,
    },
}

impl AuthConfig {
    /// Builds the provider, reading secrets from the process environment.
    /// Token requests go through `http`.
    pub fn build_provider(&self, http: &reqwest::Client) -> Result<Arc<dyn AuthProvider>> {
        self.build_provider_with(http, |name| std::env::var(name).ok())
    }

    /// Builds the provider, resolving secret variables through `env`.
    pub fn build_provider_with<F>(
        &self,
        http: &reqwest::Client,
        env: F,
    ) -> Result<Arc<dyn AuthProvider>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |name: &str| -> Result<String> {
            env(name)
                .filter(|v| !v.is_empty())
                .with_context(|| format!("Environment variable {} is not set", name))
        };

        let provider: Arc<dyn AuthProvider> = match self {
            AuthConfig::None => Arc::new(NoAuth),
            AuthConfig::ApiKey {
                header,
                query_param,
                key_env,
            } => {
                let key = require(key_env)?;
                debug!("Using API key from {}: {}", key_env, mask(&key));
                match query_param {
                    Some(param) => Arc::new(ApiKeyAuth::query(param.clone(), key)),
                    None => Arc::new(ApiKeyAuth::header(header.clone(), key)),
                }
            }
            AuthConfig::Bearer {
                token_env: _,
                token_url: Some(token_url),
                client_id_env,
                client_secret_env,
                scope,
            } => {
                let client_id = require(client_id_env)?;
                let client_secret = require(client_secret_env)?;
                let mut endpoint = TokenEndpoint::new(
                    http.clone(),
                    token_url.clone(),
                    client_id,
                    client_secret,
                );
                if let Some(scope) = scope {
                    endpoint = endpoint.with_scope(scope.clone());
                }
                debug!("Using bearer tokens from {}", token_url);
                Arc::new(BearerAuth::new(endpoint))
            }
            AuthConfig::Bearer { token_env, .. } => {
                let token = require(token_env)?;
                debug!("Using bearer token from {}: {}", token_env, mask(&token));
                Arc::new(BearerAuth::new(StaticToken::new(token)))
            }
            AuthConfig::Signed { key_id, secret_env } => {
                let secret = require(secret_env)?;
                Arc::new(SignedRequestAuth::new(key_id.clone(), secret))
            }
        };
        Ok(provider)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    /// Per-attempt timeout.
    pub timeout_ms: u64,
    /// Default whole-call deadline, covering every attempt and backoff.
    pub deadline_ms: Option<u64>,
    pub max_connections_per_host: usize,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub auth: AuthConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            deadline_ms: None,
            max_connections_per_host: DEFAULT_MAX_CONNECTIONS_PER_HOST,
            retry: RetryConfig::default(),
            cache: CacheConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: ClientConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.base_url.is_empty() {
            return Err(ClientError::Config("base_url is required".to_string()));
        }
        join_url(&self.base_url, "")?;
        if self.timeout_ms == 0 {
            return Err(ClientError::Config("timeout_ms must be positive".to_string()));
        }
        if self.max_connections_per_host == 0 {
            return Err(ClientError::Config(
                "max_connections_per_host must be positive".to_string(),
            ));
        }
        self.retry.validate()
    }
}

/// Parses `key=value` (or `name:value` with `sep = ':'`) pairs from the CLI.
pub fn parse_pair(raw: &str, sep: char) -> Result<(String, String)> {
    let Some((key, value)) = raw.split_once(sep) else {
        bail!("Expected '{}' in '{}'", sep, raw);
    };
    let key = key.trim();
    if key.is_empty() {
        bail!("Empty name in '{}'", raw);
    }
    Ok((key.to_string(), value.trim().to_string()))
}
