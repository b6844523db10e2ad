//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The client secret and the token cookie keys are loaded from env vars or
//! secret files, never stored in the TOML directly.

use common::Secret;
use jsonwebtoken::Algorithm;
use oauth_client::ClientOptions;
use resource_guard::{MissingTokenPolicy, PolicyRule, StaticPolicy};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub oauth: ClientOptions,
    pub resource: ResourceConfig,
    #[serde(default)]
    pub secrets: SecretFiles,
    #[serde(default)]
    pub policy: Vec<PolicyRule>,
    /// HMAC key of the token cookie, from TOKEN_HASH_KEY or hash_key_file
    #[serde(skip)]
    pub hash_key: Secret<String>,
    /// Encryption key of the token cookie, from TOKEN_BLOCK_KEY or block_key_file
    #[serde(skip)]
    pub block_key: Secret<String>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Mark the session cookie `Secure`. Disable only for plain-http development.
    #[serde(default = "default_true")]
    pub secure_cookies: bool,
}

/// Bearer token validation for the protected API routes
#[derive(Debug, Deserialize)]
pub struct ResourceConfig {
    pub public_key_path: PathBuf,
    #[serde(default = "default_algorithm")]
    pub algorithm: Algorithm,
    pub valid_issuers: Vec<String>,
    pub valid_audiences: Vec<String>,
    #[serde(default)]
    pub missing_token: MissingTokenPolicy,
    #[serde(default)]
    pub leeway_secs: u64,
}

/// Paths of files holding secrets (alternatives to the env vars)
#[derive(Debug, Default, Deserialize)]
pub struct SecretFiles {
    pub client_secret_file: Option<PathBuf>,
    pub hash_key_file: Option<PathBuf>,
    pub block_key_file: Option<PathBuf>,
}

fn default_max_connections() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

fn default_algorithm() -> Algorithm {
    Algorithm::PS256
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Secret resolution order, per secret:
    /// 1. env var (OAUTH_CLIENT_SECRET, TOKEN_HASH_KEY, TOKEN_BLOCK_KEY)
    /// 2. the matching `*_file` path from `[secrets]`
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        config
            .oauth
            .validate()
            .map_err(|e| common::Error::Config(e.to_string()))?;

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if config.resource.valid_issuers.is_empty() {
            return Err(common::Error::Config(
                "resource.valid_issuers must not be empty".into(),
            ));
        }
        if config.resource.valid_audiences.is_empty() {
            return Err(common::Error::Config(
                "resource.valid_audiences must not be empty".into(),
            ));
        }

        // Route keys are checked here so a typo fails startup
        StaticPolicy::new(config.policy.clone())
            .map_err(|e| common::Error::Config(format!("invalid policy route: {e}")))?;

        if let Some(secret) = resolve_secret(
            "OAUTH_CLIENT_SECRET",
            config.secrets.client_secret_file.as_deref(),
        )? {
            config.oauth.client_secret = secret;
        }
        config.hash_key =
            resolve_secret("TOKEN_HASH_KEY", config.secrets.hash_key_file.as_deref())?
                .ok_or_else(|| {
                    common::Error::Config(
                        "token hash key missing: set TOKEN_HASH_KEY or secrets.hash_key_file"
                            .into(),
                    )
                })?;
        config.block_key =
            resolve_secret("TOKEN_BLOCK_KEY", config.secrets.block_key_file.as_deref())?
                .ok_or_else(|| {
                    common::Error::Config(
                        "token block key missing: set TOKEN_BLOCK_KEY or secrets.block_key_file"
                            .into(),
                    )
                })?;

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("oauth-gate.toml")
    }
}

/// Env var wins over file. An empty (whitespace-only) file yields `None`.
fn resolve_secret(env_var: &str, file: Option<&Path>) -> common::Result<Option<Secret<String>>> {
    if let Ok(value) = std::env::var(env_var)
        && !value.is_empty()
    {
        return Ok(Some(Secret::new(value)));
    }
    let Some(file) = file else {
        return Ok(None);
    };
    let value = std::fs::read_to_string(file).map_err(|e| {
        common::Error::Config(format!("failed to read {}: {e}", file.display()))
    })?;
    let value = value.trim().to_owned();
    Ok((!value.is_empty()).then(|| Secret::new(value)))
}
