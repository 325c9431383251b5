//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Credentials are a flat token list in the TOML; the file is expected to be
//! permission-restricted by the operator since the tokens are secrets.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub relay: RelayConfig,
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub challenge: ChallengeConfig,
    #[serde(default)]
    pub helper: HelperConfig,
}

/// Relay listener and backend settings
#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub backend_url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// The rotating credential set
#[derive(Debug, Deserialize)]
pub struct CredentialsConfig {
    pub tokens: Vec<String>,
}

/// Local challenge-issuing service
#[derive(Debug, Deserialize)]
pub struct ChallengeConfig {
    #[serde(default = "default_challenge_port")]
    pub port: u16,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            port: default_challenge_port(),
        }
    }
}

/// Optional co-located challenge helper process
#[derive(Debug, Deserialize)]
pub struct HelperConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_helper_command")]
    pub command: String,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: default_helper_command(),
        }
    }
}

fn default_max_connections() -> usize {
    1000
}

fn default_sweep_interval() -> u64 {
    1800
}

fn default_challenge_port() -> u16 {
    8081
}

fn default_helper_command() -> String {
    "challenge-helper".to_string()
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;

        if !config.relay.backend_url.starts_with("http://")
            && !config.relay.backend_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "backend_url must start with http:// or https://, got: {}",
                config.relay.backend_url
            )));
        }

        if config.credentials.tokens.is_empty() {
            return Err(common::Error::Config(
                "credentials.tokens must contain at least one token".into(),
            ));
        }

        if config.credentials.tokens.iter().any(|t| t.trim().is_empty()) {
            return Err(common::Error::Config(
                "credentials.tokens must not contain empty tokens".into(),
            ));
        }

        if config.relay.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if config.relay.sweep_interval_secs == 0 {
            return Err(common::Error::Config(
                "sweep_interval_secs must be greater than 0".into(),
            ));
        }

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
        PathBuf::from("chat-relay.toml")
    }
}
