//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults. Account
//! secrets are never read from the TOML itself: each account resolves its
//! secret from a `RELAY_SECRET_<LOGIN>` env var or a `secret_file` path, so
//! credentials stay out of checked-in config.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use dispatch::{RetryPolicy, SchedulerConfig};
use serde::Deserialize;
use transport::AccountCredentials;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    pub accounts: Vec<AccountConfig>,
}

/// HTTP API settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

/// Where and how payloads are delivered
#[derive(Debug, Deserialize)]
pub struct DeliveryConfig {
    pub endpoint_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Dispatch engine tuning; every field has a default
#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_rate_limit")]
    pub rate_limit: i64,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_backoff")]
    pub backoff_secs: u64,
    #[serde(default = "default_backoff_limit")]
    pub backoff_limit_secs: u64,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    #[serde(default)]
    pub queue_capacity: Option<usize>,
}

/// One sender account. The secret is resolved at load time, never
/// deserialized from the TOML.
#[derive(Debug, Deserialize)]
pub struct AccountConfig {
    pub login: String,
    #[serde(skip)]
    pub secret: Option<Secret<String>>,
    /// Path to a file containing the secret (alternative to the env var)
    #[serde(default)]
    pub secret_file: Option<PathBuf>,
}

fn default_max_connections() -> usize {
    1000
}

fn default_drain_timeout() -> u64 {
    5
}

fn default_timeout() -> u64 {
    30
}

fn default_rate_limit() -> i64 {
    60
}

fn default_pool_size() -> usize {
    2
}

fn default_retries() -> u32 {
    10
}

fn default_backoff() -> u64 {
    30
}

fn default_backoff_limit() -> u64 {
    600
}

fn default_cooldown() -> u64 {
    3600
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rate_limit: default_rate_limit(),
            pool_size: default_pool_size(),
            retries: default_retries(),
            backoff_secs: default_backoff(),
            backoff_limit_secs: default_backoff_limit(),
            cooldown_secs: default_cooldown(),
            queue_capacity: None,
        }
    }
}

/// Env var a login's secret is read from: `RELAY_SECRET_<LOGIN>` with the
/// login uppercased and non-alphanumerics mapped to underscores.
pub fn secret_env_key(login: &str) -> String {
    let mut key = String::from("RELAY_SECRET_");
    for c in login.chars() {
        if c.is_ascii_alphanumeric() {
            key.push(c.to_ascii_uppercase());
        } else {
            key.push('_');
        }
    }
    key
}

impl Config {
    /// Load configuration from a TOML file, validate it, and resolve each
    /// account's secret.
    ///
    /// Secret resolution order per account:
    /// 1. `RELAY_SECRET_<LOGIN>` env var
    /// 2. `secret_file` path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if !config.delivery.endpoint_url.starts_with("http://")
            && !config.delivery.endpoint_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "endpoint_url must start with http:// or https://, got: {}",
                config.delivery.endpoint_url
            )));
        }

        if config.delivery.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if config.engine.pool_size == 0 {
            return Err(common::Error::Config(
                "pool_size must be greater than 0".into(),
            ));
        }

        if config.engine.backoff_limit_secs < config.engine.backoff_secs {
            return Err(common::Error::Config(
                "backoff_limit_secs must not be below backoff_secs".into(),
            ));
        }

        if config.accounts.is_empty() {
            return Err(common::Error::Config(
                "at least one [[accounts]] entry is required".into(),
            ));
        }

        for account in &mut config.accounts {
            let env_key = secret_env_key(&account.login);
            if let Ok(secret) = std::env::var(&env_key) {
                account.secret = Some(Secret::new(secret));
                continue;
            }
            let Some(ref secret_file) = account.secret_file else {
                return Err(common::Error::Config(format!(
                    "account {}: no secret found, set {} or secret_file",
                    account.login, env_key
                )));
            };
            let secret = std::fs::read_to_string(secret_file).map_err(|e| {
                common::Error::Config(format!(
                    "account {}: failed to read secret_file {}: {e}",
                    account.login,
                    secret_file.display()
                ))
            })?;
            let secret = secret.trim().to_owned();
            if secret.is_empty() {
                return Err(common::Error::Config(format!(
                    "account {}: secret_file {} is empty",
                    account.login,
                    secret_file.display()
                )));
            }
            account.secret = Some(Secret::new(secret));
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
        PathBuf::from("relayd.toml")
    }

    /// Engine configuration derived from the `[engine]` section.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            rate_limit: self.engine.rate_limit,
            pool_size: self.engine.pool_size,
            retry: RetryPolicy {
                retries: self.engine.retries,
                backoff: Duration::from_secs(self.engine.backoff_secs),
                backoff_limit: Duration::from_secs(self.engine.backoff_limit_secs),
            },
            cooldown: Duration::from_secs(self.engine.cooldown_secs),
            queue_capacity: self.engine.queue_capacity,
        }
    }

    /// Account credentials with resolved secrets. `load` guarantees every
    /// account has one.
    pub fn credentials(&self) -> Vec<AccountCredentials> {
        self.accounts
            .iter()
            .filter_map(|account| {
                account.secret.as_ref().map(|secret| AccountCredentials {
                    login: account.login.clone(),
                    secret: secret.clone(),
                })
            })
            .collect()
    }
}
