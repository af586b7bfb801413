//! Configuration for the custody ledger

use crate::crypto::{HashSigner, SigningKey, DEFAULT_BALANCE_SCALE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Signing configuration
    pub signing: SigningConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Default caller deadline for ledger operations (milliseconds)
    pub operation_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "custody-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            signing: SigningConfig::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            operation_timeout_ms: 5_000,
        }
    }
}

/// Signing configuration
///
/// Exactly one of `key` and `key_hex` should be set. The key belongs in the
/// environment or a secrets file, never in the database it protects.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    /// Raw key material
    pub key: Option<String>,

    /// Hex-encoded key material
    pub key_hex: Option<String>,

    /// Decimal places balances are fixed to before signing
    pub balance_scale: u32,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            key: None,
            key_hex: None,
            balance_scale: DEFAULT_BALANCE_SCALE,
        }
    }
}

impl std::fmt::Debug for SigningConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningConfig")
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("key_hex", &self.key_hex.as_ref().map(|_| "<redacted>"))
            .field("balance_scale", &self.balance_scale)
            .finish()
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Connection URL
    pub url: String,

    /// Pool size
    pub max_connections: u32,

    /// Pool acquire timeout (seconds)
    pub acquire_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/custody".to_string(),
            max_connections: 10,
            acquire_timeout_secs: 30,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive
    pub filter: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(key) = std::env::var("LEDGER_WALLET_KEY") {
            config.signing.key = Some(key);
        }

        if let Ok(key) = std::env::var("LEDGER_WALLET_KEY_HEX") {
            config.signing.key_hex = Some(key);
        }

        if let Ok(scale) = std::env::var("LEDGER_BALANCE_SCALE") {
            config.signing.balance_scale = parse_var("LEDGER_BALANCE_SCALE", &scale)?;
        }

        if let Ok(url) = std::env::var("LEDGER_DATABASE_URL") {
            config.database.url = url;
        }

        if let Ok(max) = std::env::var("LEDGER_DB_MAX_CONNECTIONS") {
            config.database.max_connections = parse_var("LEDGER_DB_MAX_CONNECTIONS", &max)?;
        }

        if let Ok(filter) = std::env::var("LEDGER_LOG") {
            config.logging.filter = filter;
        }

        if let Ok(json) = std::env::var("LEDGER_LOG_JSON") {
            config.logging.json = parse_var("LEDGER_LOG_JSON", &json)?;
        }

        if let Ok(timeout) = std::env::var("LEDGER_OPERATION_TIMEOUT_MS") {
            config.operation_timeout_ms = parse_var("LEDGER_OPERATION_TIMEOUT_MS", &timeout)?;
        }

        Ok(config)
    }

    /// Build the signing key
    pub fn signing_key(&self) -> crate::Result<SigningKey> {
        match (&self.signing.key, &self.signing.key_hex) {
            (Some(_), Some(_)) => Err(crate::Error::Config(
                "set either signing.key or signing.key_hex, not both".to_string(),
            )),
            (Some(raw), None) => SigningKey::from_bytes(raw.as_bytes()),
            (None, Some(encoded)) => SigningKey::from_hex(encoded),
            (None, None) => Err(crate::Error::Config(
                "no signing key configured (LEDGER_WALLET_KEY or LEDGER_WALLET_KEY_HEX)"
                    .to_string(),
            )),
        }
    }

    /// Build the hash signer
    pub fn signer(&self) -> crate::Result<HashSigner> {
        Ok(HashSigner::new(self.signing_key()?)?.with_balance_scale(self.signing.balance_scale))
    }

    /// Caller deadline for ledger operations
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> crate::Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| crate::Error::Config(format!("{} is invalid: {}", name, e)))
}
