//! Configuration management for Keyward services

use config::{Config, ConfigError, Environment};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

/// Smallest RSA modulus accepted for signing keys
pub const MIN_RSA_BITS: usize = 2048;

/// Where the shared key object is kept
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process memory; key sets are lost on exit
    Memory,
    /// Encrypted files under `store_path`
    Local,
}

/// Kind of key created for a new key set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    #[serde(alias = "asymmetric_signing")]
    Rsa,
    #[serde(alias = "symmetric_aead", alias = "secretbox")]
    Aead,
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Console,
}

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KeywardConfig {
    pub store_backend: StoreBackend,
    pub store_path: String,
    /// Namespace of the backing object
    pub namespace: String,
    /// Name of the backing object
    pub object_name: String,
    /// Key set ensured at startup
    pub keyset: String,
    pub key_type: KeyKind,
    pub rsa_bits: usize,
    pub watch_backoff_secs: u64,
    pub poll_interval_ms: u64,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl KeywardConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        Self::from_vars(env::vars())
    }

    /// Load configuration from an explicit set of variables
    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();

        let config = Config::builder()
            .set_default("store_backend", "local")?
            .set_default("store_path", "./keyward-data")?
            .set_default("namespace", "keyward-system")?
            .set_default("object_name", "keyward-keys")?
            .set_default("keyset", "oidc-keys")?
            .set_default("key_type", "rsa")?
            .set_default("rsa_bits", MIN_RSA_BITS as u64)?
            .set_default("watch_backoff_secs", 10u64)?
            .set_default("poll_interval_ms", 1000u64)?
            .set_default("log_level", "info")?
            .set_default("log_format", "json")?
            .add_source(
                Environment::with_prefix("KEYWARD")
                    .try_parsing(true)
                    .source(Some(vars.clone())),
            )
            .set_override_option("log_level", vars.get("LOG_LEVEL").cloned())?
            .set_override_option("log_format", vars.get("LOG_FORMAT").cloned())?
            .build()?;

        let loaded: Self = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.rsa_bits < MIN_RSA_BITS {
            return Err(ConfigError::Message(format!(
                "KEYWARD_RSA_BITS must be at least {}, got {}",
                MIN_RSA_BITS, self.rsa_bits
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Message(
                "KEYWARD_POLL_INTERVAL_MS must be positive".to_string(),
            ));
        }
        for (var, value) in [
            ("KEYWARD_NAMESPACE", &self.namespace),
            ("KEYWARD_OBJECT_NAME", &self.object_name),
            ("KEYWARD_KEYSET", &self.keyset),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Message(format!("{} must not be empty", var)));
            }
        }
        Ok(())
    }

    pub fn watch_backoff(&self) -> Duration {
        Duration::from_secs(self.watch_backoff_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Get log level, defaulting to "info"
    pub fn log_level(&self) -> &str {
        if self.log_level.is_empty() {
            "info"
        } else {
            &self.log_level
        }
    }
}
