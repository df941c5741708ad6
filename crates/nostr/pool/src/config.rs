//! Pool configuration.
//!
//! Read from a JSON file (camelCase keys, every key optional). The binary
//! looks for the file at `$NOSTR_POOL_CONFIG` unless given `--config`.

use crate::pool::PoolSettings;
use crate::registry::PoolRole;
use crate::relay::{ConnectionConfig, ReconnectPolicy};
use crate::url::normalize_relay_url;
use nostr::RelayEntry;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "NOSTR_POOL_CONFIG";

/// Default relay list
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
    "wss://nostr.wine",
];

/// Relays that index profiles and relay lists
pub const DEFAULT_DISCOVERY_RELAYS: &[&str] = &[
    "wss://purplepag.es",
    "wss://relay.nostr.band",
    "wss://relay.damus.io",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// 0 = unlimited
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            max_attempts: 0,
        }
    }
}

/// The signed-in user's own relay list, seeded into the outbox model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserRelayPreferences {
    pub pubkey: String,
    #[serde(default)]
    pub relays: Vec<RelayEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolsConfig {
    pub default_relays: Vec<String>,
    pub discovery_relays: Vec<String>,
    /// Falls back to `default_relays` when empty
    pub outbox_relays: Vec<String>,
    /// How many configured relays receive every publish
    pub write_redundancy: usize,
    pub query_timeout_ms: u64,
    pub publish_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub reconnect: ReconnectConfig,
    pub verify_signatures: bool,
    /// Cap on relays an outbox read fans out to
    pub max_outbox_relays: usize,
    pub outbox_cache_ttl_secs: u64,
    pub user: Option<UserRelayPreferences>,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            default_relays: DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect(),
            discovery_relays: DEFAULT_DISCOVERY_RELAYS.iter().map(|s| s.to_string()).collect(),
            outbox_relays: Vec::new(),
            write_redundancy: 2,
            query_timeout_ms: 5_000,
            publish_timeout_ms: 3_000,
            connect_timeout_ms: 10_000,
            reconnect: ReconnectConfig::default(),
            verify_signatures: true,
            max_outbox_relays: 8,
            outbox_cache_ttl_secs: 3_600,
            user: None,
        }
    }
}

impl PoolsConfig {
    /// Check limits and every relay URL.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.write_redundancy == 0 {
            return Err(ConfigError::Invalid("writeRedundancy must be at least 1".into()));
        }
        if self.query_timeout_ms == 0 || self.publish_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be greater than zero".into()));
        }
        if self.max_outbox_relays == 0 {
            return Err(ConfigError::Invalid("maxOutboxRelays must be at least 1".into()));
        }

        let user_relays = self.user.iter().flat_map(|u| u.relays.iter().map(|r| &r.url));
        for url in self
            .default_relays
            .iter()
            .chain(&self.discovery_relays)
            .chain(&self.outbox_relays)
            .chain(user_relays)
        {
            normalize_relay_url(url)
                .map_err(|e| ConfigError::Invalid(format!("relay {}: {}", url, e)))?;
        }
        Ok(())
    }

    /// Configured relay set for a role.
    pub fn relays_for(&self, role: PoolRole) -> &[String] {
        match role {
            PoolRole::Default => &self.default_relays,
            PoolRole::Discovery => &self.discovery_relays,
            PoolRole::Outbox if self.outbox_relays.is_empty() => &self.default_relays,
            PoolRole::Outbox => &self.outbox_relays,
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        let reconnect = self.reconnect.enabled.then(|| ReconnectPolicy {
            initial_delay: Duration::from_millis(self.reconnect.initial_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            max_attempts: self.reconnect.max_attempts,
        });
        ConnectionConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            reconnect,
            ..ConnectionConfig::default()
        }
    }

    pub fn settings_for(&self, role: PoolRole) -> Result<PoolSettings, ConfigError> {
        let relays = self.relays_for(role);
        if relays.is_empty() {
            return Err(ConfigError::Invalid(format!("no relays configured for {} pool", role)));
        }
        Ok(PoolSettings {
            relays: relays.to_vec(),
            query_timeout: Duration::from_millis(self.query_timeout_ms),
            publish_timeout: Duration::from_millis(self.publish_timeout_ms),
            verify_signatures: self.verify_signatures,
            connection: self.connection_config(),
        })
    }
}

/// Load and validate a config file.
pub fn load_config(path: impl AsRef<Path>) -> Result<PoolsConfig, ConfigError> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: PoolsConfig = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

/// Config path from `$NOSTR_POOL_CONFIG`, if set and non-empty.
pub fn config_path_from_env() -> Option<PathBuf> {
    std::env::var_os(CONFIG_ENV_VAR)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}
