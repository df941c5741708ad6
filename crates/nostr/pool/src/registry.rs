//! Per-role pool singletons.
//!
//! Applications talk to three pools: `default` for the user's own relays,
//! `discovery` for profile and relay-list lookups, and `outbox` for
//! author-directed routing. The registry builds each one on first use and
//! hands out the same instance until [`PoolRegistry::reset`].

use crate::config::PoolsConfig;
use crate::error::{PoolError, Result};
use crate::executor::QueryOptions;
use crate::message::Filter;
use crate::outbox::OutboxModel;
use crate::pool::RelayPool;
use crate::router::{BroadcastRouter, OutboxRouter, RelayRouter};
use crate::transport::{Transport, WebSocketTransport};
use nostr::{RELAY_LIST_METADATA_KIND, RelayListMetadata};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolRole {
    Default,
    Discovery,
    Outbox,
}

impl PoolRole {
    pub const ALL: [PoolRole; 3] = [PoolRole::Default, PoolRole::Discovery, PoolRole::Outbox];

    pub fn as_str(&self) -> &'static str {
        match self {
            PoolRole::Default => "default",
            PoolRole::Discovery => "discovery",
            PoolRole::Outbox => "outbox",
        }
    }
}

impl fmt::Display for PoolRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoolRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(PoolRole::Default),
            "discovery" => Ok(PoolRole::Discovery),
            "outbox" => Ok(PoolRole::Outbox),
            other => Err(format!("unknown pool role: {}", other)),
        }
    }
}

pub struct PoolRegistry {
    config: PoolsConfig,
    transport: Arc<dyn Transport>,
    outbox: Arc<OutboxModel>,
    pools: Mutex<HashMap<PoolRole, Arc<RelayPool>>>,
}

impl fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut built: Vec<PoolRole> = self.pools.lock().keys().copied().collect();
        built.sort();
        f.debug_struct("PoolRegistry").field("built", &built).finish_non_exhaustive()
    }
}

impl PoolRegistry {
    /// Registry speaking WebSocket to real relays.
    pub fn new(config: PoolsConfig) -> Result<Self> {
        Self::with_transport(config, Arc::new(WebSocketTransport))
    }

    pub fn with_transport(config: PoolsConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;

        let outbox = Arc::new(OutboxModel::new(Duration::from_secs(config.outbox_cache_ttl_secs)));
        if let Some(user) = &config.user
            && !user.relays.is_empty()
        {
            outbox.set_relay_list(user.pubkey.clone(), RelayListMetadata::new(user.relays.clone()));
        }

        Ok(Self {
            config,
            transport,
            outbox,
            pools: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &PoolsConfig {
        &self.config
    }

    /// Relay list cache behind the outbox pool's routing.
    pub fn outbox(&self) -> &Arc<OutboxModel> {
        &self.outbox
    }

    /// The pool for `role`, built on first call.
    pub fn get(&self, role: PoolRole) -> Result<Arc<RelayPool>> {
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get(&role) {
            return Ok(Arc::clone(pool));
        }

        let settings = self.config.settings_for(role).map_err(PoolError::from)?;
        let router: Arc<dyn RelayRouter> = match role {
            PoolRole::Outbox => Arc::new(OutboxRouter::new(
                Arc::clone(&self.outbox),
                self.config.write_redundancy,
                self.config.max_outbox_relays,
            )),
            PoolRole::Default | PoolRole::Discovery => {
                Arc::new(BroadcastRouter::new(self.config.write_redundancy))
            }
        };
        let pool = Arc::new(RelayPool::new(role, settings, router, Arc::clone(&self.transport))?);
        info!("Created {} pool with {} relays", role, pool.relay_urls().len());

        pools.insert(role, Arc::clone(&pool));
        Ok(pool)
    }

    pub fn default_pool(&self) -> Result<Arc<RelayPool>> {
        self.get(PoolRole::Default)
    }

    pub fn discovery_pool(&self) -> Result<Arc<RelayPool>> {
        self.get(PoolRole::Discovery)
    }

    pub fn outbox_pool(&self) -> Result<Arc<RelayPool>> {
        self.get(PoolRole::Outbox)
    }

    /// Fetch relay lists for `pubkeys` from the discovery pool into the
    /// outbox model. Returns how many cached lists changed.
    pub async fn fetch_relay_lists(&self, pubkeys: &[String], options: QueryOptions) -> Result<usize> {
        let unknown: Vec<String> = pubkeys
            .iter()
            .filter(|pk| !self.outbox.has_relay_list(pk))
            .cloned()
            .collect();
        if unknown.is_empty() {
            return Ok(0);
        }

        let filter = Filter::new()
            .kinds(vec![RELAY_LIST_METADATA_KIND])
            .authors(unknown);
        let events = self.discovery_pool()?.query(&[filter], options).await?;

        let mut updated = 0;
        for event in &events {
            match self.outbox.update_relay_list(event) {
                Ok(true) => updated += 1,
                Ok(false) => {}
                Err(e) => debug!("Ignoring relay list {}: {}", event.id, e),
            }
        }
        debug!("Fetched {} relay lists, {} updated", events.len(), updated);
        Ok(updated)
    }

    /// Roles whose pool currently exists.
    pub fn built_roles(&self) -> Vec<PoolRole> {
        let mut roles: Vec<PoolRole> = self.pools.lock().keys().copied().collect();
        roles.sort();
        roles
    }

    /// Tear down every pool. In-flight queries end with `Cancelled`; the
    /// next `get` builds fresh instances.
    pub fn reset(&self) {
        let drained: Vec<Arc<RelayPool>> = self.pools.lock().drain().map(|(_, pool)| pool).collect();
        if drained.is_empty() {
            return;
        }
        info!("Resetting {} pools", drained.len());
        for pool in drained {
            pool.shutdown();
        }
    }
}

impl Drop for PoolRegistry {
    fn drop(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserRelayPreferences;
    use crate::memory::MemoryTransport;
    use nostr::RelayEntry;

    fn registry() -> PoolRegistry {
        PoolRegistry::with_transport(PoolsConfig::default(), Arc::new(MemoryTransport::new())).unwrap()
    }

    #[test]
    fn test_role_parse_and_display() {
        for role in PoolRole::ALL {
            assert_eq!(role.to_string().parse::<PoolRole>().unwrap(), role);
        }
        assert_eq!("Outbox".parse::<PoolRole>().unwrap(), PoolRole::Outbox);
        assert!("primary".parse::<PoolRole>().is_err());
    }

    #[test]
    fn test_get_is_lazy_and_stable() {
        let registry = registry();
        assert!(registry.built_roles().is_empty());

        let first = registry.default_pool().unwrap();
        let second = registry.get(PoolRole::Default).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.built_roles(), vec![PoolRole::Default]);

        let discovery = registry.discovery_pool().unwrap();
        assert!(!Arc::ptr_eq(&first, &discovery));
        assert_eq!(discovery.role(), PoolRole::Discovery);
    }

    #[test]
    fn test_reset_builds_new_instances() {
        let registry = registry();
        let before = registry.outbox_pool().unwrap();
        registry.reset();

        assert!(before.is_shut_down());
        assert!(registry.built_roles().is_empty());
        let after = registry.outbox_pool().unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(!after.is_shut_down());
    }

    #[test]
    fn test_outbox_falls_back_to_default_relays() {
        let registry = registry();
        let outbox = registry.outbox_pool().unwrap();
        let default = registry.default_pool().unwrap();
        assert_eq!(outbox.relay_urls(), default.relay_urls());
    }

    #[test]
    fn test_user_relays_seed_outbox_model() {
        let config = PoolsConfig {
            user: Some(UserRelayPreferences {
                pubkey: "me".to_string(),
                relays: vec![RelayEntry::write("wss://mine.example")],
            }),
            ..PoolsConfig::default()
        };
        let registry = PoolRegistry::with_transport(config, Arc::new(MemoryTransport::new())).unwrap();
        assert_eq!(
            registry.outbox().write_relays("me").unwrap(),
            vec!["wss://mine.example"]
        );
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = PoolsConfig {
            default_relays: vec!["not a url".to_string()],
            ..PoolsConfig::default()
        };
        assert!(matches!(
            PoolRegistry::with_transport(config, Arc::new(MemoryTransport::new())),
            Err(PoolError::Config(_))
        ));
    }
}
