//! Outbox model for relay selection
//!
//! Caches NIP-65 relay lists so routing can follow where people actually
//! publish:
//! - Events FROM a user are fetched from their WRITE relays
//! - Events ABOUT a user (mentions) are fetched from their READ relays
//! - A published event goes to the author's WRITE relays and to the READ
//!   relays of every tagged user

use crate::error::{PoolError, Result};
use crate::url::normalize_relay_url;
use nostr::{Event, RELAY_LIST_METADATA_KIND, RelayListMetadata};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct CacheEntry {
    metadata: RelayListMetadata,
    /// `created_at` of the event the list came from; 0 for seeded lists
    created_at: u64,
    /// `None` never expires
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_fresh(&self) -> bool {
        self.expires_at.is_none_or(|at| Instant::now() < at)
    }
}

/// Relay list cache keyed by pubkey
#[derive(Debug)]
pub struct OutboxModel {
    cache_ttl: Duration,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl Default for OutboxModel {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}

impl OutboxModel {
    pub fn new(cache_ttl: Duration) -> Self {
        Self {
            cache_ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Record a kind 10002 event. Older lists than the one cached are ignored.
    ///
    /// Returns whether the cache changed.
    pub fn update_relay_list(&self, event: &Event) -> Result<bool> {
        if event.kind != RELAY_LIST_METADATA_KIND {
            return Err(PoolError::InvalidEvent(format!(
                "expected kind {}, got {}",
                RELAY_LIST_METADATA_KIND, event.kind
            )));
        }
        let metadata = RelayListMetadata::from_event(event)
            .map_err(|e| PoolError::InvalidEvent(e.to_string()))?;

        let mut cache = self.cache.write();
        if let Some(existing) = cache.get(&event.pubkey)
            && existing.is_fresh()
            && existing.created_at > event.created_at
        {
            debug!("Ignoring older relay list for {}", event.pubkey);
            return Ok(false);
        }

        cache.insert(
            event.pubkey.clone(),
            CacheEntry {
                metadata,
                created_at: event.created_at,
                expires_at: Some(Instant::now() + self.cache_ttl),
            },
        );
        Ok(true)
    }

    /// Seed a relay list from configuration. Seeded lists never expire but
    /// are replaced by any relay list event for the same pubkey.
    pub fn set_relay_list(&self, pubkey: impl Into<String>, metadata: RelayListMetadata) {
        self.cache.write().insert(
            pubkey.into(),
            CacheEntry {
                metadata,
                created_at: 0,
                expires_at: None,
            },
        );
    }

    /// Write relays for a user (where to download their events from).
    ///
    /// `None` when nothing fresh is known or the list names no write relay.
    pub fn write_relays(&self, pubkey: &str) -> Option<Vec<String>> {
        self.relays_for(pubkey, RelayListMetadata::write_relays)
    }

    /// Read relays for a user (where mentions of them are fetched and sent).
    pub fn read_relays(&self, pubkey: &str) -> Option<Vec<String>> {
        self.relays_for(pubkey, RelayListMetadata::read_relays)
    }

    fn relays_for(
        &self,
        pubkey: &str,
        select: fn(&RelayListMetadata) -> Vec<String>,
    ) -> Option<Vec<String>> {
        let cache = self.cache.read();
        let entry = cache.get(pubkey).filter(|e| e.is_fresh())?;

        let mut relays: Vec<String> = Vec::new();
        for raw in select(&entry.metadata) {
            match normalize_relay_url(&raw) {
                Ok(url) if !relays.contains(&url) => relays.push(url),
                Ok(_) => {}
                Err(e) => debug!("Skipping relay {} listed by {}: {}", raw, pubkey, e),
            }
        }
        (!relays.is_empty()).then_some(relays)
    }

    /// Check if we have a fresh relay list for a user
    pub fn has_relay_list(&self, pubkey: &str) -> bool {
        self.cache.read().get(pubkey).is_some_and(CacheEntry::is_fresh)
    }

    pub fn remove(&self, pubkey: &str) -> bool {
        self.cache.write().remove(pubkey).is_some()
    }

    pub fn clear(&self) {
        self.cache.write().clear();
    }

    /// Drop expired entries
    pub fn prune_expired(&self) -> usize {
        let mut cache = self.cache.write();
        let before = cache.len();
        cache.retain(|_, entry| entry.is_fresh());
        before - cache.len()
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr::RelayEntry;

    fn relay_list(pubkey: &str, created_at: u64, tags: &[&[&str]]) -> Event {
        Event {
            id: format!("id-{}", created_at),
            pubkey: pubkey.to_string(),
            created_at,
            kind: RELAY_LIST_METADATA_KIND,
            tags: tags
                .iter()
                .map(|t| t.iter().map(|s| s.to_string()).collect())
                .collect(),
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn test_update_and_lookup() {
        let model = OutboxModel::default();
        let event = relay_list(
            "alice",
            10,
            &[
                &["r", "wss://Write.example/", "write"],
                &["r", "wss://read.example", "read"],
                &["r", "wss://both.example"],
            ],
        );
        assert!(model.update_relay_list(&event).unwrap());

        assert_eq!(
            model.write_relays("alice").unwrap(),
            vec!["wss://write.example", "wss://both.example"]
        );
        assert_eq!(
            model.read_relays("alice").unwrap(),
            vec!["wss://read.example", "wss://both.example"]
        );
        assert!(model.write_relays("bob").is_none());
    }

    #[test]
    fn test_rejects_wrong_kind() {
        let model = OutboxModel::default();
        let mut event = relay_list("alice", 1, &[]);
        event.kind = 1;
        assert!(model.update_relay_list(&event).is_err());
    }

    #[test]
    fn test_newer_list_wins() {
        let model = OutboxModel::default();
        model
            .update_relay_list(&relay_list("alice", 20, &[&["r", "wss://new.example"]]))
            .unwrap();
        let changed = model
            .update_relay_list(&relay_list("alice", 10, &[&["r", "wss://old.example"]]))
            .unwrap();

        assert!(!changed);
        assert_eq!(model.write_relays("alice").unwrap(), vec!["wss://new.example"]);
    }

    #[test]
    fn test_seeded_list_replaced_by_event() {
        let model = OutboxModel::default();
        model.set_relay_list(
            "alice",
            RelayListMetadata::new(vec![RelayEntry::write("wss://seed.example")]),
        );
        assert_eq!(model.write_relays("alice").unwrap(), vec!["wss://seed.example"]);

        model
            .update_relay_list(&relay_list("alice", 1, &[&["r", "wss://event.example"]]))
            .unwrap();
        assert_eq!(model.write_relays("alice").unwrap(), vec!["wss://event.example"]);
    }

    #[test]
    fn test_list_without_write_relays_is_unknown() {
        let model = OutboxModel::default();
        model
            .update_relay_list(&relay_list(
                "alice",
                1,
                &[&["r", "wss://read.example", "read"], &["r", "https://bad.example"]],
            ))
            .unwrap();
        assert!(model.write_relays("alice").is_none());
        assert!(model.has_relay_list("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let model = OutboxModel::new(Duration::from_secs(60));
        model
            .update_relay_list(&relay_list("alice", 1, &[&["r", "wss://a.example"]]))
            .unwrap();
        model.set_relay_list("me", RelayListMetadata::new(vec![RelayEntry::read_write("wss://me.example")]));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!model.has_relay_list("alice"));
        assert!(model.write_relays("alice").is_none());
        assert!(model.has_relay_list("me"));
        assert_eq!(model.prune_expired(), 1);
        assert_eq!(model.len(), 1);
    }
}
