//! Relay routing policies.
//!
//! A router decides which relays receive a read and which receive a write.
//! Routers hold no connection state: the answer depends only on the filters
//! or event, the pool's configured relays and, for the outbox router, the
//! relay preferences cached in the [`OutboxModel`].

use crate::message::Filter;
use crate::outbox::OutboxModel;
use nostr::Event;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Relay URL to the filters sent to that relay.
pub type ReadRouting = BTreeMap<String, Vec<Filter>>;

pub trait RelayRouter: Send + Sync {
    /// Relays to query and the filters each receives.
    fn route_read(&self, filters: &[Filter], known_relays: &[String]) -> ReadRouting;

    /// Relays to publish `event` to, in priority order.
    fn route_write(&self, event: &Event, known_relays: &[String]) -> Vec<String>;
}

/// Same filters to every configured relay; writes to the first K.
#[derive(Debug, Clone)]
pub struct BroadcastRouter {
    write_redundancy: usize,
}

impl BroadcastRouter {
    pub fn new(write_redundancy: usize) -> Self {
        Self { write_redundancy }
    }
}

impl Default for BroadcastRouter {
    fn default() -> Self {
        Self::new(2)
    }
}

impl RelayRouter for BroadcastRouter {
    fn route_read(&self, filters: &[Filter], known_relays: &[String]) -> ReadRouting {
        known_relays
            .iter()
            .map(|url| (url.clone(), filters.to_vec()))
            .collect()
    }

    fn route_write(&self, _event: &Event, known_relays: &[String]) -> Vec<String> {
        known_relays
            .iter()
            .take(self.write_redundancy)
            .cloned()
            .collect()
    }
}

/// Routes toward the relays people declared in their NIP-65 lists.
///
/// Reads go to the write relays of the filters' authors and the read relays
/// of `#p` pubkeys. The configured set is added whenever someone's
/// preferences are unknown or the filters name nobody.
pub struct OutboxRouter {
    outbox: Arc<OutboxModel>,
    write_redundancy: usize,
    max_relays: usize,
}

impl OutboxRouter {
    pub fn new(outbox: Arc<OutboxModel>, write_redundancy: usize, max_relays: usize) -> Self {
        Self {
            outbox,
            write_redundancy,
            max_relays,
        }
    }

    pub fn outbox(&self) -> &Arc<OutboxModel> {
        &self.outbox
    }
}

fn push_unique(out: &mut Vec<String>, urls: impl IntoIterator<Item = String>) {
    for url in urls {
        if !out.contains(&url) {
            out.push(url);
        }
    }
}

fn unique_values<'a>(values: impl Iterator<Item = &'a String>) -> Vec<&'a String> {
    let mut out: Vec<&String> = Vec::new();
    for value in values {
        if !out.contains(&value) {
            out.push(value);
        }
    }
    out
}

impl RelayRouter for OutboxRouter {
    fn route_read(&self, filters: &[Filter], known_relays: &[String]) -> ReadRouting {
        let authors = unique_values(filters.iter().flat_map(|f| f.authors.iter().flatten()));
        let mentioned = unique_values(filters.iter().flat_map(|f| f.tag_values("p").into_iter().flatten()));

        let mut preferred: Vec<String> = Vec::new();
        let mut needs_default = authors.is_empty() && mentioned.is_empty();

        for author in &authors {
            match self.outbox.write_relays(author) {
                Some(relays) => push_unique(&mut preferred, relays),
                None => needs_default = true,
            }
        }
        for pubkey in &mentioned {
            match self.outbox.read_relays(pubkey) {
                Some(relays) => push_unique(&mut preferred, relays),
                None => needs_default = true,
            }
        }

        let mut selected: Vec<String> = Vec::new();
        if needs_default {
            push_unique(&mut selected, known_relays.iter().cloned());
        }
        let cap = self.max_relays.max(selected.len());
        push_unique(&mut selected, preferred);
        selected.truncate(cap);

        selected
            .into_iter()
            .map(|url| (url, filters.to_vec()))
            .collect()
    }

    fn route_write(&self, event: &Event, known_relays: &[String]) -> Vec<String> {
        let mut targets: Vec<String> = known_relays
            .iter()
            .take(self.write_redundancy)
            .cloned()
            .collect();

        if let Some(relays) = self.outbox.write_relays(&event.pubkey) {
            push_unique(&mut targets, relays);
        }
        for pubkey in unique_values(
            event
                .tags
                .iter()
                .filter(|t| t.len() >= 2 && t[0] == "p")
                .map(|t| &t[1]),
        ) {
            if let Some(relays) = self.outbox.read_relays(pubkey) {
                push_unique(&mut targets, relays);
            }
        }
        targets
    }
}
