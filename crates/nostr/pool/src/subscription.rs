//! Subscription records for in-flight queries.

use crate::message::Filter;
use nostr::Event;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Generate a unique subscription ID.
pub fn generate_subscription_id() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

/// What a relay connection delivers to one subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionMessage {
    Event(Event),
    Eose,
    /// The relay ended the subscription with a reason.
    Closed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// REQ frames are being sent
    Open,
    /// Waiting for end-of-stored-events from at least one relay
    AwaitingEose,
    Closed,
}

/// One query's subscription across the relays it was routed to.
///
/// Every relay gets the same subscription id.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub filters: Vec<Filter>,
    pub relays: Vec<String>,
    pub state: SubscriptionState,
    /// Relays that have sent EOSE
    pub eose_relays: BTreeSet<String>,
}

impl Subscription {
    pub fn new(id: impl Into<String>, filters: Vec<Filter>, relays: Vec<String>) -> Self {
        Self {
            id: id.into(),
            filters,
            relays,
            state: SubscriptionState::Open,
            eose_relays: BTreeSet::new(),
        }
    }

    /// Record EOSE from a relay.
    pub fn mark_eose(&mut self, relay_url: &str) {
        if self.relays.iter().any(|r| r == relay_url) {
            self.eose_relays.insert(relay_url.to_string());
        }
    }

    /// Whether every routed relay has sent EOSE.
    pub fn all_eose(&self) -> bool {
        !self.relays.is_empty() && self.relays.iter().all(|r| self.eose_relays.contains(r))
    }

    /// Relays still expected to send EOSE.
    pub fn pending_relays(&self) -> Vec<String> {
        self.relays
            .iter()
            .filter(|r| !self.eose_relays.contains(*r))
            .cloned()
            .collect()
    }
}
