//! NIP-65: Relay List Metadata
//!
//! Kind 10002 advertises the relays a user writes to and the relays where the
//! user reads mentions. Outbox-aware routing reads these preferences.
//!
//! See: <https://github.com/nostr-protocol/nips/blob/master/65.md>

use crate::nip01::{Event, EventTemplate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Event kind for relay list metadata
pub const RELAY_LIST_METADATA_KIND: u16 = 10002;

/// Tag name for relay entries
pub const RELAY_TAG: &str = "r";

#[derive(Debug, Error)]
pub enum Nip65Error {
    #[error("event is not a relay list metadata event (kind {0})")]
    InvalidKind(u16),

    #[error("invalid relay tag format: {0}")]
    InvalidTag(String),
}

/// How a relay in a relay list is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMarker {
    Read,
    Write,
    #[default]
    #[serde(rename = "readwrite")]
    ReadWrite,
}

impl RelayMarker {
    /// Parse the optional third element of an `r` tag. Anything other than
    /// `read` or `write` means both.
    pub fn from_tag_value(value: Option<&str>) -> Self {
        match value {
            Some("read") => RelayMarker::Read,
            Some("write") => RelayMarker::Write,
            _ => RelayMarker::ReadWrite,
        }
    }

    fn as_tag_value(self) -> Option<&'static str> {
        match self {
            RelayMarker::Read => Some("read"),
            RelayMarker::Write => Some("write"),
            RelayMarker::ReadWrite => None,
        }
    }

    pub fn can_read(self) -> bool {
        matches!(self, RelayMarker::Read | RelayMarker::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        matches!(self, RelayMarker::Write | RelayMarker::ReadWrite)
    }
}

/// A relay entry in a relay list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEntry {
    pub url: String,
    #[serde(default)]
    pub marker: RelayMarker,
}

impl RelayEntry {
    pub fn new(url: impl Into<String>, marker: RelayMarker) -> Self {
        Self {
            url: url.into(),
            marker,
        }
    }

    pub fn read_write(url: impl Into<String>) -> Self {
        Self::new(url, RelayMarker::ReadWrite)
    }

    pub fn read(url: impl Into<String>) -> Self {
        Self::new(url, RelayMarker::Read)
    }

    pub fn write(url: impl Into<String>) -> Self {
        Self::new(url, RelayMarker::Write)
    }
}

/// A user's relay list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayListMetadata {
    pub relays: Vec<RelayEntry>,
}

impl RelayListMetadata {
    pub fn new(relays: Vec<RelayEntry>) -> Self {
        Self { relays }
    }

    /// Parse the `r` tags of a kind 10002 event.
    pub fn from_event(event: &Event) -> Result<Self, Nip65Error> {
        if event.kind != RELAY_LIST_METADATA_KIND {
            return Err(Nip65Error::InvalidKind(event.kind));
        }

        let mut relays = Vec::new();
        for tag in &event.tags {
            if tag.first().map(String::as_str) != Some(RELAY_TAG) {
                continue;
            }
            let Some(url) = tag.get(1) else {
                return Err(Nip65Error::InvalidTag(
                    "relay tag must have at least URL".to_string(),
                ));
            };
            relays.push(RelayEntry::new(
                url.clone(),
                RelayMarker::from_tag_value(tag.get(2).map(String::as_str)),
            ));
        }

        Ok(Self { relays })
    }

    /// Relays the user reads mentions from, in list order.
    pub fn read_relays(&self) -> Vec<String> {
        self.relays
            .iter()
            .filter(|r| r.marker.can_read())
            .map(|r| r.url.clone())
            .collect()
    }

    /// Relays the user publishes to, in list order.
    pub fn write_relays(&self) -> Vec<String> {
        self.relays
            .iter()
            .filter(|r| r.marker.can_write())
            .map(|r| r.url.clone())
            .collect()
    }

    /// Build the kind 10002 template advertising this list.
    pub fn to_template(&self) -> EventTemplate {
        let mut template = EventTemplate::new(RELAY_LIST_METADATA_KIND, "");
        for entry in &self.relays {
            let mut tag = vec![RELAY_TAG.to_string(), entry.url.clone()];
            if let Some(marker) = entry.marker.as_tag_value() {
                tag.push(marker.to_string());
            }
            template.tags.push(tag);
        }
        template
    }
}
