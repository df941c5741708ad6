//! Pool error types

use crate::config::ConfigError;
use crate::message::MessageError;
use crate::pool::RelayPublishResult;
use std::time::Duration;
use thiserror::Error;

/// Pool error type
#[derive(Error, Debug)]
pub enum PoolError {
    /// Invalid relay URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Transport-level failure (socket, handshake)
    #[error("Transport error: {0}")]
    Transport(String),

    /// A send was attempted while the relay connection was not open
    #[error("Not connected to relay")]
    NotConnected,

    /// The connection was closed while an operation was waiting on it
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Timeout waiting on a single relay
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// No relay in the routed set could be reached
    #[error("No relay available: {0}")]
    ConnectionUnavailable(String),

    /// The query deadline fired before any relay completed and nothing was found
    #[error("Query timed out after {0:?} with no relay completing")]
    AggregateTimeout(Duration),

    /// The query was cancelled by the caller or by pool shutdown
    #[error("Query cancelled")]
    Cancelled,

    /// Every routed relay rejected the event or failed to acknowledge it
    #[error("Event {event_id} rejected by all {} relays", results.len())]
    PublishRejectedByAll {
        event_id: String,
        results: Vec<RelayPublishResult>,
    },

    /// Event failed local validation before publishing
    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    /// Wire message error
    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Signing through the external signer failed
    #[error("Signer error: {0}")]
    Signer(#[from] nostr::SignerError),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Pool result type
pub type Result<T> = std::result::Result<T, PoolError>;
